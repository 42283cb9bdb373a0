//! Background loops: daily counter resets, offline reconciliation and the
//! nightly statistics calibration. Each loop owns its own interval and logs
//! failures without dying.

pub mod calibration;
pub mod offline;
pub mod reset;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ws::hub::Notifier;
use crate::ws::registry::ConnectionRegistry;

/// Reset instants have minute granularity, so the pass runs once a minute.
pub const RESET_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Offline reconciliation cadence.
pub const OFFLINE_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Local hour at which the nightly calibration runs.
pub const CALIBRATION_HOUR: u32 = 3;

/// Calibration fires once per local day, at or after the configured hour.
fn calibration_due(now: NaiveDateTime, last_run: Option<NaiveDate>) -> bool {
    now.hour() >= CALIBRATION_HOUR && last_run != Some(now.date())
}

/// Spawns all three loops. The handles are only joined at shutdown.
pub fn spawn_all(
    pool: PgPool,
    registry: Arc<ConnectionRegistry>,
    notifier: Notifier,
) -> Vec<JoinHandle<()>> {
    let reset_handle = {
        let pool = pool.clone();
        let notifier = notifier.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RESET_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                reset::tick(&pool, &notifier).await;
            }
        })
    };

    let offline_handle = {
        let pool = pool.clone();
        let registry = Arc::clone(&registry);
        let notifier = notifier.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(OFFLINE_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                offline::tick(&pool, &registry, &notifier).await;
            }
        })
    };

    let calibration_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_run: Option<NaiveDate> = None;
        loop {
            ticker.tick().await;
            let now = Local::now().naive_local();
            if calibration_due(now, last_run) {
                calibration::tick(&pool).await;
                last_run = Some(now.date());
            }
        }
    });

    vec![reset_handle, offline_handle, calibration_handle]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(date: (i32, u32, u32), hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn calibration_waits_for_the_configured_hour() {
        assert!(!calibration_due(at((2026, 8, 20), 2), None));
        assert!(calibration_due(at((2026, 8, 20), 3), None));
    }

    #[test]
    fn calibration_runs_once_per_day() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 20).unwrap();
        assert!(!calibration_due(at((2026, 8, 20), 4), Some(today)));
        assert!(calibration_due(at((2026, 8, 21), 3), Some(today)));
    }

    #[test]
    fn late_start_still_calibrates() {
        // Process started after 03:00; the first eligible tick runs it.
        assert!(calibration_due(at((2026, 8, 20), 17), None));
    }
}
