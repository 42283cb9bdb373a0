use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::db::services::{device_service, group_service, stats_service};
use crate::web::AppError;
use crate::ws::hub::Notifier;

/// Groups and devices without an explicit instant reset at 09:00 local.
pub const DEFAULT_RESET_TIME: NaiveTime = match NaiveTime::from_hms_opt(9, 0, 0) {
    Some(t) => t,
    None => unreachable!(),
};

/// Parses a configured `HH:MM:SS` (or `HH:MM`) reset instant. Empty or
/// malformed values fall back to the default rather than wedging the group.
pub fn parse_reset_instant(raw: &str) -> NaiveTime {
    let raw = raw.trim();
    if raw.is_empty() {
        return DEFAULT_RESET_TIME;
    }
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .unwrap_or(DEFAULT_RESET_TIME)
}

/// Whether the "today" counters are due for a reset at `now` (local wall
/// clock).
///
/// Due when the configured instant has passed and either the counters have
/// never been reset, were last reset on an earlier day, or were last reset
/// today but before today's instant. The last case covers an operator moving
/// the instant later in the day: the earlier reset no longer counts and the
/// counters reset again at the new instant.
pub fn should_reset(
    now: NaiveDateTime,
    reset_time: NaiveTime,
    last_reset_date: Option<NaiveDate>,
    last_reset_at: Option<NaiveDateTime>,
) -> bool {
    let today_reset = now.date().and_time(reset_time);
    if now < today_reset {
        return false;
    }
    match (last_reset_date, last_reset_at) {
        (_, None) | (None, _) => true,
        (Some(date), Some(_)) if date != now.date() => true,
        (Some(_), Some(at)) => at < today_reset,
    }
}

fn to_local_naive(instant: Option<DateTime<Utc>>) -> Option<NaiveDateTime> {
    instant.map(|t| t.with_timezone(&Local).naive_local())
}

/// One reset pass: every group (with its non-overriding devices) against its
/// configured instant, then every override-carrying device against its own.
pub async fn run_once(pool: &PgPool, notifier: &Notifier) -> Result<usize, AppError> {
    let now_local = Local::now().naive_local();
    let now = Utc::now();
    let today = now_local.date();
    let mut resets = 0usize;

    for group in group_service::list_groups(pool).await? {
        let instant = parse_reset_instant(&group.reset_time);
        let stats = stats_service::get_group_stats(pool, group.id).await?;
        let due = match &stats {
            Some(s) => should_reset(
                now_local,
                instant,
                s.last_reset_date,
                to_local_naive(s.last_reset_at),
            ),
            // No counter row yet means nothing to reset.
            None => false,
        };
        if !due {
            continue;
        }

        stats_service::reset_group_stats(pool, group.id, today, now).await?;
        for device in
            device_service::list_group_devices_without_reset_override(pool, group.id).await?
        {
            stats_service::reset_device_stats(pool, device.id, today, now).await?;
        }
        info!(group_id = group.id, "daily counters reset");
        notifier.broadcast_group_stats(group.id).await;
        resets += 1;
    }

    for device in device_service::list_devices_with_reset_override(pool).await? {
        let raw = device.reset_time.as_deref().unwrap_or_default();
        let instant = parse_reset_instant(raw);
        let stats = match stats_service::get_device_stats(pool, device.id).await? {
            Some(s) => s,
            None => continue,
        };
        if should_reset(
            now_local,
            instant,
            stats.last_reset_date,
            to_local_naive(stats.last_reset_at),
        ) {
            stats_service::reset_device_stats(pool, device.id, today, now).await?;
            info!(device_id = device.id, "device counters reset (override)");
            resets += 1;
        }
    }

    if resets > 0 {
        info!(resets, "reset pass applied");
    }
    Ok(resets)
}

/// Logs instead of propagating so one bad pass never kills the loop.
pub async fn tick(pool: &PgPool, notifier: &Notifier) {
    if let Err(e) = run_once(pool, notifier).await {
        warn!(error = %e, "reset pass failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(date: (i32, u32, u32), time: (u32, u32, u32)) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_hms_opt(time.0, time.1, time.2)
            .unwrap()
    }

    const NINE: NaiveTime = DEFAULT_RESET_TIME;

    #[test]
    fn parse_accepts_both_formats_and_defaults() {
        assert_eq!(parse_reset_instant("22:30:00"), NaiveTime::from_hms_opt(22, 30, 0).unwrap());
        assert_eq!(parse_reset_instant("22:30"), NaiveTime::from_hms_opt(22, 30, 0).unwrap());
        assert_eq!(parse_reset_instant(""), NINE);
        assert_eq!(parse_reset_instant("half past nine"), NINE);
    }

    #[test]
    fn never_reset_waits_for_the_instant() {
        assert!(!should_reset(dt((2026, 8, 20), (8, 59, 59)), NINE, None, None));
        assert!(should_reset(dt((2026, 8, 20), (9, 0, 0)), NINE, None, None));
    }

    #[test]
    fn stale_reset_date_triggers_after_the_instant() {
        let yesterday = NaiveDate::from_ymd_opt(2026, 8, 19).unwrap();
        let last = dt((2026, 8, 19), (9, 0, 1));
        assert!(!should_reset(
            dt((2026, 8, 20), (7, 0, 0)),
            NINE,
            Some(yesterday),
            Some(last)
        ));
        assert!(should_reset(
            dt((2026, 8, 20), (9, 0, 0)),
            NINE,
            Some(yesterday),
            Some(last)
        ));
    }

    #[test]
    fn same_day_reset_does_not_repeat() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 20).unwrap();
        let last = dt((2026, 8, 20), (9, 0, 2));
        assert!(!should_reset(
            dt((2026, 8, 20), (15, 0, 0)),
            NINE,
            Some(today),
            Some(last)
        ));
    }

    #[test]
    fn instant_moved_later_resets_again_the_same_day() {
        // Reset happened at 09:00, then the instant was moved to 14:00.
        let today = NaiveDate::from_ymd_opt(2026, 8, 20).unwrap();
        let two_pm = NaiveTime::from_hms_opt(14, 0, 0).unwrap();
        let last = dt((2026, 8, 20), (9, 0, 2));
        assert!(!should_reset(
            dt((2026, 8, 20), (13, 59, 0)),
            two_pm,
            Some(today),
            Some(last)
        ));
        assert!(should_reset(
            dt((2026, 8, 20), (14, 0, 0)),
            two_pm,
            Some(today),
            Some(last)
        ));
    }

    #[test]
    fn instant_moved_earlier_does_not_double_reset() {
        // Reset happened at 14:00, then the instant was moved back to 09:00.
        let today = NaiveDate::from_ymd_opt(2026, 8, 20).unwrap();
        let last = dt((2026, 8, 20), (14, 0, 1));
        assert!(!should_reset(
            dt((2026, 8, 20), (16, 0, 0)),
            NINE,
            Some(today),
            Some(last)
        ));
    }
}
