use chrono::{DateTime, Local, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::db::services::{device_service, event_service, group_service, stats_service};
use crate::db::services::stats_service::CalibratedCounters;
use crate::web::AppError;

/// Start of the local calendar day, as a UTC instant. "Today" counters are
/// defined against local midnight, matching the reset schedule's wall clock.
fn today_start() -> DateTime<Utc> {
    let midnight = Local::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default();
    match midnight.and_local_timezone(Local) {
        chrono::LocalResult::Single(t) | chrono::LocalResult::Ambiguous(t, _) => {
            t.with_timezone(&Utc)
        }
        chrono::LocalResult::None => Utc::now(),
    }
}

/// Full recount: derives every counter from the event log and the device
/// table, then overwrites the rolling rows. Drift accumulated from crashes
/// or manual data edits disappears here.
pub async fn run_once(pool: &PgPool) -> Result<usize, AppError> {
    let since = today_start();
    let today = Local::now().date_naive();
    let now = Utc::now();
    let mut calibrated = 0usize;

    for group in group_service::list_groups(pool).await? {
        let counters = CalibratedCounters {
            total: event_service::count_group_events(pool, group.id, false, None).await? as i32,
            today_total: event_service::count_group_events(pool, group.id, false, Some(since))
                .await? as i32,
            duplicate_total: event_service::count_group_events(pool, group.id, true, None).await?
                as i32,
            today_duplicate: event_service::count_group_events(pool, group.id, true, Some(since))
                .await? as i32,
        };

        let total_devices: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM devices WHERE group_id = $1 AND deleted_at IS NULL",
        )
        .bind(group.id)
        .fetch_one(pool)
        .await?;
        let online_devices: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM devices \
             WHERE group_id = $1 AND deleted_at IS NULL AND online_status = 'online'",
        )
        .bind(group.id)
        .fetch_one(pool)
        .await?;

        stats_service::overwrite_group_stats(
            pool,
            group.id,
            counters,
            total_devices as i32,
            online_devices as i32,
            today,
            now,
        )
        .await?;

        calibrated += 1;
    }

    for device in device_service::list_devices(pool).await? {
        let counters = CalibratedCounters {
            total: event_service::count_device_events(pool, device.id, false, None).await? as i32,
            today_total: event_service::count_device_events(pool, device.id, false, Some(since))
                .await? as i32,
            duplicate_total: event_service::count_device_events(pool, device.id, true, None)
                .await? as i32,
            today_duplicate: event_service::count_device_events(pool, device.id, true, Some(since))
                .await? as i32,
        };
        stats_service::overwrite_device_stats(pool, device.id, counters, today, now).await?;
    }

    info!(groups = calibrated, "statistics calibration complete");
    Ok(calibrated)
}

pub async fn tick(pool: &PgPool) {
    if let Err(e) = run_once(pool).await {
        warn!(error = %e, "statistics calibration failed");
    }
}
