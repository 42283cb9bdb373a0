use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgExecutor, PgPool};

use crate::db::models::{DeviceStats, GroupStats};
use crate::web::AppError;

const DEVICE_STATS_COLUMNS: &str = "id, device_id, today_total, total, duplicate_total, \
     today_duplicate, last_reset_date, last_reset_at, updated_at";

const GROUP_STATS_COLUMNS: &str = "id, group_id, total_devices, online_devices, today_total, \
     total, duplicate_total, today_duplicate, last_reset_date, last_reset_at, updated_at";

/// Recomputed counter set produced by the calibration pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibratedCounters {
    pub total: i32,
    pub today_total: i32,
    pub duplicate_total: i32,
    pub today_duplicate: i32,
}

pub async fn get_device_stats(
    pool: &PgPool,
    device_id: i32,
) -> Result<Option<DeviceStats>, AppError> {
    let stats = sqlx::query_as::<_, DeviceStats>(&format!(
        "SELECT {DEVICE_STATS_COLUMNS} FROM device_stats WHERE device_id = $1"
    ))
    .bind(device_id)
    .fetch_optional(pool)
    .await?;
    Ok(stats)
}

pub async fn get_group_stats(
    pool: &PgPool,
    group_id: i32,
) -> Result<Option<GroupStats>, AppError> {
    let stats = sqlx::query_as::<_, GroupStats>(&format!(
        "SELECT {GROUP_STATS_COLUMNS} FROM group_stats WHERE group_id = $1"
    ))
    .bind(group_id)
    .fetch_optional(pool)
    .await?;
    Ok(stats)
}

/// Lazily creates the counter row for a device. A device may receive events
/// before its counters exist, e.g. after a manual data repair.
pub async fn ensure_device_stats<'e, E>(executor: E, device_id: i32) -> Result<(), AppError>
where
    E: PgExecutor<'e>,
{
    sqlx::query("INSERT INTO device_stats (device_id) VALUES ($1) ON CONFLICT (device_id) DO NOTHING")
        .bind(device_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn ensure_group_stats<'e, E>(executor: E, group_id: i32) -> Result<(), AppError>
where
    E: PgExecutor<'e>,
{
    sqlx::query("INSERT INTO group_stats (group_id) VALUES ($1) ON CONFLICT (group_id) DO NOTHING")
        .bind(group_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Increments a device's counters for one ingested event. Duplicate events
/// additionally bump both duplicate counters.
pub async fn bump_device_stats<'e, E>(
    executor: E,
    device_id: i32,
    is_duplicate: bool,
) -> Result<(), AppError>
where
    E: PgExecutor<'e>,
{
    let dup = if is_duplicate { 1 } else { 0 };
    sqlx::query(
        "UPDATE device_stats SET total = total + 1, today_total = today_total + 1, \
         duplicate_total = duplicate_total + $1, today_duplicate = today_duplicate + $1, \
         updated_at = NOW() WHERE device_id = $2",
    )
    .bind(dup)
    .bind(device_id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn bump_group_stats<'e, E>(
    executor: E,
    group_id: i32,
    is_duplicate: bool,
) -> Result<(), AppError>
where
    E: PgExecutor<'e>,
{
    let dup = if is_duplicate { 1 } else { 0 };
    sqlx::query(
        "UPDATE group_stats SET total = total + 1, today_total = today_total + 1, \
         duplicate_total = duplicate_total + $1, today_duplicate = today_duplicate + $1, \
         updated_at = NOW() WHERE group_id = $2",
    )
    .bind(dup)
    .bind(group_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Zeroes a group's "today" counters and stamps the reset bookkeeping.
pub async fn reset_group_stats(
    pool: &PgPool,
    group_id: i32,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE group_stats SET today_total = 0, today_duplicate = 0, \
         last_reset_date = $1, last_reset_at = $2, updated_at = $2 WHERE group_id = $3",
    )
    .bind(today)
    .bind(now)
    .bind(group_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn reset_device_stats(
    pool: &PgPool,
    device_id: i32,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE device_stats SET today_total = 0, today_duplicate = 0, \
         last_reset_date = $1, last_reset_at = $2, updated_at = $2 WHERE device_id = $3",
    )
    .bind(today)
    .bind(now)
    .bind(device_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Recounts the group's online devices and writes the figure into the
/// group's counter row.
pub async fn refresh_group_online_count(pool: &PgPool, group_id: i32) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE group_stats SET online_devices = ( \
             SELECT COUNT(*) FROM devices \
             WHERE group_id = $1 AND deleted_at IS NULL AND online_status = 'online' \
         ), updated_at = NOW() WHERE group_id = $1",
    )
    .bind(group_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Overwrites a device's counters with recomputed figures (calibration).
pub async fn overwrite_device_stats(
    pool: &PgPool,
    device_id: i32,
    counters: CalibratedCounters,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO device_stats (device_id, total, today_total, duplicate_total, \
             today_duplicate, last_reset_date, last_reset_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $7) \
         ON CONFLICT (device_id) DO UPDATE SET \
             total = EXCLUDED.total, today_total = EXCLUDED.today_total, \
             duplicate_total = EXCLUDED.duplicate_total, \
             today_duplicate = EXCLUDED.today_duplicate, \
             last_reset_date = EXCLUDED.last_reset_date, \
             last_reset_at = EXCLUDED.last_reset_at, updated_at = EXCLUDED.updated_at",
    )
    .bind(device_id)
    .bind(counters.total)
    .bind(counters.today_total)
    .bind(counters.duplicate_total)
    .bind(counters.today_duplicate)
    .bind(today)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Overwrites a group's counters with recomputed figures plus the device
/// census (calibration).
pub async fn overwrite_group_stats(
    pool: &PgPool,
    group_id: i32,
    counters: CalibratedCounters,
    total_devices: i32,
    online_devices: i32,
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO group_stats (group_id, total_devices, online_devices, total, today_total, \
             duplicate_total, today_duplicate, last_reset_date, last_reset_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9) \
         ON CONFLICT (group_id) DO UPDATE SET \
             total_devices = EXCLUDED.total_devices, \
             online_devices = EXCLUDED.online_devices, \
             total = EXCLUDED.total, today_total = EXCLUDED.today_total, \
             duplicate_total = EXCLUDED.duplicate_total, \
             today_duplicate = EXCLUDED.today_duplicate, \
             last_reset_date = EXCLUDED.last_reset_date, \
             last_reset_at = EXCLUDED.last_reset_at, updated_at = EXCLUDED.updated_at",
    )
    .bind(group_id)
    .bind(total_devices)
    .bind(online_devices)
    .bind(counters.total)
    .bind(counters.today_total)
    .bind(counters.duplicate_total)
    .bind(counters.today_duplicate)
    .bind(today)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}
