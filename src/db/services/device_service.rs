use chrono::Utc;
use sqlx::PgPool;

use crate::db::enums::OnlineStatus;
use crate::db::models::{Device, Group};
use crate::db::services::stats_service;
use crate::web::AppError;
use crate::ws::models::DeviceDescriptor;

const DEVICE_COLUMNS: &str = "id, group_id, activation_code, platform_type, external_id, \
     display_name, phone_number, profile_url, avatar_url, bio, status_message, online_status, \
     reset_time, last_active_at, last_online_at, first_login_at, created_at, updated_at, deleted_at";

/// Resolves a device by the external id the agent reports, scoped to a group.
pub async fn get_device_by_external_id(
    pool: &PgPool,
    group_id: i32,
    external_id: &str,
) -> Result<Option<Device>, AppError> {
    let device = sqlx::query_as::<_, Device>(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices \
         WHERE group_id = $1 AND external_id = $2 AND deleted_at IS NULL"
    ))
    .bind(group_id)
    .bind(external_id)
    .fetch_optional(pool)
    .await?;
    Ok(device)
}

pub async fn list_devices(pool: &PgPool) -> Result<Vec<Device>, AppError> {
    let devices = sqlx::query_as::<_, Device>(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices WHERE deleted_at IS NULL ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;
    Ok(devices)
}

pub async fn list_online_devices(pool: &PgPool) -> Result<Vec<Device>, AppError> {
    let devices = sqlx::query_as::<_, Device>(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices \
         WHERE deleted_at IS NULL AND online_status = 'online' ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;
    Ok(devices)
}

/// Devices that follow their group's reset instant (no per-device override).
pub async fn list_group_devices_without_reset_override(
    pool: &PgPool,
    group_id: i32,
) -> Result<Vec<Device>, AppError> {
    let devices = sqlx::query_as::<_, Device>(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices \
         WHERE group_id = $1 AND deleted_at IS NULL \
           AND (reset_time IS NULL OR reset_time = '') ORDER BY id"
    ))
    .bind(group_id)
    .fetch_all(pool)
    .await?;
    Ok(devices)
}

/// Devices carrying their own reset instant; evaluated independently of
/// their group in the reset pass.
pub async fn list_devices_with_reset_override(pool: &PgPool) -> Result<Vec<Device>, AppError> {
    let devices = sqlx::query_as::<_, Device>(&format!(
        "SELECT {DEVICE_COLUMNS} FROM devices \
         WHERE deleted_at IS NULL AND reset_time IS NOT NULL AND reset_time <> '' ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;
    Ok(devices)
}

/// Applies an agent-reported status change. Stamps `last_active_at` and, for
/// transitions to online, `last_online_at`.
pub async fn update_online_status(
    pool: &PgPool,
    device_id: i32,
    status: OnlineStatus,
) -> Result<(), AppError> {
    let now = Utc::now();
    sqlx::query(
        "UPDATE devices SET online_status = $1, last_active_at = $2, \
         last_online_at = CASE WHEN $1 = 'online' THEN $2 ELSE last_online_at END, \
         updated_at = $2 WHERE id = $3",
    )
    .bind(status.as_str())
    .bind(now)
    .bind(device_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Takes every still-online device of an activation code offline. Used by the
/// disconnect-event consumer when a group's last agent connection drops.
pub async fn mark_group_devices_offline(
    pool: &PgPool,
    activation_code: &str,
) -> Result<u64, AppError> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE devices SET online_status = 'offline', last_active_at = $1, updated_at = $1 \
         WHERE activation_code = $2 AND online_status = 'online' AND deleted_at IS NULL",
    )
    .bind(now)
    .bind(activation_code)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Create-or-update for one device descriptor from a `sync_line_accounts`
/// batch. Returns the device and whether it was newly created. A resend
/// simply re-updates (last-write-wins).
pub async fn sync_device(
    pool: &PgPool,
    group: &Group,
    descriptor: &DeviceDescriptor,
) -> Result<(Device, bool), AppError> {
    let now = Utc::now();

    if let Some(existing) = get_device_by_external_id(pool, group.id, &descriptor.external_id).await?
    {
        let status = descriptor
            .online_status
            .as_deref()
            .and_then(OnlineStatus::parse)
            .unwrap_or(existing.online_status);

        let device = sqlx::query_as::<_, Device>(&format!(
            "UPDATE devices SET display_name = $1, phone_number = $2, profile_url = $3, \
             avatar_url = $4, bio = $5, status_message = $6, online_status = $7, \
             last_active_at = $8, \
             last_online_at = CASE WHEN $7 = 'online' THEN $8 ELSE last_online_at END, \
             updated_at = $8 \
             WHERE id = $9 RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(descriptor.display_name.clone().unwrap_or_default())
        .bind(descriptor.phone_number.clone().unwrap_or_default())
        .bind(descriptor.profile_url.clone().unwrap_or_default())
        .bind(descriptor.avatar_url.clone().unwrap_or_default())
        .bind(descriptor.bio.clone().unwrap_or_default())
        .bind(descriptor.status_message.clone().unwrap_or_default())
        .bind(status.as_str())
        .bind(now)
        .bind(existing.id)
        .fetch_one(pool)
        .await?;

        return Ok((device, false));
    }

    let status = descriptor
        .online_status
        .as_deref()
        .and_then(OnlineStatus::parse)
        .unwrap_or(OnlineStatus::Online);

    let device = sqlx::query_as::<_, Device>(&format!(
        "INSERT INTO devices (group_id, activation_code, platform_type, external_id, \
         display_name, phone_number, profile_url, avatar_url, bio, status_message, \
         online_status, last_active_at, last_online_at, first_login_at, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
                 CASE WHEN $11 = 'online' THEN $12 ELSE NULL END, $12, $12, $12) \
         RETURNING {DEVICE_COLUMNS}"
    ))
    .bind(group.id)
    .bind(&group.activation_code)
    .bind(descriptor.platform_type.clone())
    .bind(&descriptor.external_id)
    .bind(descriptor.display_name.clone().unwrap_or_default())
    .bind(descriptor.phone_number.clone().unwrap_or_default())
    .bind(descriptor.profile_url.clone().unwrap_or_default())
    .bind(descriptor.avatar_url.clone().unwrap_or_default())
    .bind(descriptor.bio.clone().unwrap_or_default())
    .bind(descriptor.status_message.clone().unwrap_or_default())
    .bind(status.as_str())
    .bind(now)
    .fetch_one(pool)
    .await?;

    stats_service::ensure_device_stats(pool, device.id).await?;

    Ok((device, true))
}
