use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

use crate::web::AppError;

/// A first-seen contact about to enter the directory.
#[derive(Debug, Clone)]
pub struct NewContactEntry {
    pub group_id: i32,
    pub activation_code: String,
    pub device_id: Option<i32>,
    pub platform_type: String,
    pub external_id: String,
    pub display_name: String,
    pub phone_number: String,
    pub avatar_url: String,
    pub dedup_scope: String,
    pub first_seen_at: DateTime<Utc>,
}

/// Records a first sighting. `ON CONFLICT DO NOTHING` on the
/// (external_id, platform_type) identity: a concurrent insert racing the
/// caller's existence check simply loses, which is acceptable because
/// directory entries are informational and never counted.
pub async fn insert_first_seen_contact<'e, E>(
    executor: E,
    entry: &NewContactEntry,
) -> Result<(), AppError>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO contact_directory (source_type, group_id, activation_code, device_id, \
             platform_type, external_id, display_name, phone_number, avatar_url, dedup_scope, \
             first_seen_at) \
         VALUES ('platform', $1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         ON CONFLICT (external_id, platform_type) WHERE deleted_at IS NULL DO NOTHING",
    )
    .bind(entry.group_id)
    .bind(&entry.activation_code)
    .bind(entry.device_id)
    .bind(&entry.platform_type)
    .bind(&entry.external_id)
    .bind(&entry.display_name)
    .bind(&entry.phone_number)
    .bind(&entry.avatar_url)
    .bind(&entry.dedup_scope)
    .bind(entry.first_seen_at)
    .execute(executor)
    .await?;
    Ok(())
}
