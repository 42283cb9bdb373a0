use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};

use crate::web::AppError;

/// An incoming-contact event about to be appended to the log.
#[derive(Debug, Clone)]
pub struct NewIncomingEvent {
    pub device_id: i32,
    pub group_id: i32,
    pub contact_external_id: String,
    pub occurred_at: DateTime<Utc>,
    pub display_name: String,
    pub avatar_url: String,
    pub phone_number: String,
    pub is_duplicate: bool,
    pub dedup_scope: String,
    pub raw_data: Option<serde_json::Value>,
}

/// Appends one event row. Intentionally never deduplicates: repeated contact
/// is the business signal, the duplicate flag merely annotates it.
pub async fn insert_incoming_event<'e, E>(
    executor: E,
    event: &NewIncomingEvent,
) -> Result<(), AppError>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO incoming_events (device_id, group_id, contact_external_id, occurred_at, \
             display_name, avatar_url, phone_number, is_duplicate, dedup_scope, raw_data) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(event.device_id)
    .bind(event.group_id)
    .bind(&event.contact_external_id)
    .bind(event.occurred_at)
    .bind(&event.display_name)
    .bind(&event.avatar_url)
    .bind(&event.phone_number)
    .bind(event.is_duplicate)
    .bind(&event.dedup_scope)
    .bind(&event.raw_data)
    .execute(executor)
    .await?;
    Ok(())
}

/// Counts events for one group, optionally restricted to duplicates and/or
/// to events at or after `since`. The calibration pass derives all four
/// counters from this.
pub async fn count_group_events(
    pool: &PgPool,
    group_id: i32,
    duplicates_only: bool,
    since: Option<DateTime<Utc>>,
) -> Result<i64, AppError> {
    let mut sql = String::from("SELECT COUNT(*) FROM incoming_events WHERE group_id = $1");
    if duplicates_only {
        sql.push_str(" AND is_duplicate = TRUE");
    }
    if since.is_some() {
        sql.push_str(" AND occurred_at >= $2");
    }

    let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(group_id);
    if let Some(since) = since {
        query = query.bind(since);
    }
    Ok(query.fetch_one(pool).await?)
}

pub async fn count_device_events(
    pool: &PgPool,
    device_id: i32,
    duplicates_only: bool,
    since: Option<DateTime<Utc>>,
) -> Result<i64, AppError> {
    let mut sql = String::from("SELECT COUNT(*) FROM incoming_events WHERE device_id = $1");
    if duplicates_only {
        sql.push_str(" AND is_duplicate = TRUE");
    }
    if since.is_some() {
        sql.push_str(" AND occurred_at >= $2");
    }

    let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(device_id);
    if let Some(since) = since {
        query = query.bind(since);
    }
    Ok(query.fetch_one(pool).await?)
}
