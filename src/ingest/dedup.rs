use sqlx::{PgConnection, PgExecutor};

use crate::db::enums::DedupScope;
use crate::db::models::Group;
use crate::web::AppError;

/// Outcome of the duplicate evaluation for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupVerdict {
    pub is_duplicate: bool,
    pub scope: DedupScope,
}

/// Decides whether a contact has been seen before, under the group's
/// configured scope. Runs on the ingestion transaction's connection so the
/// verdict and the writes it informs observe the same snapshot.
pub async fn evaluate(
    conn: &mut PgConnection,
    group: &Group,
    contact_external_id: &str,
) -> Result<DedupVerdict, AppError> {
    let scope = group.effective_dedup_scope();
    let is_duplicate = match scope {
        DedupScope::Current => {
            seen_in_group(&mut *conn, group.id, contact_external_id).await?
        }
        DedupScope::Global => seen_anywhere(&mut *conn, contact_external_id).await?,
    };
    Ok(DedupVerdict { is_duplicate, scope })
}

/// Current scope: has this group logged the contact before.
pub async fn seen_in_group<'e, E>(
    executor: E,
    group_id: i32,
    contact_external_id: &str,
) -> Result<bool, AppError>
where
    E: PgExecutor<'e>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM incoming_events WHERE group_id = $1 AND contact_external_id = $2",
    )
    .bind(group_id)
    .bind(contact_external_id)
    .fetch_one(executor)
    .await?;
    Ok(count > 0)
}

/// Global scope: has any group logged the contact before.
pub async fn seen_anywhere<'e, E>(
    executor: E,
    contact_external_id: &str,
) -> Result<bool, AppError>
where
    E: PgExecutor<'e>,
{
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM incoming_events WHERE contact_external_id = $1")
            .bind(contact_external_id)
            .fetch_one(executor)
            .await?;
    Ok(count > 0)
}

/// Directory check: the contact already entered the first-seen directory,
/// possibly through a channel that never logged an event.
pub async fn seen_in_directory<'e, E>(
    executor: E,
    external_id: &str,
    platform_type: &str,
) -> Result<bool, AppError>
where
    E: PgExecutor<'e>,
{
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS( \
             SELECT 1 FROM contact_directory \
             WHERE external_id = $1 AND platform_type = $2 AND deleted_at IS NULL \
         )",
    )
    .bind(external_id)
    .bind(platform_type)
    .fetch_one(executor)
    .await?;
    Ok(exists)
}
