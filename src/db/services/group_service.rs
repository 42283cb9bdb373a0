use sqlx::{PgExecutor, PgPool};

use crate::db::models::Group;
use crate::web::AppError;

const GROUP_COLUMNS: &str = "id, user_id, activation_code, account_limit, is_active, remark, \
     category, dedup_scope, reset_time, created_at, updated_at, deleted_at";

/// Looks up a live group by its activation code.
pub async fn get_group_by_activation_code(
    pool: &PgPool,
    activation_code: &str,
) -> Result<Option<Group>, AppError> {
    let group = sqlx::query_as::<_, Group>(&format!(
        "SELECT {GROUP_COLUMNS} FROM groups WHERE activation_code = $1 AND deleted_at IS NULL"
    ))
    .bind(activation_code)
    .fetch_optional(pool)
    .await?;
    Ok(group)
}

pub async fn get_group_by_id<'e, E>(executor: E, group_id: i32) -> Result<Option<Group>, AppError>
where
    E: PgExecutor<'e>,
{
    let group = sqlx::query_as::<_, Group>(&format!(
        "SELECT {GROUP_COLUMNS} FROM groups WHERE id = $1 AND deleted_at IS NULL"
    ))
    .bind(group_id)
    .fetch_optional(executor)
    .await?;
    Ok(group)
}

/// All live groups; the reset and calibration passes iterate this.
pub async fn list_groups(pool: &PgPool) -> Result<Vec<Group>, AppError> {
    let groups = sqlx::query_as::<_, Group>(&format!(
        "SELECT {GROUP_COLUMNS} FROM groups WHERE deleted_at IS NULL ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;
    Ok(groups)
}
