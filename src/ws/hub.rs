use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use tracing::warn;

use crate::db::services::stats_service;
use crate::web::AppError;
use crate::ws::models::{IncomingPayload, WireMessage};
use crate::ws::registry::ConnectionRegistry;

/// Pushes state changes out to the dashboards watching a group. Every method
/// is fire-and-forget from the caller's point of view: a failed load is
/// logged, never propagated into the ingestion path.
#[derive(Clone)]
pub struct Notifier {
    pool: PgPool,
    registry: Arc<ConnectionRegistry>,
}

impl Notifier {
    pub fn new(pool: PgPool, registry: Arc<ConnectionRegistry>) -> Self {
        Notifier { pool, registry }
    }

    /// Broadcasts the group's current counter row as a `stats_update` frame.
    pub async fn broadcast_group_stats(&self, group_id: i32) {
        match self.load_stats_frame(group_id).await {
            Ok(frame) => {
                self.registry
                    .broadcast_to_group(group_id, &frame.encode())
                    .await
            }
            Err(e) => warn!(group_id, error = %e, "stats broadcast skipped"),
        }
    }

    /// Tells dashboards one incoming event landed, including its duplicate
    /// verdict.
    pub async fn broadcast_incoming(
        &self,
        group_id: i32,
        payload: &IncomingPayload,
        is_duplicate: bool,
    ) {
        let frame = WireMessage::outbound(
            "incoming_received",
            json!({
                "group_id": group_id,
                "device_external_id": payload.device_external_id,
                "contact_external_id": payload.contact_external_id,
                "display_name": payload.display_name,
                "is_duplicate": is_duplicate,
            }),
        );
        self.registry
            .broadcast_to_group(group_id, &frame.encode())
            .await;
    }

    /// Mirrors a device status transition to the group's dashboards.
    pub async fn broadcast_status_change(
        &self,
        group_id: i32,
        device_external_id: &str,
        online_status: &str,
    ) {
        let frame = WireMessage::outbound(
            "account_status_change",
            json!({
                "group_id": group_id,
                "device_external_id": device_external_id,
                "online_status": online_status,
            }),
        );
        self.registry
            .broadcast_to_group(group_id, &frame.encode())
            .await;
    }

    async fn load_stats_frame(&self, group_id: i32) -> Result<WireMessage, AppError> {
        let stats = stats_service::get_group_stats(&self.pool, group_id)
            .await?
            .ok_or_else(|| AppError::NotFound("group stats not found".to_string()))?;
        Ok(WireMessage::outbound(
            "stats_update",
            json!({
                "group_id": group_id,
                "total_devices": stats.total_devices,
                "online_devices": stats.online_devices,
                "today_total": stats.today_total,
                "total": stats.total,
                "duplicate_total": stats.duplicate_total,
                "today_duplicate": stats.today_duplicate,
            }),
        ))
    }
}
