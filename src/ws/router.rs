use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::db::enums::OnlineStatus;
use crate::db::models::Group;
use crate::db::services::{device_service, stats_service};
use crate::ingest;
use crate::web::AppError;
use crate::ws::hub::Notifier;
use crate::ws::models::{Inbound, WireMessage};
use crate::ws::registry::{Connection, ConnectionRegistry};

/// Dispatches decoded inbound frames to the operation they name and shapes
/// the reply for the originating connection. Broadcast side effects go
/// through the [`Notifier`].
pub struct MessageRouter {
    pool: PgPool,
    registry: Arc<ConnectionRegistry>,
    notifier: Notifier,
}

impl MessageRouter {
    pub fn new(pool: PgPool, registry: Arc<ConnectionRegistry>, notifier: Notifier) -> Self {
        MessageRouter {
            pool,
            registry,
            notifier,
        }
    }

    /// Handles one raw frame from an agent connection. Returns the reply
    /// frame, or an error the caller turns into an error frame. The
    /// connection stays open either way.
    pub async fn handle_agent_frame(
        &self,
        connection: &Connection,
        group: &Group,
        raw: &str,
    ) -> Result<WireMessage, AppError> {
        let envelope = WireMessage::decode(raw)?;
        verify_activation_code(envelope.activation_code.as_deref(), &connection.activation_code)?;

        match Inbound::decode(&envelope)? {
            Inbound::Heartbeat => {
                self.registry
                    .update_heartbeat(&connection.id, connection.kind)
                    .await;
                Ok(WireMessage::outbound("heartbeat_ack", json!({"status": "ok"})))
            }
            Inbound::SyncLineAccounts(batch) => self.handle_device_sync(group, batch).await,
            Inbound::Incoming(payload) => {
                let is_duplicate =
                    ingest::pipeline::process(&self.pool, group, &payload).await?;
                self.notifier
                    .broadcast_incoming(group.id, &payload, is_duplicate)
                    .await;
                self.notifier.broadcast_group_stats(group.id).await;
                Ok(WireMessage::outbound(
                    "incoming_received",
                    json!({
                        "contact_external_id": payload.contact_external_id,
                        "is_duplicate": is_duplicate,
                    }),
                ))
            }
            Inbound::CustomerSync(data) => {
                debug!(group_id = group.id, "customer sync batch received");
                Ok(acknowledge_sync("customer_sync", &data))
            }
            Inbound::FollowUpSync(data) => {
                debug!(group_id = group.id, "follow-up sync batch received");
                Ok(acknowledge_sync("follow_up_sync", &data))
            }
            Inbound::AccountStatusChange(payload) => {
                let status = parse_reported_status(&payload.online_status)?;
                let device = device_service::get_device_by_external_id(
                    &self.pool,
                    group.id,
                    &payload.device_external_id,
                )
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "device not found: {}",
                        payload.device_external_id
                    ))
                })?;

                device_service::update_online_status(&self.pool, device.id, status).await?;
                stats_service::refresh_group_online_count(&self.pool, group.id).await?;
                info!(
                    group_id = group.id,
                    device_id = device.id,
                    status = status.as_str(),
                    "device status changed"
                );

                self.notifier
                    .broadcast_status_change(group.id, &payload.device_external_id, status.as_str())
                    .await;
                self.notifier.broadcast_group_stats(group.id).await;

                Ok(WireMessage::outbound(
                    "account_status_updated",
                    json!({
                        "device_external_id": payload.device_external_id,
                        "online_status": status.as_str(),
                    }),
                ))
            }
        }
    }

    /// Handles one raw frame from a dashboard connection. Dashboards only
    /// ever send heartbeats; anything else is a protocol error.
    pub async fn handle_dashboard_frame(
        &self,
        connection: &Connection,
        raw: &str,
    ) -> Result<WireMessage, AppError> {
        let envelope = WireMessage::decode(raw)?;
        match Inbound::decode(&envelope)? {
            Inbound::Heartbeat => {
                self.registry
                    .update_heartbeat(&connection.id, connection.kind)
                    .await;
                Ok(WireMessage::outbound("heartbeat_ack", json!({"status": "ok"})))
            }
            other => Err(AppError::Protocol(format!(
                "frame not accepted on dashboard connections: {other:?}"
            ))),
        }
    }

    async fn handle_device_sync(
        &self,
        group: &Group,
        batch: Vec<crate::ws::models::DeviceDescriptor>,
    ) -> Result<WireMessage, AppError> {
        let mut items: Vec<(String, SyncOutcome)> = Vec::with_capacity(batch.len());
        for descriptor in &batch {
            let outcome = match device_service::sync_device(&self.pool, group, descriptor).await {
                Ok((device, true)) => SyncOutcome::Created(device.id),
                Ok((device, false)) => SyncOutcome::Updated(device.id),
                Err(e) => {
                    warn!(
                        group_id = group.id,
                        external_id = %descriptor.external_id,
                        error = %e,
                        "device sync entry failed"
                    );
                    SyncOutcome::Failed
                }
            };
            items.push((descriptor.external_id.clone(), outcome));
        }

        stats_service::ensure_group_stats(&self.pool, group.id).await?;
        sqlx::query(
            "UPDATE group_stats SET total_devices = ( \
                 SELECT COUNT(*) FROM devices WHERE group_id = $1 AND deleted_at IS NULL \
             ), updated_at = NOW() WHERE group_id = $1",
        )
        .bind(group.id)
        .execute(&self.pool)
        .await?;
        stats_service::refresh_group_online_count(&self.pool, group.id).await?;

        let reply = device_sync_reply(&items);
        info!(group_id = group.id, total = items.len(), "device sync applied");
        self.notifier.broadcast_group_stats(group.id).await;

        Ok(reply)
    }
}

/// Per-descriptor result of a `sync_line_accounts` batch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Created(i32),
    Updated(i32),
    Failed,
}

/// Shapes the `sync_result` reply: aggregate counts plus one status entry
/// per descriptor, in batch order.
fn device_sync_reply(items: &[(String, SyncOutcome)]) -> WireMessage {
    let mut created_count = 0usize;
    let mut updated_count = 0usize;
    let mut failed_count = 0usize;
    let accounts: Vec<serde_json::Value> = items
        .iter()
        .map(|(external_id, outcome)| {
            let (status, device_id) = match outcome {
                SyncOutcome::Created(id) => {
                    created_count += 1;
                    ("created", Some(*id))
                }
                SyncOutcome::Updated(id) => {
                    updated_count += 1;
                    ("updated", Some(*id))
                }
                SyncOutcome::Failed => {
                    failed_count += 1;
                    ("failed", None)
                }
            };
            json!({
                "external_id": external_id,
                "device_id": device_id,
                "status": status,
            })
        })
        .collect();

    WireMessage::outbound(
        "sync_result",
        json!({
            "created_count": created_count,
            "updated_count": updated_count,
            "failed_count": failed_count,
            "accounts": accounts,
        }),
    )
}

/// A frame carrying an activation code must carry the code its connection
/// authenticated with; a frame without one inherits the connection's.
fn verify_activation_code(frame_code: Option<&str>, bound_code: &str) -> Result<(), AppError> {
    match frame_code {
        None => Ok(()),
        Some(code) if code == bound_code => Ok(()),
        Some(_) => Err(AppError::ActivationCodeMismatch),
    }
}

/// Statuses an agent may report through `account_status_change`.
/// `abnormal_offline` is the offline-reconciliation pass's verdict and is
/// never accepted from the wire.
fn parse_reported_status(raw: &str) -> Result<OnlineStatus, AppError> {
    match OnlineStatus::parse(raw) {
        Some(OnlineStatus::AbnormalOffline) => Err(AppError::Protocol(
            "status not reportable by agents: abnormal_offline".to_string(),
        )),
        Some(status) => Ok(status),
        None => Err(AppError::Protocol(format!("unknown online status: {raw}"))),
    }
}

fn acknowledge_sync(kind: &str, data: &serde_json::Value) -> WireMessage {
    let count = data.as_array().map(Vec::len).unwrap_or(0);
    WireMessage::outbound("sync_result", json!({"kind": kind, "received": count}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_without_code_inherits_the_connection() {
        assert!(verify_activation_code(None, "CODE1").is_ok());
    }

    #[test]
    fn matching_code_passes() {
        assert!(verify_activation_code(Some("CODE1"), "CODE1").is_ok());
    }

    #[test]
    fn mismatched_code_is_rejected() {
        assert!(matches!(
            verify_activation_code(Some("CODE2"), "CODE1"),
            Err(AppError::ActivationCodeMismatch)
        ));
    }

    #[test]
    fn device_sync_reply_reports_each_descriptor() {
        let items = vec![
            ("dev-1".to_string(), SyncOutcome::Created(10)),
            ("dev-2".to_string(), SyncOutcome::Updated(11)),
            ("dev-3".to_string(), SyncOutcome::Failed),
        ];
        let reply = device_sync_reply(&items);
        assert_eq!(reply.message_type, "sync_result");
        let data = reply.data.unwrap();
        assert_eq!(data["created_count"], 1);
        assert_eq!(data["updated_count"], 1);
        assert_eq!(data["failed_count"], 1);

        let accounts = data["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 3);
        assert_eq!(accounts[0]["external_id"], "dev-1");
        assert_eq!(accounts[0]["status"], "created");
        assert_eq!(accounts[0]["device_id"], 10);
        assert_eq!(accounts[1]["status"], "updated");
        assert_eq!(accounts[2]["status"], "failed");
        assert!(accounts[2]["device_id"].is_null());
    }

    #[test]
    fn empty_sync_batch_yields_empty_reply() {
        let reply = device_sync_reply(&[]);
        let data = reply.data.unwrap();
        assert_eq!(data["created_count"], 0);
        assert!(data["accounts"].as_array().unwrap().is_empty());
    }

    #[test]
    fn agents_may_report_user_states_only() {
        assert_eq!(
            parse_reported_status("online").unwrap(),
            OnlineStatus::Online
        );
        assert_eq!(
            parse_reported_status("user_logout").unwrap(),
            OnlineStatus::UserLogout
        );
        assert!(matches!(
            parse_reported_status("abnormal_offline"),
            Err(AppError::Protocol(_))
        ));
        assert!(matches!(
            parse_reported_status("sleeping"),
            Err(AppError::Protocol(_))
        ));
    }

    #[test]
    fn sync_ack_counts_array_payloads() {
        let ack = acknowledge_sync("customer_sync", &json!([{"a": 1}, {"a": 2}]));
        let data = ack.data.unwrap();
        assert_eq!(data["received"], 2);
        assert_eq!(data["kind"], "customer_sync");
    }

    #[test]
    fn sync_ack_tolerates_non_array_payloads() {
        let ack = acknowledge_sync("follow_up_sync", &serde_json::Value::Null);
        assert_eq!(ack.data.unwrap()["received"], 0);
    }
}
