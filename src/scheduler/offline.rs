use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::db::enums::OnlineStatus;
use crate::db::services::{device_service, stats_service};
use crate::web::AppError;
use crate::ws::hub::Notifier;
use crate::ws::registry::ConnectionRegistry;

/// Business-level liveness window. Deliberately wider than the transport
/// heartbeat timeout: a device is reconciled to abnormal-offline well after
/// its connection is swept, not immediately.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(300);

/// True when at least one heartbeat is recent enough to count the agent
/// connection as alive.
fn any_live(heartbeats: &[DateTime<Utc>], now: DateTime<Utc>, timeout: Duration) -> bool {
    let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(65));
    heartbeats.iter().any(|hb| now - *hb <= timeout)
}

/// One reconciliation pass: every device still marked online whose group has
/// no live agent connection is flipped to abnormal-offline. Skipped entirely
/// while no agent is connected at all, so a server restart does not mark the
/// whole fleet offline before agents have had a chance to reconnect.
pub async fn run_once(
    pool: &PgPool,
    registry: &Arc<ConnectionRegistry>,
    notifier: &Notifier,
) -> Result<usize, AppError> {
    if !registry.has_agents().await {
        debug!("offline reconciliation skipped: no agent connections");
        return Ok(0);
    }

    let now = Utc::now();
    let mut flipped = 0usize;
    let mut touched_groups: HashSet<i32> = HashSet::new();

    for device in device_service::list_online_devices(pool).await? {
        let heartbeats = registry
            .agent_heartbeats_for_code(&device.activation_code)
            .await;
        if any_live(&heartbeats, now, LIVENESS_WINDOW) {
            continue;
        }

        device_service::update_online_status(pool, device.id, OnlineStatus::AbnormalOffline)
            .await?;
        info!(
            device_id = device.id,
            group_id = device.group_id,
            external_id = %device.external_id,
            "device marked abnormal-offline: no live agent connection"
        );
        flipped += 1;
        touched_groups.insert(device.group_id);
    }

    for group_id in touched_groups {
        stats_service::refresh_group_online_count(pool, group_id).await?;
        notifier.broadcast_group_stats(group_id).await;
    }

    if flipped > 0 {
        info!(flipped, "offline reconciliation applied");
    }
    Ok(flipped)
}

pub async fn tick(pool: &PgPool, registry: &Arc<ConnectionRegistry>, notifier: &Notifier) {
    if let Err(e) = run_once(pool, registry, notifier).await {
        warn!(error = %e, "offline reconciliation failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_heartbeat_counts_as_live() {
        let now = Utc::now();
        let heartbeats = vec![now - chrono::Duration::seconds(30)];
        assert!(any_live(&heartbeats, now, Duration::from_secs(65)));
    }

    #[test]
    fn stale_heartbeats_do_not_count() {
        let now = Utc::now();
        let heartbeats = vec![
            now - chrono::Duration::seconds(120),
            now - chrono::Duration::seconds(300),
        ];
        assert!(!any_live(&heartbeats, now, Duration::from_secs(65)));
    }

    #[test]
    fn one_live_connection_is_enough() {
        let now = Utc::now();
        let heartbeats = vec![
            now - chrono::Duration::seconds(120),
            now - chrono::Duration::seconds(10),
        ];
        assert!(any_live(&heartbeats, now, Duration::from_secs(65)));
    }

    #[test]
    fn no_connections_means_not_live() {
        assert!(!any_live(&[], Utc::now(), Duration::from_secs(65)));
    }
}
