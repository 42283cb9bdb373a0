use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

/// Outbound queue depth for agent connections. Agents mostly receive acks,
/// so a shallow queue is enough.
pub const AGENT_QUEUE_CAPACITY: usize = 64;

/// Outbound queue depth for dashboard connections, which receive every
/// broadcast for their group.
pub const DASHBOARD_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Agent,
    Dashboard,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Agent => "agent",
            ConnectionKind::Dashboard => "dashboard",
        }
    }
}

/// One live WebSocket connection as the registry sees it. The `sender` feeds
/// the connection's write pump; `close_signal` tells the pumps to exit when
/// the registry tears the connection down (sweep, slow-consumer drop,
/// shutdown), since the handler keeps its own sender clone and a table
/// removal alone would leave the socket and tasks alive.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub kind: ConnectionKind,
    pub group_id: i32,
    pub activation_code: String,
    pub sender: mpsc::Sender<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    close_signal: watch::Sender<bool>,
}

impl Connection {
    pub fn new(
        kind: ConnectionKind,
        group_id: i32,
        activation_code: String,
        sender: mpsc::Sender<String>,
    ) -> Self {
        let now = Utc::now();
        let (close_signal, _) = watch::channel(false);
        Connection {
            id: generate_connection_id(),
            kind,
            group_id,
            activation_code,
            sender,
            last_heartbeat: now,
            registered_at: now,
            close_signal,
        }
    }

    /// Subscribes to the teardown signal. The receiver resolves once the
    /// registry forcibly closes this connection.
    pub fn close_handle(&self) -> watch::Receiver<bool> {
        self.close_signal.subscribe()
    }

    fn signal_close(&self) {
        let _ = self.close_signal.send(true);
    }
}

/// Emitted whenever an agent connection leaves the registry, either by an
/// explicit unregister or by the heartbeat sweeper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDisconnected {
    pub group_id: i32,
    pub activation_code: String,
}

#[derive(Default)]
struct Tables {
    agents: HashMap<String, Connection>,
    dashboards: HashMap<String, Connection>,
}

/// Shared registry of live connections. All tables sit behind one `RwLock`
/// so a snapshot of agents and dashboards is always mutually consistent.
pub struct ConnectionRegistry {
    tables: RwLock<Tables>,
    disconnect_tx: mpsc::UnboundedSender<AgentDisconnected>,
}

pub fn generate_connection_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ConnectionRegistry {
    /// Creates the registry together with the receiving end of the agent
    /// disconnect stream. The caller owns the receiver and drains it from a
    /// dedicated task.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<AgentDisconnected>) {
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry {
            tables: RwLock::new(Tables::default()),
            disconnect_tx,
        });
        (registry, disconnect_rx)
    }

    pub async fn register(&self, connection: Connection) {
        let mut tables = self.tables.write().await;
        info!(
            connection_id = %connection.id,
            kind = connection.kind.as_str(),
            group_id = connection.group_id,
            activation_code = %connection.activation_code,
            "connection registered"
        );
        match connection.kind {
            ConnectionKind::Agent => tables.agents.insert(connection.id.clone(), connection),
            ConnectionKind::Dashboard => {
                tables.dashboards.insert(connection.id.clone(), connection)
            }
        };
    }

    /// Removes a connection. Agent departures additionally feed the
    /// disconnect stream so liveness can be re-evaluated downstream.
    pub async fn unregister(&self, connection_id: &str, kind: ConnectionKind) {
        let removed = {
            let mut tables = self.tables.write().await;
            match kind {
                ConnectionKind::Agent => tables.agents.remove(connection_id),
                ConnectionKind::Dashboard => tables.dashboards.remove(connection_id),
            }
        };
        if let Some(connection) = removed {
            info!(
                connection_id = %connection.id,
                kind = kind.as_str(),
                group_id = connection.group_id,
                "connection unregistered"
            );
            connection.signal_close();
            if connection.kind == ConnectionKind::Agent {
                let _ = self.disconnect_tx.send(AgentDisconnected {
                    group_id: connection.group_id,
                    activation_code: connection.activation_code,
                });
            }
        }
    }

    pub async fn update_heartbeat(&self, connection_id: &str, kind: ConnectionKind) {
        let mut tables = self.tables.write().await;
        let table = match kind {
            ConnectionKind::Agent => &mut tables.agents,
            ConnectionKind::Dashboard => &mut tables.dashboards,
        };
        if let Some(connection) = table.get_mut(connection_id) {
            connection.last_heartbeat = Utc::now();
        }
    }

    /// (agents, dashboards) currently registered.
    pub async fn connection_counts(&self) -> (usize, usize) {
        let tables = self.tables.read().await;
        (tables.agents.len(), tables.dashboards.len())
    }

    /// Last-heartbeat instants of every agent connection bound to the given
    /// activation code. Empty means the group has no live agent.
    pub async fn agent_heartbeats_for_code(&self, activation_code: &str) -> Vec<DateTime<Utc>> {
        let tables = self.tables.read().await;
        tables
            .agents
            .values()
            .filter(|c| c.activation_code == activation_code)
            .map(|c| c.last_heartbeat)
            .collect()
    }

    pub async fn has_agents(&self) -> bool {
        !self.tables.read().await.agents.is_empty()
    }

    /// Delivers a frame to every dashboard watching the group. Dashboards
    /// registered with group 0 observe all groups.
    pub async fn broadcast_to_group(&self, group_id: i32, payload: &str) {
        self.broadcast_dashboards(|c| c.group_id == group_id || c.group_id == 0, payload)
            .await;
    }

    pub async fn broadcast_to_all(&self, payload: &str) {
        self.broadcast_dashboards(|_| true, payload).await;
    }

    /// Fan-out with drop-on-full semantics: a consumer whose queue is full
    /// or closed is removed on the spot rather than allowed to stall the
    /// rest of the fan-out.
    async fn broadcast_dashboards<F>(&self, include: F, payload: &str)
    where
        F: Fn(&Connection) -> bool,
    {
        let mut dead: Vec<String> = Vec::new();
        {
            let tables = self.tables.read().await;
            for connection in tables.dashboards.values() {
                if !include(connection) {
                    continue;
                }
                if connection.sender.try_send(payload.to_string()).is_err() {
                    dead.push(connection.id.clone());
                }
            }
        }
        if dead.is_empty() {
            return;
        }
        let mut tables = self.tables.write().await;
        for id in dead {
            if let Some(connection) = tables.dashboards.remove(&id) {
                warn!(connection_id = %id, "dashboard dropped: send queue full or closed");
                connection.signal_close();
            }
        }
    }

    /// Removes every connection whose last heartbeat is older than
    /// `timeout`. Returns how many were dropped.
    pub async fn sweep_stale(&self, timeout: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(65));
        let mut dropped = 0;

        let mut tables = self.tables.write().await;
        let stale_agents: Vec<String> = tables
            .agents
            .values()
            .filter(|c| c.last_heartbeat < cutoff)
            .map(|c| c.id.clone())
            .collect();
        for id in stale_agents {
            if let Some(connection) = tables.agents.remove(&id) {
                warn!(
                    connection_id = %id,
                    group_id = connection.group_id,
                    activation_code = %connection.activation_code,
                    "agent dropped: heartbeat timeout"
                );
                connection.signal_close();
                let _ = self.disconnect_tx.send(AgentDisconnected {
                    group_id: connection.group_id,
                    activation_code: connection.activation_code,
                });
                dropped += 1;
            }
        }

        let stale_dashboards: Vec<String> = tables
            .dashboards
            .values()
            .filter(|c| c.last_heartbeat < cutoff)
            .map(|c| c.id.clone())
            .collect();
        for id in stale_dashboards {
            if let Some(connection) = tables.dashboards.remove(&id) {
                warn!(connection_id = %id, "dashboard dropped: heartbeat timeout");
                connection.signal_close();
                dropped += 1;
            }
        }
        dropped
    }

    /// Runs the periodic heartbeat sweep until the process exits.
    pub fn spawn_heartbeat_sweeper(
        self: &Arc<Self>,
        check_interval: Duration,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let dropped = registry.sweep_stale(timeout).await;
                if dropped > 0 {
                    debug!(dropped, "heartbeat sweep removed stale connections");
                }
            }
        })
    }

    /// Tears down every connection and empties the tables.
    pub async fn shutdown(&self) {
        let mut tables = self.tables.write().await;
        let total = tables.agents.len() + tables.dashboards.len();
        for connection in tables.agents.values().chain(tables.dashboards.values()) {
            connection.signal_close();
        }
        tables.agents.clear();
        tables.dashboards.clear();
        info!(connections = total, "registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(code: &str, group_id: i32) -> (Connection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(AGENT_QUEUE_CAPACITY);
        (
            Connection::new(ConnectionKind::Agent, group_id, code.to_string(), tx),
            rx,
        )
    }

    fn dashboard(group_id: i32, capacity: usize) -> (Connection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Connection::new(ConnectionKind::Dashboard, group_id, String::new(), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn register_and_unregister_track_counts() {
        let (registry, mut disconnects) = ConnectionRegistry::new();
        let (conn, _rx) = agent("CODE1", 1);
        let id = conn.id.clone();
        let handle = conn.clone();

        registry.register(conn).await;
        assert_eq!(registry.connection_counts().await, (1, 0));

        registry.unregister(&id, ConnectionKind::Agent).await;
        assert_eq!(registry.connection_counts().await, (0, 0));
        assert!(*handle.close_handle().borrow());

        let event = disconnects.recv().await.unwrap();
        assert_eq!(
            event,
            AgentDisconnected {
                group_id: 1,
                activation_code: "CODE1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn dashboard_departure_emits_no_agent_event() {
        let (registry, mut disconnects) = ConnectionRegistry::new();
        let (conn, _rx) = dashboard(1, 4);
        let id = conn.id.clone();

        registry.register(conn).await;
        registry.unregister(&id, ConnectionKind::Dashboard).await;

        assert!(disconnects.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_unknown_id_is_a_no_op() {
        let (registry, mut disconnects) = ConnectionRegistry::new();
        registry.unregister("missing", ConnectionKind::Agent).await;
        assert!(disconnects.try_recv().is_err());
    }

    #[tokio::test]
    async fn group_broadcast_reaches_watchers_and_global_dashboards() {
        let (registry, _disconnects) = ConnectionRegistry::new();
        let (watcher, mut watcher_rx) = dashboard(7, 4);
        let (global, mut global_rx) = dashboard(0, 4);
        let (other, mut other_rx) = dashboard(8, 4);
        registry.register(watcher).await;
        registry.register(global).await;
        registry.register(other).await;

        registry.broadcast_to_group(7, "stats").await;

        assert_eq!(watcher_rx.recv().await.unwrap(), "stats");
        assert_eq!(global_rx.recv().await.unwrap(), "stats");
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_dashboard_is_dropped_without_blocking() {
        let (registry, _disconnects) = ConnectionRegistry::new();
        let (slow, mut slow_rx) = dashboard(1, 1);
        let (healthy, mut healthy_rx) = dashboard(1, 4);
        registry.register(slow).await;
        registry.register(healthy).await;

        registry.broadcast_to_group(1, "first").await;
        // Slow consumer's queue of one is now full.
        registry.broadcast_to_group(1, "second").await;

        assert_eq!(registry.connection_counts().await, (0, 1));
        assert_eq!(healthy_rx.recv().await.unwrap(), "first");
        assert_eq!(healthy_rx.recv().await.unwrap(), "second");
        assert_eq!(slow_rx.recv().await.unwrap(), "first");
        assert!(slow_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_dashboard_is_told_to_close() {
        let (registry, _disconnects) = ConnectionRegistry::new();
        let (slow, _slow_rx) = dashboard(1, 1);
        let handle = slow.clone();
        registry.register(slow).await;

        registry.broadcast_to_group(1, "first").await;
        assert!(!*handle.close_handle().borrow());
        registry.broadcast_to_group(1, "second").await;

        assert_eq!(registry.connection_counts().await, (0, 0));
        assert!(*handle.close_handle().borrow());
    }

    #[tokio::test]
    async fn swept_connection_is_told_to_close() {
        let (registry, _disconnects) = ConnectionRegistry::new();
        let (mut stale, _stale_rx) = agent("STALE", 1);
        stale.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        let handle = stale.clone();
        registry.register(stale).await;

        registry.sweep_stale(Duration::from_secs(65)).await;

        assert!(*handle.close_handle().borrow());
    }

    #[tokio::test]
    async fn shutdown_closes_every_connection() {
        let (registry, _disconnects) = ConnectionRegistry::new();
        let (a, _a_rx) = agent("CODE1", 1);
        let (d, _d_rx) = dashboard(1, 4);
        let agent_handle = a.clone();
        let dashboard_handle = d.clone();
        registry.register(a).await;
        registry.register(d).await;

        registry.shutdown().await;

        assert_eq!(registry.connection_counts().await, (0, 0));
        assert!(*agent_handle.close_handle().borrow());
        assert!(*dashboard_handle.close_handle().borrow());
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_connections() {
        let (registry, mut disconnects) = ConnectionRegistry::new();
        let (mut stale, _stale_rx) = agent("STALE", 1);
        stale.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        let (fresh, _fresh_rx) = agent("FRESH", 1);
        registry.register(stale).await;
        registry.register(fresh).await;

        let dropped = registry.sweep_stale(Duration::from_secs(65)).await;

        assert_eq!(dropped, 1);
        assert_eq!(registry.connection_counts().await, (1, 0));
        assert_eq!(
            disconnects.recv().await.unwrap().activation_code,
            "STALE".to_string()
        );
    }

    #[tokio::test]
    async fn heartbeat_update_defers_sweep() {
        let (registry, _disconnects) = ConnectionRegistry::new();
        let (mut conn, _rx) = agent("CODE1", 1);
        conn.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        let id = conn.id.clone();
        registry.register(conn).await;

        registry.update_heartbeat(&id, ConnectionKind::Agent).await;
        let dropped = registry.sweep_stale(Duration::from_secs(65)).await;

        assert_eq!(dropped, 0);
        assert_eq!(registry.connection_counts().await, (1, 0));
    }

    #[tokio::test]
    async fn interleaved_registrations_never_lose_a_connection() {
        let (registry, _disconnects) = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..50 {
            let (conn, rx) = agent("CODE1", 1);
            receivers.push(rx);
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let id = conn.id.clone();
                registry.register(conn).await;
                id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        assert_eq!(registry.connection_counts().await, (50, 0));

        let mut handles = Vec::new();
        for id in ids.into_iter().take(20) {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.unregister(&id, ConnectionKind::Agent).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.connection_counts().await, (30, 0));
    }

    #[tokio::test]
    async fn heartbeats_are_scoped_to_activation_code() {
        let (registry, _disconnects) = ConnectionRegistry::new();
        let (a1, _rx1) = agent("CODE1", 1);
        let (a2, _rx2) = agent("CODE1", 1);
        let (b, _rx3) = agent("CODE2", 2);
        registry.register(a1).await;
        registry.register(a2).await;
        registry.register(b).await;

        assert_eq!(registry.agent_heartbeats_for_code("CODE1").await.len(), 2);
        assert_eq!(registry.agent_heartbeats_for_code("CODE2").await.len(), 1);
        assert!(registry.agent_heartbeats_for_code("CODE3").await.is_empty());
    }
}
