use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::db::models::Group;
use crate::db::services::group_service;
use crate::web::routes::AppState;
use crate::web::AppError;
use crate::ws::models::WireMessage;
use crate::ws::registry::{
    Connection, ConnectionKind, AGENT_QUEUE_CAPACITY, DASHBOARD_QUEUE_CAPACITY,
};

/// Server-initiated pings keep intermediaries from idling the socket out;
/// liveness itself is judged on application heartbeats.
const PING_INTERVAL: Duration = Duration::from_secs(54);

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    pub activation_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DashboardQuery {
    /// Group to watch; omitted or 0 means every group.
    pub group_id: Option<i32>,
}

/// `GET /ws/client` — agent connections. The activation code is resolved
/// before the upgrade, so a bad code fails as plain HTTP.
pub async fn agent_ws(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let group = match resolve_group(&state, query.activation_code.as_deref()).await {
        Ok(group) => group,
        Err(e) => {
            warn!(error = %e, "agent connection rejected");
            return e.into_response();
        }
    };
    ws.on_upgrade(move |socket| run_agent(socket, state, group))
}

/// `GET /ws/dashboard` — dashboard consumers.
pub async fn dashboard_ws(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DashboardQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let group_id = query.group_id.unwrap_or(0);
    if group_id != 0 {
        match group_service::get_group_by_id(&state.pool, group_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return AppError::NotFound(format!("group not found: {group_id}")).into_response()
            }
            Err(e) => return e.into_response(),
        }
    }
    ws.on_upgrade(move |socket| run_dashboard(socket, state, group_id))
}

async fn resolve_group(state: &AppState, code: Option<&str>) -> Result<Group, AppError> {
    let code = code
        .filter(|c| !c.is_empty())
        .ok_or(AppError::MissingActivationCode)?;
    let group = group_service::get_group_by_activation_code(&state.pool, code)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("unknown activation code: {code}")))?;
    if !group.is_active {
        return Err(AppError::GroupDisabled);
    }
    Ok(group)
}

async fn run_agent(socket: WebSocket, state: Arc<AppState>, group: Group) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel::<String>(AGENT_QUEUE_CAPACITY);

    let connection = Connection::new(
        ConnectionKind::Agent,
        group.id,
        group.activation_code.clone(),
        tx.clone(),
    );
    let connection_id = connection.id.clone();
    state.registry.register(connection.clone()).await;

    let hello = WireMessage::outbound(
        "auth_success",
        json!({
            "connection_id": connection_id,
            "group_id": group.id,
            "remark": group.remark,
            "activation_code": group.activation_code,
        }),
    );
    if tx.send(hello.encode()).await.is_err() {
        state
            .registry
            .unregister(&connection_id, ConnectionKind::Agent)
            .await;
        return;
    }

    let writer = tokio::spawn(write_pump(sink, rx));
    read_agent_frames(stream, &state, &connection, &group).await;

    state
        .registry
        .unregister(&connection_id, ConnectionKind::Agent)
        .await;
    drop(connection);
    drop(tx);
    let _ = writer.await;
    debug!(connection_id = %connection_id, "agent connection closed");
}

async fn run_dashboard(socket: WebSocket, state: Arc<AppState>, group_id: i32) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel::<String>(DASHBOARD_QUEUE_CAPACITY);

    let connection = Connection::new(ConnectionKind::Dashboard, group_id, String::new(), tx.clone());
    let connection_id = connection.id.clone();
    state.registry.register(connection.clone()).await;

    let hello = WireMessage::outbound(
        "connected",
        json!({"connection_id": connection_id, "group_id": group_id}),
    );
    if tx.send(hello.encode()).await.is_err() {
        state
            .registry
            .unregister(&connection_id, ConnectionKind::Dashboard)
            .await;
        return;
    }
    if group_id != 0 {
        state.notifier.broadcast_group_stats(group_id).await;
    }

    let writer = tokio::spawn(write_pump(sink, rx));
    read_dashboard_frames(stream, &state, &connection).await;

    state
        .registry
        .unregister(&connection_id, ConnectionKind::Dashboard)
        .await;
    drop(connection);
    drop(tx);
    let _ = writer.await;
    debug!(connection_id = %connection_id, "dashboard connection closed");
}

async fn read_agent_frames(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    connection: &Connection,
    group: &Group,
) {
    let mut close_rx = connection.close_handle();
    loop {
        let message = tokio::select! {
            _ = close_rx.changed() => {
                debug!(connection_id = %connection.id, "agent connection closed by registry");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    debug!(connection_id = %connection.id, error = %e, "agent socket error");
                    break;
                }
                None => break,
            },
        };
        match message {
            Message::Text(text) => {
                let reply = state
                    .router
                    .handle_agent_frame(connection, group, text.as_str())
                    .await;
                if deliver_reply(connection, reply).await.is_err() {
                    break;
                }
            }
            Message::Pong(_) => {
                state
                    .registry
                    .update_heartbeat(&connection.id, connection.kind)
                    .await;
            }
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) => {}
        }
    }
}

async fn read_dashboard_frames(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    connection: &Connection,
) {
    let mut close_rx = connection.close_handle();
    loop {
        let message = tokio::select! {
            _ = close_rx.changed() => {
                debug!(connection_id = %connection.id, "dashboard connection closed by registry");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    debug!(connection_id = %connection.id, error = %e, "dashboard socket error");
                    break;
                }
                None => break,
            },
        };
        match message {
            Message::Text(text) => {
                let reply = state
                    .router
                    .handle_dashboard_frame(connection, text.as_str())
                    .await;
                if deliver_reply(connection, reply).await.is_err() {
                    break;
                }
            }
            Message::Pong(_) => {
                state
                    .registry
                    .update_heartbeat(&connection.id, connection.kind)
                    .await;
            }
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) => {}
        }
    }
}

/// Turns a router result into a frame for the originating connection. A
/// failed operation produces an error frame; the connection stays open.
async fn deliver_reply(
    connection: &Connection,
    reply: Result<WireMessage, AppError>,
) -> Result<(), ()> {
    let frame = match reply {
        Ok(frame) => frame,
        Err(e) if e.is_client_fault() => {
            info!(connection_id = %connection.id, error = %e, "frame rejected");
            WireMessage::error_frame(&e.to_string())
        }
        Err(e) => {
            error!(connection_id = %connection.id, error = %e, "frame handling failed");
            WireMessage::error_frame("internal server error")
        }
    };
    connection
        .sender
        .send(frame.encode())
        .await
        .map_err(|_| ())
}

async fn write_pump(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<String>) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately.
    ping.tick().await;
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}
