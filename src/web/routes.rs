use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};

use crate::db::services::{group_service, stats_service};
use crate::web::AppError;
use crate::ws::handler;
use crate::ws::hub::Notifier;
use crate::ws::registry::ConnectionRegistry;
use crate::ws::router::MessageRouter;

/// Shared state handed to every route.
pub struct AppState {
    pub pool: PgPool,
    pub registry: Arc<ConnectionRegistry>,
    pub router: MessageRouter,
    pub notifier: Notifier,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/ws/client", get(handler::agent_ws))
        .route("/ws/dashboard", get(handler::dashboard_ws))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "time": Utc::now().to_rfc3339()}))
}

/// Operational snapshot: live connection counts plus the rolling counters of
/// every group.
async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let (agents, dashboards) = state.registry.connection_counts().await;

    let mut groups = Vec::new();
    for group in group_service::list_groups(&state.pool).await? {
        let stats = stats_service::get_group_stats(&state.pool, group.id).await?;
        groups.push(json!({
            "group_id": group.id,
            "activation_code": group.activation_code,
            "is_active": group.is_active,
            "stats": stats,
        }));
    }

    Ok(Json(json!({
        "connections": {"agents": agents, "dashboards": dashboards},
        "groups": groups,
    })))
}
