use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inflow_backend::db;
use inflow_backend::db::services::{device_service, stats_service};
use inflow_backend::scheduler;
use inflow_backend::server::config::ServerConfig;
use inflow_backend::web::routes::{build_router, AppState};
use inflow_backend::ws::hub::Notifier;
use inflow_backend::ws::registry::{AgentDisconnected, ConnectionRegistry};
use inflow_backend::ws::router::MessageRouter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    let pool = db::connect(&config.database_url).await?;
    info!("database connected, migrations applied");

    let (registry, disconnect_rx) = ConnectionRegistry::new();
    let _sweeper =
        registry.spawn_heartbeat_sweeper(config.heartbeat_check_interval, config.heartbeat_timeout);

    let notifier = Notifier::new(pool.clone(), Arc::clone(&registry));
    spawn_disconnect_consumer(
        pool.clone(),
        Arc::clone(&registry),
        notifier.clone(),
        disconnect_rx,
    );
    scheduler::spawn_all(pool.clone(), Arc::clone(&registry), notifier.clone());

    let state = Arc::new(AppState {
        pool: pool.clone(),
        registry: Arc::clone(&registry),
        router: MessageRouter::new(pool, Arc::clone(&registry), notifier.clone()),
        notifier,
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;
    Ok(())
}

/// Drains agent departure events. When a departure leaves the activation
/// code without any live agent connection, every device still marked online
/// under that code is taken offline and the group's counters follow.
fn spawn_disconnect_consumer(
    pool: sqlx::PgPool,
    registry: Arc<ConnectionRegistry>,
    notifier: Notifier,
    mut disconnect_rx: mpsc::UnboundedReceiver<AgentDisconnected>,
) {
    tokio::spawn(async move {
        while let Some(event) = disconnect_rx.recv().await {
            if !registry
                .agent_heartbeats_for_code(&event.activation_code)
                .await
                .is_empty()
            {
                continue;
            }

            match device_service::mark_group_devices_offline(&pool, &event.activation_code).await {
                Ok(0) => {}
                Ok(marked) => {
                    info!(
                        group_id = event.group_id,
                        activation_code = %event.activation_code,
                        marked,
                        "last agent connection gone, devices taken offline"
                    );
                    if let Err(e) =
                        stats_service::refresh_group_online_count(&pool, event.group_id).await
                    {
                        warn!(group_id = event.group_id, error = %e, "online count refresh failed");
                    }
                    notifier.broadcast_group_stats(event.group_id).await;
                }
                Err(e) => {
                    error!(
                        group_id = event.group_id,
                        error = %e,
                        "offline marking after disconnect failed"
                    );
                }
            }
        }
    });
}

async fn shutdown_signal(registry: Arc<ConnectionRegistry>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "shutdown signal listener failed");
        return;
    }
    info!("shutdown signal received");
    registry.shutdown().await;
}
