//! Coordinator service binary

use axum::{extract::State, routing::get, Json, Router};
use shardlease_core::coordinator::{Coordinator, CoordinatorConfig, CoordinatorStatus};
use shardlease_core::runner::{HttpNotifier, NotifierConfig};
use shardlease_core::runtime::ShutdownSignal;
use shardlease_core::storage::file::FileStoreConfig;
use shardlease_core::storage::{FileLeaseStore, SystemClock};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

async fn status(State(coordinator): State<Arc<Coordinator>>) -> Json<CoordinatorStatus> {
    Json(coordinator.status())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting ShardLease coordinator");

    let config = CoordinatorConfig::from_env()?;
    let state_dir = PathBuf::from(std::env::var("STATE_DIR").unwrap_or_else(|_| "./shardlease-state".into()));
    let bind_addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9100".into())
        .parse()?;

    info!("Using lease store at {}", state_dir.display());
    let store = FileLeaseStore::open(FileStoreConfig {
        dir: state_dir,
        lease_ttl: config.lease_ttl,
        ..Default::default()
    })
    .await?;

    let notifier = HttpNotifier::new(NotifierConfig {
        request_timeout: config.call_timeout,
        ..Default::default()
    })?;

    let coordinator = Arc::new(Coordinator::new(
        config,
        Arc::new(store),
        Arc::new(notifier),
        Arc::new(SystemClock),
    )?);

    let shutdown = ShutdownSignal::new();
    let loop_handle = coordinator.clone().start(shutdown.clone());

    // Status / metrics API
    let app = Router::new()
        .route("/metrics", get(|| async { shardlease_core::metrics::gather_coordinator_metrics() }))
        .route("/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(coordinator);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Status API listening on {}", bind_addr);

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.wait().await })
            .await;
        if let Err(e) = result {
            error!("Status server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.shutdown();

    let _ = loop_handle.await;
    let _ = server.await;
    info!("Coordinator stopped");
    Ok(())
}
