//! Runner binary
//!
//! Serves shards on the coordinator's instruction and keeps the leases
//! behind them alive.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use shardlease_core::coordinator::{Runner, RunnerAddress, ShardId};
use shardlease_core::runner::{KeeperConfig, LeaseKeeper, RunnerPhase, RunnerState};
use shardlease_core::runtime::ShutdownSignal;
use shardlease_core::storage::file::FileStoreConfig;
use shardlease_core::storage::FileLeaseStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Serialize)]
struct ShardsView {
    address: String,
    version: u64,
    shards: Vec<ShardId>,
}

async fn assign(State(state): State<Arc<RunnerState>>, Path(shard): Path<ShardId>) -> StatusCode {
    if state.phase().await != RunnerPhase::Registered {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if state.start_serving(shard).await {
        info!("Serving shard {}", shard);
    }
    StatusCode::OK
}

async fn unassign(State(state): State<Arc<RunnerState>>, Path(shard): Path<ShardId>) -> StatusCode {
    if state.stop_serving(shard).await {
        info!("Stopped serving shard {}", shard);
    }
    StatusCode::OK
}

async fn shards(State(state): State<Arc<RunnerState>>) -> Json<ShardsView> {
    let runner = state.runner();
    Json(ShardsView {
        address: runner.address.encode(),
        version: runner.version,
        shards: state.served().await,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let host = std::env::var("RUNNER_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("RUNNER_PORT").unwrap_or_else(|_| "7000".into()).parse()?;
    let version: u64 = std::env::var("RUNNER_VERSION").unwrap_or_else(|_| "1".into()).parse()?;
    let state_dir = PathBuf::from(std::env::var("STATE_DIR").unwrap_or_else(|_| "./shardlease-state".into()));

    let address = RunnerAddress::new(host, port);
    info!("Starting runner {} (version {})", address, version);

    let keeper_config = KeeperConfig::default();
    let store = FileLeaseStore::open(FileStoreConfig {
        dir: state_dir,
        lease_ttl: keeper_config.lease_ttl,
        ..Default::default()
    })
    .await?;

    let state = Arc::new(RunnerState::new(Runner::new(address, version)));
    let keeper = Arc::new(LeaseKeeper::new(keeper_config, Arc::new(store), state.clone())?);
    keeper.register().await?;

    let shutdown = ShutdownSignal::new();
    let keeper_handle = {
        let keeper = keeper.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { keeper.run(shutdown).await })
    };

    let app = Router::new()
        .route("/shards", get(shards))
        .route("/shards/:id/assign", post(assign))
        .route("/shards/:id/unassign", post(unassign))
        .with_state(state);

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Runner API listening on {}", bind_addr);

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.wait().await })
            .await;
        if let Err(e) = result {
            error!("Runner server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Draining runner");
    shutdown.shutdown();

    // The keeper releases every lease on its way out
    let _ = keeper_handle.await;
    let _ = server.await;
    Ok(())
}
