//! Standalone mode — the whole control plane in one process.
//!
//! In this mode, the daemon:
//! 1. Opens the state store under the data directory
//! 2. Builds the public IP pools and the simulated router agent
//! 3. Restores persisted routers (pool reservations, health monitors)
//! 4. Runs the lifecycle supervisor in the background
//! 5. Serves the REST API until Ctrl-C

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use vpcgrid_agent::{SimulatedAgent, ZonePool};
use vpcgrid_core::VpcGridConfig;
use vpcgrid_service::NetworkService;
use vpcgrid_state::StateStore;

pub async fn run_standalone(
    port: u16,
    data_dir: PathBuf,
    config: VpcGridConfig,
) -> anyhow::Result<()> {
    info!("vpcd starting in standalone mode");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join(&config.store.file);

    // ── Initialize subsystems ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let pool = Arc::new(ZonePool::new(&config.zones)?);
    info!(zones = config.zones.len(), "public IP pools initialized");

    let agent = Arc::new(SimulatedAgent::new());
    info!("simulated router agent initialized");

    let service = NetworkService::assemble(state, agent, pool, &config);
    service.lifecycle().restore().await?;
    info!("persisted routers restored");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let lifecycle = service.lifecycle().clone();
    let supervisor_handle = tokio::spawn(async move {
        if let Err(e) = lifecycle.run(shutdown_rx).await {
            error!(error = %e, "lifecycle supervisor exited");
        }
    });

    // ── Start API server ───────────────────────────────────────

    let router = vpcgrid_api::build_router(service);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = supervisor_handle.await;

    info!("vpcd stopped");
    Ok(())
}
