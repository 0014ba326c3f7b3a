// src/server/mod.rs

use crate::config::NodeConfig;
use crate::core::cluster::bootstrap;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, reload};

mod context;
pub mod http;
mod initialization;
mod spawner;

/// The main server startup function, orchestrating all setup phases.
pub async fn run(
    config: NodeConfig,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<()> {
    // 1. Initialize node state and bind the control listener.
    let mut server_context = initialization::setup(config, log_reload_handle).await?;

    // 2. Spawn the HTTP server and all background tasks. The listener must
    //    be up before bootstrap so that joins and discovery can reach us.
    spawner::spawn_all(&mut server_context)?;

    // 3. Converge into a cluster. A cluster-integrity failure or a failed
    //    initial join is fatal and exits non-zero.
    let ctx = server_context.ctx.clone();
    if let Err(e) = bootstrap::run(ctx.clone()).await {
        error!("startup failed: {e}");
        let _ = server_context.shutdown_tx.send(());
        return Err(e).context("cluster bootstrap failed");
    }

    // 4. Serve until a shutdown is requested, either administratively or by
    //    the operator.
    let mut shutdown_rx = server_context.shutdown_tx.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            crate::core::cluster::maintenance::self_shutdown(&ctx);
        }
        _ = shutdown_rx.recv() => {}
    }

    // 5. Drain background tasks.
    while let Some(res) = server_context.background_tasks.join_next().await {
        if let Err(e) = res {
            error!("a background task panicked: {e}");
        }
    }
    info!("node stopped");
    Ok(())
}
