// src/server/initialization.rs

//! Builds the node context and binds the control listener.

use super::context::ServerContext;
use crate::config::NodeConfig;
use crate::core::state::NodeContext;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

pub async fn setup(
    config: NodeConfig,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    let (shutdown_tx, _) = broadcast::channel(8);

    let bind_addr = listen_addr(&config)?;
    let init = NodeContext::initialize(config, shutdown_tx.clone(), log_reload_handle)
        .context("failed to initialize node state")?;

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind control listener on {bind_addr}"))?;
    info!("bound control listener on {bind_addr}");

    Ok(ServerContext {
        ctx: init.ctx,
        listener: Some(listener),
        shutdown_tx,
        background_tasks: JoinSet::new(),
        notif_event_rx: Some(init.notif_event_rx),
    })
}

/// The listen address is derived from the announced control URL: same port,
/// all interfaces.
fn listen_addr(config: &NodeConfig) -> Result<String> {
    let url = url::Url::parse(&config.net.control_url)
        .with_context(|| format!("bad control URL '{}'", config.net.control_url))?;
    let port = url
        .port_or_known_default()
        .context("control URL has no port")?;
    Ok(format!("0.0.0.0:{port}"))
}
