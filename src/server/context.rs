// src/server/context.rs

//! The assembled server: shared node context, listener, and task tracking.

use crate::core::notifs::NotifEvent;
use crate::core::state::NodeContext;
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

pub struct ServerContext {
    pub ctx: Arc<NodeContext>,
    /// Consumed by the spawner when the HTTP server task starts.
    pub listener: Option<TcpListener>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<()>>,
    /// Consumed by the spawner's completion-event dispatcher.
    pub notif_event_rx: Option<mpsc::UnboundedReceiver<NotifEvent>>,
}
