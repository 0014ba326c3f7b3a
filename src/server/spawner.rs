// src/server/spawner.rs

//! Spawns all of the node's long-running background tasks.

use super::context::ServerContext;
use super::http;
use crate::core::cluster::keepalive;
use crate::core::notifs::housekeeper;
use crate::core::{ic, notifs::NotifEvent};
use anyhow::Result;
use tracing::info;

/// Spawns the control-plane server and every background worker into the
/// context's JoinSet.
pub fn spawn_all(sctx: &mut ServerContext) -> Result<()> {
    let ctx = sctx.ctx.clone();
    let shutdown_tx = &sctx.shutdown_tx;

    // --- Control-plane HTTP server ---
    let listener = sctx
        .listener
        .take()
        .expect("spawn_all called with the listener already consumed");
    let http_ctx = ctx.clone();
    let shutdown_rx_http = shutdown_tx.subscribe();
    sctx.background_tasks.spawn(async move {
        http::serve(listener, http_ctx, shutdown_rx_http).await;
        Ok(())
    });

    // --- Keepalive ---
    let ka_ctx = ctx.clone();
    let shutdown_rx_ka = shutdown_tx.subscribe();
    sctx.background_tasks.spawn(async move {
        keepalive::run(ka_ctx, shutdown_rx_ka).await;
        Ok(())
    });

    // --- Notification housekeeping ---
    let hk_ctx = ctx.clone();
    let shutdown_rx_hk = shutdown_tx.subscribe();
    sctx.background_tasks.spawn(async move {
        housekeeper::run(hk_ctx, shutdown_rx_hk).await;
        Ok(())
    });

    // --- Completion-event dispatcher ---
    if let Some(mut event_rx) = sctx.notif_event_rx.take() {
        let ev_ctx = ctx.clone();
        let mut shutdown_rx_ev = shutdown_tx.subscribe();
        sctx.background_tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx_ev.recv() => return Ok(()),
                    event = event_rx.recv() => {
                        let Some(event) = event else { return Ok(()) };
                        handle_notif_event(&ev_ctx, event).await;
                    }
                }
            }
        });
    }

    info!("all background tasks have been spawned");
    Ok(())
}

/// Reacts to a listener completing: an abort initiated through the primary
/// fans out to every notifier.
async fn handle_notif_event(ctx: &std::sync::Arc<crate::core::NodeContext>, event: NotifEvent) {
    info!(
        "operation {} ({}) completed{}",
        event.uuid,
        event.kind,
        if event.aborted { " [aborted]" } else { "" }
    );
    if !event.aborted {
        return;
    }
    let smap = ctx.smap.get().await;
    if !smap.is_primary(&ctx.self_id()) {
        return;
    }
    if let Some(nl) = ctx.notifs.get(&event.uuid) {
        ic::broadcast_abort(ctx, &smap, &nl).await;
    }
}
