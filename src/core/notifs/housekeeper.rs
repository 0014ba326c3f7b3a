// src/core/notifs/housekeeper.rs

//! Periodic IC maintenance: pruning finished operations, probing silent
//! notifiers, and pulling the tables when this proxy is promoted into the IC.

use crate::core::state::NodeContext;
use crate::core::ic;
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info};

pub async fn run(ctx: Arc<NodeContext>, mut shutdown_rx: broadcast::Receiver<()>) {
    info!("notification housekeeper started");
    let mut was_ic_member = ctx.self_snode().is_ic_member();
    loop {
        let cc = ctx.cluster_config().await;
        let interval = cc.timeout.max_keepalive;
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("notification housekeeper shutting down");
                return;
            }
            _ = sleep(interval) => {}
        }
        if ctx.is_stopping() {
            return;
        }

        let snode = ctx.self_snode();
        let smap = ctx.smap.get().await;
        let is_member = snode.is_ic_member() || smap.is_primary(&snode.id);

        // Freshly seated members pull the tables on demand.
        if is_member && !was_ic_member {
            info!("promoted into the information center, pulling tables");
            ic::pull_tables_from_primary(&ctx).await;
        }
        was_ic_member = is_member;
        if !is_member {
            continue;
        }

        ctx.notifs.prune_fin();

        let progress_interval_ms = (interval * 2).as_millis() as u64;
        for (uuid, silent) in ctx.notifs.stale_running(progress_interval_ms) {
            for node_id in silent {
                let Some(node) = smap.get_node(&node_id) else {
                    continue;
                };
                let url = format!("{}/v1/notifs/{uuid}", node.control_url);
                let res = ctx
                    .request(Method::GET, &url)
                    .await
                    .timeout(cc.timeout.cplane_operation)
                    .send()
                    .await;
                match res {
                    Ok(resp) if resp.status().is_success() => {
                        if let Ok(stats) = resp.json::<serde_json::Value>().await {
                            ctx.notifs.handle_progress(&uuid, &node_id, stats);
                        }
                    }
                    Ok(resp) if resp.status().as_u16() == 404 => {
                        // Silent past the progress interval and unknown on
                        // the notifier: it is not running there.
                        debug!("operation {uuid} not found on {node_id}");
                        ctx.notifs.mark_lost(&uuid, &node_id);
                    }
                    Ok(_) | Err(_) => {
                        debug!("stats probe of {uuid} on {node_id} inconclusive");
                    }
                }
            }
        }
    }
}
