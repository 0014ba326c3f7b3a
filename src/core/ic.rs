// src/core/ic.rs

//! Information-center plumbing: keeping the fixed-size set of proxies that
//! co-own the notification tables staffed and in sync.
//!
//! Staffing itself is a cluster-map mutation (`Smap::staff_ic`) performed by
//! the primary; this module ships the ownership tables to members and fans
//! aborts out to notifiers.

use crate::core::meta::Smap;
use crate::core::notifs::NotifListener;
use crate::core::state::NodeContext;
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registers a listener on this (IC-member) node and replicates the tables
/// to the other members, so the operation is queryable from any of them.
pub async fn register_listener(ctx: &Arc<NodeContext>, nl: NotifListener) {
    let uuid = nl.uuid.clone();
    if let Err(e) = ctx.notifs.add(nl) {
        warn!("failed to track operation {uuid}: {e}");
        return;
    }
    sync_tables(ctx).await;
}

/// Ships the full notification tables to every other IC member. Invoked
/// after local registration and on demand when a proxy is promoted into the
/// IC following membership churn.
pub async fn sync_tables(ctx: &Arc<NodeContext>) {
    let dump = match ctx.notifs.dump() {
        Ok(d) => d,
        Err(e) => {
            warn!("failed to serialize notification tables: {e}");
            return;
        }
    };
    let smap = ctx.smap.get().await;
    let self_id = ctx.self_id();
    for member in smap.ic_members() {
        if member.id == self_id {
            continue;
        }
        let url = format!("{}/v1/notifs", member.control_url);
        let res = ctx
            .request(Method::PUT, &url)
            .await
            .json(&dump)
            .send()
            .await;
        match res {
            Ok(resp) if resp.status().is_success() => {
                debug!("synced notification tables to {}", member.id)
            }
            Ok(resp) => warn!(
                "notification-table sync to {} answered HTTP {}",
                member.id,
                resp.status()
            ),
            Err(e) => warn!("notification-table sync to {} failed: {e}", member.id),
        }
    }
}

/// Broadcasts an administrative abort of `uuid` to all of its notifiers.
pub async fn broadcast_abort(ctx: &Arc<NodeContext>, smap: &Smap, nl: &NotifListener) {
    info!("broadcasting abort of {} to {} notifier(s)", nl.uuid, nl.notifiers.len());
    for node_id in &nl.notifiers {
        let Some(node) = smap.get_node(node_id) else {
            continue;
        };
        let url = format!("{}/v1/notifs/{}", node.control_url, nl.uuid);
        if let Err(e) = ctx.request(Method::DELETE, &url).await.send().await {
            debug!("abort of {} on {} failed: {e}", nl.uuid, node_id);
        }
    }
}

/// A newly seated IC member asks the primary for the current tables.
pub async fn pull_tables_from_primary(ctx: &Arc<NodeContext>) {
    let smap = ctx.smap.get().await;
    let Some(primary) = smap.primary() else {
        return;
    };
    if primary.id == ctx.self_id() {
        return;
    }
    let url = format!("{}/v1/notifs", primary.control_url);
    match ctx.request(Method::GET, &url).await.send().await {
        Ok(resp) if resp.status().is_success() => match resp.json().await {
            Ok(dump) => {
                if let Err(e) = ctx.notifs.absorb(dump) {
                    warn!("failed to absorb notification tables: {e}");
                } else {
                    info!("absorbed notification tables from primary {}", primary.id);
                }
            }
            Err(e) => warn!("bad notification-table payload from primary: {e}"),
        },
        Ok(resp) => debug!("primary answered HTTP {} to table pull", resp.status()),
        Err(e) => debug!("notification-table pull from primary failed: {e}"),
    }
}
