// src/core/cluster/keepalive.rs

//! Lightweight periodic heartbeat: detects peer liveness, drives removal of
//! unreachable members on the primary, and triggers elections on secondaries
//! when the primary goes silent.

use crate::core::cluster::election;
use crate::core::meta::{Smap, SnodeFlags};
use crate::core::metrics;
use crate::core::state::NodeContext;
use crate::core::{OpalError, metasync};
use dashmap::DashMap;
use reqwest::Method;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Per-peer liveness bookkeeping, shared between the keepalive loop and the
/// metasyncer (which reports delivery failures here).
#[derive(Debug, Default)]
pub struct HeartbeatTable {
    last_ok: DashMap<String, Instant>,
    failures: DashMap<String, u32>,
}

impl HeartbeatTable {
    pub fn new() -> Self {
        HeartbeatTable::default()
    }

    pub fn heard_from(&self, id: &str) {
        self.last_ok.insert(id.to_string(), Instant::now());
        self.failures.remove(id);
    }

    /// Records a failed probe and returns the consecutive-failure count.
    pub fn mark_failure(&self, id: &str) -> u32 {
        metrics::KEEPALIVE_FAILURES_TOTAL.inc();
        let mut count = self.failures.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn failures_of(&self, id: &str) -> u32 {
        self.failures.get(id).map(|c| *c).unwrap_or(0)
    }

    /// Drops bookkeeping for nodes no longer in the cluster map.
    pub fn retain_members(&self, smap: &Smap) {
        self.last_ok.retain(|id, _| smap.get_node(id).is_some());
        self.failures.retain(|id, _| smap.get_node(id).is_some());
    }
}

/// The main entry point for the keepalive background task.
pub async fn run(ctx: Arc<NodeContext>, mut shutdown_rx: broadcast::Receiver<()>) {
    info!("keepalive worker started");
    loop {
        let interval = ctx.cluster_config().await.keepalive.interval;
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("keepalive worker shutting down");
                return;
            }
            _ = sleep(interval) => {}
        }
        if ctx.is_stopping() {
            return;
        }
        if ctx.in_startup.load(Ordering::SeqCst) {
            continue;
        }
        let smap = ctx.smap.get().await;
        if smap.is_empty() {
            continue;
        }
        let self_id = ctx.self_id();
        if smap.is_primary(&self_id) {
            primary_tick(&ctx, &smap).await;
        } else {
            secondary_tick(&ctx, &smap, &self_id).await;
        }
    }
}

/// The primary probes every member; peers failing `retries` consecutive
/// probes are removed from the map and the new map is distributed.
async fn primary_tick(ctx: &Arc<NodeContext>, smap: &Smap) {
    let cc = ctx.cluster_config().await;
    let retries = cc.keepalive.retries;
    let self_id = ctx.self_id();
    let peers = smap.peers_of(&self_id);

    let probes = peers.iter().map(|peer| {
        let ctx = ctx.clone();
        let url = format!("{}/v1/health", peer.control_url);
        let id = peer.id.clone();
        async move {
            let res = ctx
                .request(Method::GET, &url)
                .await
                .timeout(ctx.cluster_config().await.timeout.cplane_operation)
                .send()
                .await;
            (id, res.map(|r| r.status().is_success()).unwrap_or(false))
        }
    });
    let results = futures::future::join_all(probes).await;

    let mut dead: Vec<String> = Vec::new();
    for (id, ok) in results {
        if ok {
            ctx.hb.heard_from(&id);
            continue;
        }
        let node = smap.get_node(&id);
        // Stopped and departing members are expected to be silent.
        if node
            .map(|n| {
                n.flags()
                    .intersects(SnodeFlags::SHUTDOWN | SnodeFlags::DECOMMISSION)
            })
            .unwrap_or(true)
        {
            continue;
        }
        let count = ctx.hb.mark_failure(&id);
        debug!("keepalive probe to {id} failed ({count}/{retries})");
        if count >= retries {
            dead.push(id);
        }
    }

    if !dead.is_empty() {
        if let Err(e) = remove_dead_members(ctx, dead).await {
            warn!("failed to remove unreachable members: {e}");
        }
    }
}

async fn remove_dead_members(ctx: &Arc<NodeContext>, dead: Vec<String>) -> Result<(), OpalError> {
    let ic_count = ctx.cluster_config().await.ic.count;
    let updated = ctx
        .smap
        .modify(
            |smap| {
                let mut removed = Vec::new();
                for id in &dead {
                    if smap.remove_node(id).is_some() {
                        removed.push(id.clone());
                    }
                }
                if removed.is_empty() {
                    return Ok(None);
                }
                smap.staff_ic(ic_count);
                smap.version += 1;
                Ok(Some(removed))
            },
            |_, removed| {
                warn!("removed unreachable members from the cluster map: {removed:?}");
            },
        )
        .await?;

    if updated.is_some() {
        let smap = ctx.smap.get().await;
        ctx.react_smap_change(&smap);
        let pair = metasync::RevPair::from_smap(
            &smap,
            metasync::ActionMsg::new(metasync::Action::RemoveNode {
                node_ids: updated.unwrap_or_default(),
            }),
        )?;
        metasync::sync(ctx, vec![pair]).await;
    }
    Ok(())
}

/// Secondaries probe the primary; sustained silence triggers an election.
async fn secondary_tick(ctx: &Arc<NodeContext>, smap: &Smap, self_id: &str) {
    let Some(primary) = smap.primary() else {
        return;
    };
    let cc = ctx.cluster_config().await;
    let url = format!("{}/v1/health", primary.control_url);
    let ok = match ctx
        .request(Method::GET, &url)
        .await
        .timeout(cc.timeout.cplane_operation)
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    };

    if ok {
        ctx.hb.heard_from(&primary.id);
        return;
    }
    let count = ctx.hb.mark_failure(&primary.id);
    debug!(
        "keepalive probe to primary {} failed ({count}/{})",
        primary.id, cc.keepalive.retries
    );
    if count >= cc.keepalive.retries {
        info!(
            "primary {} unreachable for {count} probes, considering an election",
            primary.id
        );
        election::primary_down(ctx, smap, self_id).await;
    }
}
