// src/core/cluster/election.rs

//! Primary elections.
//!
//! When keepalive declares the primary dead, every node independently
//! computes the successor with HRW over the electable proxies. The agreed
//! candidate campaigns: it collects votes from the remaining members, and on
//! a strict majority announces itself, bumps the map version by the takeover
//! gap, and metasyncs the new map. While a node has voted and the outcome is
//! unknown, its ownership tables refuse incoming revisions.

use crate::core::hrw;
use crate::core::meta::{SMAP_VERSION_TAKEOVER_JUMP, Smap, Snode};
use crate::core::metasync::{Action, ActionMsg, RevPair};
use crate::core::state::NodeContext;
use crate::core::{metasync, metrics};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRecord {
    pub candidate: Snode,
    /// The primary presumed dead.
    pub primary_id: String,
    pub smap_version: u64,
    pub smap_uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRes {
    pub yes: bool,
    #[serde(default)]
    pub reason: String,
}

/// Announcement of a settled election, broadcast by the winner before it
/// metasyncs the new map, so voters unfreeze their ownership tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResultMsg {
    pub new_primary_id: String,
    pub smap_version: u64,
}

/// Reaction to a silent primary: campaign if this node is the agreed
/// successor, otherwise nudge the successor in case its own keepalive has
/// not fired yet.
pub async fn primary_down(ctx: &Arc<NodeContext>, smap: &Smap, self_id: &str) {
    let Some(next) = hrw::next_primary(smap) else {
        warn!("primary unreachable but no electable successor exists");
        return;
    };
    if next.id == self_id {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            campaign(ctx).await;
        });
        return;
    }
    // Not our turn; make sure the successor knows.
    let record = VoteRecord {
        candidate: next.clone(),
        primary_id: smap.primary_id.clone(),
        smap_version: smap.version,
        smap_uuid: smap.uuid.clone(),
    };
    let url = format!("{}/v1/vote/init", next.control_url);
    if let Err(e) = ctx.request(Method::POST, &url).await.json(&record).send().await {
        warn!("failed to nudge election candidate {}: {e}", next.id);
    }
}

/// Runs one election round with this node as the candidate.
pub async fn campaign(ctx: Arc<NodeContext>) {
    if ctx
        .vote_in_progress
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    metrics::ELECTIONS_TOTAL.inc();
    let result = run_campaign(&ctx).await;
    ctx.vote_in_progress.store(false, Ordering::SeqCst);
    match result {
        Ok(true) => info!("election won; this node is now the primary"),
        Ok(false) => info!("election lost or yielded; remaining secondary"),
        Err(e) => warn!("election failed: {e}"),
    }
}

async fn run_campaign(ctx: &Arc<NodeContext>) -> Result<bool, crate::core::OpalError> {
    let smap = ctx.smap.get().await;
    let self_snode = ctx.self_snode();
    let old_primary_id = smap.primary_id.clone();

    // Re-confirm we are the agreed successor on the latest map.
    match hrw::next_primary(&smap) {
        Some(next) if next.id == self_snode.id => {}
        _ => return Ok(false),
    }
    // Re-confirm the primary is actually down.
    if let Some(primary) = smap.primary() {
        let url = format!("{}/v1/health", primary.control_url);
        let cplane = ctx.cluster_config().await.timeout.cplane_operation;
        if let Ok(resp) = ctx
            .request(Method::GET, &url)
            .await
            .timeout(cplane)
            .send()
            .await
        {
            if resp.status().is_success() {
                info!("primary {} answered the pre-vote probe, standing down", primary.id);
                ctx.hb.heard_from(&primary.id);
                return Ok(false);
            }
        }
    }

    let record = VoteRecord {
        candidate: self_snode.clone(),
        primary_id: old_primary_id.clone(),
        smap_version: smap.version,
        smap_uuid: smap.uuid.clone(),
    };
    let voters: Vec<Snode> = smap
        .peers_of(&self_snode.id)
        .into_iter()
        .filter(|n| n.id != old_primary_id)
        .collect();
    let electorate = voters.len() + 1; // including self

    let cplane = ctx.cluster_config().await.timeout.cplane_operation;
    let ballots = voters.iter().map(|voter| {
        let ctx = ctx.clone();
        let record = record.clone();
        let url = format!("{}/v1/vote/proxy", voter.control_url);
        async move {
            let res = ctx
                .request(Method::POST, &url)
                .await
                .timeout(cplane)
                .json(&record)
                .send()
                .await;
            match res {
                Ok(resp) if resp.status().is_success() => {
                    resp.json::<VoteRes>().await.map(|v| v.yes).unwrap_or(false)
                }
                _ => false,
            }
        }
    });
    let yes = futures::future::join_all(ballots)
        .await
        .into_iter()
        .filter(|v| *v)
        .count()
        + 1; // self-vote

    if yes * 2 <= electorate {
        info!("election: {yes}/{electorate} votes, no majority");
        return Ok(false);
    }
    info!("election: won with {yes}/{electorate} votes, taking over from {old_primary_id}");
    become_primary(ctx, &old_primary_id).await?;
    Ok(true)
}

/// Commits the takeover: the dead primary leaves the map, this node becomes
/// primary, and the version jumps by the takeover gap so the new reign
/// orders above anything the old primary may still be distributing.
async fn become_primary(
    ctx: &Arc<NodeContext>,
    old_primary_id: &str,
) -> Result<(), crate::core::OpalError> {
    let self_id = ctx.self_id();
    let ic_count = ctx.cluster_config().await.ic.count;
    ctx.smap
        .modify(
            |smap| {
                smap.remove_node(old_primary_id);
                smap.primary_id = self_id.clone();
                smap.version += SMAP_VERSION_TAKEOVER_JUMP;
                smap.staff_ic(ic_count);
                Ok(Some(()))
            },
            |installed, _| {
                info!("installed {}", installed.string_ex());
            },
        )
        .await?;

    let smap = ctx.smap.get().await;
    ctx.react_smap_change(&smap);

    // Unfreeze voters before the map lands on them.
    let announce = VoteResultMsg {
        new_primary_id: self_id.clone(),
        smap_version: smap.version,
    };
    for peer in smap.peers_of(&self_id) {
        let url = format!("{}/v1/vote/primary", peer.control_url);
        let _ = ctx.request(Method::PUT, &url).await.json(&announce).send().await;
    }

    let pair = RevPair::from_smap(
        &smap,
        ActionMsg::new(Action::NewPrimary {
            node_id: self_id.clone(),
        }),
    )?;
    metasync::sync(ctx, vec![pair]).await;
    Ok(())
}

/// Voter-side evaluation of a vote request.
pub async fn handle_vote_request(ctx: &Arc<NodeContext>, record: &VoteRecord) -> VoteRes {
    let smap = ctx.smap.get().await;

    if !smap.uuid.is_empty()
        && !record.smap_uuid.is_empty()
        && smap.uuid != record.smap_uuid
    {
        return VoteRes {
            yes: false,
            reason: format!(
                "cluster map UUID mismatch: {} vs {}",
                smap.uuid, record.smap_uuid
            ),
        };
    }
    if record.smap_version < smap.version {
        return VoteRes {
            yes: false,
            reason: format!(
                "candidate's map v{} is older than local v{}",
                record.smap_version, smap.version
            ),
        };
    }
    // The candidate must be the successor this node computes as well.
    match hrw::next_primary(&smap) {
        Some(next) if next.id == record.candidate.id => {}
        Some(next) => {
            return VoteRes {
                yes: false,
                reason: format!("local HRW ranks {} first", next.id),
            };
        }
        None => {
            return VoteRes {
                yes: false,
                reason: "no electable successor".into(),
            };
        }
    }
    // Sanity probe: refuse if the primary still answers.
    if ctx.hb.failures_of(&record.primary_id) == 0 {
        if let Some(primary) = smap.get_node(&record.primary_id) {
            let cplane = ctx.cluster_config().await.timeout.cplane_operation;
            let url = format!("{}/v1/health", primary.control_url);
            if let Ok(resp) = ctx
                .request(Method::GET, &url)
                .await
                .timeout(cplane)
                .send()
                .await
            {
                if resp.status().is_success() {
                    return VoteRes {
                        yes: false,
                        reason: "primary is alive".into(),
                    };
                }
            }
        }
    }

    // Freeze the ownership tables until the outcome arrives; a stuck
    // election clears itself after the startup timeout.
    ctx.vote_in_progress.store(true, Ordering::SeqCst);
    let ctx_clone = ctx.clone();
    let startup = ctx.cluster_config().await.timeout.startup;
    tokio::spawn(async move {
        tokio::time::sleep(startup).await;
        if ctx_clone.vote_in_progress.swap(false, Ordering::SeqCst) {
            warn!("election outcome never arrived; unfreezing ownership tables");
        }
    });

    VoteRes {
        yes: true,
        reason: String::new(),
    }
}

/// Voter-side handling of the winner's announcement.
pub fn handle_vote_result(ctx: &Arc<NodeContext>, msg: &VoteResultMsg) {
    info!(
        "election settled: {} is primary as of map v{}",
        msg.new_primary_id, msg.smap_version
    );
    ctx.vote_in_progress.store(false, Ordering::SeqCst);
}
