// src/core/cluster/discovery.rs

//! Max-version discovery ("uncover"): a primary candidate broadcasts a
//! metadata query to all known peers and adopts the highest versions it can
//! trust before finalizing its own map.
//!
//! Targets are queried first and their answers arbitrate cluster-map UUID
//! conflicts; a conflict that survives target majority is a split brain and
//! fatal. Any response carrying a vote-in-progress flag invalidates the
//! round — discovery retries until the flag clears or the deadline passes.

use crate::core::OpalError;
use crate::core::meta::{CluMeta, NodeKind, Rev, Snode};
use crate::core::state::NodeContext;
use reqwest::Method;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Independent confirmations required before a candidate demotes itself
/// based on a peer-reported higher cluster map.
pub const MAX_VER_CONFIRMATIONS: usize = 3;

/// The outcome of one discovery round.
#[derive(Debug, Default)]
pub struct Discovered {
    /// Max-version revisions, per kind, over all trusted responses.
    pub meta: CluMeta,
    /// Responders agreeing with the winning cluster-map UUID.
    pub smap_confirmations: usize,
    /// Some peer is mid-election; nothing may be adopted this round.
    pub vote_in_progress: bool,
}

/// Broadcasts the metadata query and aggregates, retrying while a vote is in
/// flight somewhere.
pub async fn uncover_meta(
    ctx: &Arc<NodeContext>,
    peers: &[Snode],
    deadline: Instant,
) -> Result<Discovered, OpalError> {
    let cplane = ctx.cluster_config().await.timeout.cplane_operation;
    loop {
        let responses = broadcast_query(ctx, peers).await;
        debug!("discovery: {} of {} peers answered", responses.len(), peers.len());
        let agg = aggregate(&responses)?;
        if !agg.vote_in_progress {
            return Ok(agg);
        }
        if Instant::now() >= deadline {
            return Err(OpalError::Timeout(
                "discovery: vote in progress until deadline".into(),
            ));
        }
        info!("discovery: vote in progress somewhere, retrying");
        tokio::time::sleep(cplane).await;
    }
}

/// One round of `what=smapvote` against every peer, targets first.
async fn broadcast_query(ctx: &Arc<NodeContext>, peers: &[Snode]) -> Vec<(NodeKind, CluMeta)> {
    let cplane = ctx.cluster_config().await.timeout.cplane_operation;
    let queries = peers.iter().map(|peer| {
        let ctx = ctx.clone();
        let url = format!("{}/v1/daemon?what=smapvote", peer.control_url);
        let kind = peer.kind;
        async move {
            let res = ctx
                .request(Method::GET, &url)
                .await
                .timeout(cplane)
                .send()
                .await;
            match res {
                Ok(resp) if resp.status().is_success() => {
                    resp.json::<CluMeta>().await.ok().map(|m| (kind, m))
                }
                _ => None,
            }
        }
    });
    futures::future::join_all(queries)
        .await
        .into_iter()
        .flatten()
        .collect()
}

/// Pure aggregation over a set of responses; see the module docs for the
/// fast/slow-path rules.
pub fn aggregate(responses: &[(NodeKind, CluMeta)]) -> Result<Discovered, OpalError> {
    let mut out = Discovered::default();
    if responses.iter().any(|(_, m)| m.vote_in_progress) {
        out.vote_in_progress = true;
        return Ok(out);
    }

    // --- cluster map: fast path (single UUID) or target-majority slow path
    let smaps: Vec<(&NodeKind, &crate::core::meta::Smap)> = responses
        .iter()
        .filter_map(|(k, m)| m.smap.as_ref().map(|s| (k, s)))
        .collect();
    let mut uuids: Vec<&str> = smaps
        .iter()
        .filter(|(_, s)| !s.uuid.is_empty())
        .map(|(_, s)| s.uuid.as_str())
        .collect();
    uuids.sort_unstable();
    uuids.dedup();

    let winning_uuid: Option<String> = match uuids.len() {
        0 | 1 => uuids.first().map(|u| u.to_string()),
        _ => {
            warn!("discovery: cluster-map UUID conflict, arbitrating by target majority");
            let mut tally: HashMap<&str, usize> = HashMap::new();
            let mut target_total = 0usize;
            for (kind, smap) in &smaps {
                if **kind == NodeKind::Target && !smap.uuid.is_empty() {
                    *tally.entry(smap.uuid.as_str()).or_default() += 1;
                    target_total += 1;
                }
            }
            let majority = tally
                .iter()
                .find(|(_, count)| **count * 2 > target_total)
                .map(|(uuid, _)| uuid.to_string());
            match majority {
                Some(u) => Some(u),
                None => {
                    return Err(OpalError::ClusterIntegrity(format!(
                        "discovery: irreconcilable cluster-map UUID split: {uuids:?}"
                    )));
                }
            }
        }
    };

    for (_, smap) in &smaps {
        match &winning_uuid {
            Some(w) => {
                if !smap.uuid.is_empty() && smap.uuid != *w {
                    continue;
                }
                if smap.uuid == *w {
                    out.smap_confirmations += 1;
                }
            }
            None => {
                if smap.version > 0 {
                    out.smap_confirmations += 1;
                }
            }
        }
        match &out.meta.smap {
            Some(cur) if cur.version >= smap.version => {}
            _ => out.meta.smap = Some((*smap).clone()),
        }
    }

    // --- the remaining revisions: max version within the winning UUID
    let winning = winning_uuid.as_deref();
    pick_max(
        &mut out.meta.bmd,
        responses.iter().filter_map(|(_, m)| m.bmd.as_ref()),
        winning,
    )?;
    pick_max(
        &mut out.meta.rmd,
        responses.iter().filter_map(|(_, m)| m.rmd.as_ref()),
        winning,
    )?;
    pick_max(
        &mut out.meta.config,
        responses.iter().filter_map(|(_, m)| m.config.as_ref()),
        winning,
    )?;
    Ok(out)
}

fn pick_max<'a, T: Rev>(
    slot: &mut Option<T>,
    revs: impl Iterator<Item = &'a T>,
    winning_uuid: Option<&str>,
) -> Result<(), OpalError> {
    for rev in revs {
        if !rev.uuid().is_empty() {
            match winning_uuid {
                // A revision from a different cluster than the arbitrated one.
                Some(w) if rev.uuid() != w => continue,
                Some(_) => {}
                None => {}
            }
            if let Some(cur) = slot {
                if !cur.uuid().is_empty() && cur.uuid() != rev.uuid() {
                    return Err(OpalError::ClusterIntegrity(format!(
                        "discovery: {} UUID split: {} vs {}",
                        T::KIND,
                        cur.uuid(),
                        rev.uuid()
                    )));
                }
            }
        }
        match slot {
            Some(cur) if cur.version() >= rev.version() => {}
            _ => *slot = Some(rev.clone()),
        }
    }
    Ok(())
}
