// src/core/metasync/mod.rs

//! Metasync: at-least-once replication of revision bundles from the primary
//! to every member.
//!
//! A caller may bundle several revisions into a single payload so receivers
//! observe them together; within a bundle the apply order is fixed
//! (Config → Smap → BMD → RMD). Every `sync` returns a joinable handle that
//! resolves once each destination has acknowledged or been declared
//! unreachable.

use crate::core::meta::{Bmd, CluMeta, ClusterConfig, Rev, RevKind, Rmd, Smap};
use crate::core::state::NodeContext;
use crate::core::{OpalError, cluster::rebalance, metrics};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Attempts per destination before declaring it unreachable.
const SYNC_RETRIES: u32 = 3;

/// The tagged action accompanying a revision, so receivers know why the
/// revision changed without inspecting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Action {
    PrimaryStarted,
    NewPrimary { node_id: String },
    JoinCluster { node_id: String },
    RemoveNode { node_ids: Vec<String> },
    StartMaintenance { node_id: String },
    StopMaintenance { node_id: String },
    DecommissionNode { node_id: String },
    ShutdownNode { node_id: String },
    RebalanceTriggered { rebalance_id: String },
    BucketCreated { name: String },
    BucketDestroyed { name: String },
    ConfigUpdated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionMsg {
    #[serde(flatten)]
    pub action: Action,
    /// Present when the apply must run inside a three-phase transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_uuid: Option<String>,
}

impl ActionMsg {
    pub fn new(action: Action) -> Self {
        ActionMsg {
            action,
            txn_uuid: None,
        }
    }

    pub fn with_txn(action: Action, txn_uuid: &str) -> Self {
        ActionMsg {
            action,
            txn_uuid: Some(txn_uuid.to_string()),
        }
    }
}

/// One revision staged for distribution.
#[derive(Debug, Clone)]
pub struct RevPair {
    pub kind: RevKind,
    pub body: serde_json::Value,
    pub msg: ActionMsg,
}

impl RevPair {
    fn new<T: Rev>(rev: &T, msg: ActionMsg) -> Result<Self, OpalError> {
        Ok(RevPair {
            kind: T::KIND,
            body: serde_json::to_value(rev)?,
            msg,
        })
    }

    pub fn from_smap(smap: &Smap, msg: ActionMsg) -> Result<Self, OpalError> {
        Self::new(smap, msg)
    }

    pub fn from_bmd(bmd: &Bmd, msg: ActionMsg) -> Result<Self, OpalError> {
        Self::new(bmd, msg)
    }

    pub fn from_rmd(rmd: &Rmd, msg: ActionMsg) -> Result<Self, OpalError> {
        Self::new(rmd, msg)
    }

    pub fn from_config(config: &ClusterConfig, msg: ActionMsg) -> Result<Self, OpalError> {
        Self::new(config, msg)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevEnvelope {
    pub body: serde_json::Value,
    pub msg: ActionMsg,
}

/// The wire payload: revisions keyed by kind. `BTreeMap` iteration yields
/// the documented apply order.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SyncBundle {
    pub revs: BTreeMap<RevKind, RevEnvelope>,
}

/// Per-destination outcome of a sync round.
#[derive(Debug)]
pub struct SyncFailure {
    pub node_id: String,
    pub err: OpalError,
}

/// Joinable handle returned by `sync`; dispatch has already begun when the
/// caller holds one.
pub struct SyncHandle {
    rx: oneshot::Receiver<Vec<SyncFailure>>,
}

impl SyncHandle {
    /// Blocks until every destination acknowledged or was declared
    /// unreachable; returns the failures.
    pub async fn wait(self) -> Vec<SyncFailure> {
        self.rx.await.unwrap_or_default()
    }

    fn resolved(failures: Vec<SyncFailure>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(failures);
        SyncHandle { rx }
    }
}

/// Fans a bundle out to every member except self. Primary-only.
pub async fn sync(ctx: &Arc<NodeContext>, pairs: Vec<RevPair>) -> SyncHandle {
    let mut bundle = SyncBundle::default();
    for pair in pairs {
        bundle.revs.insert(
            pair.kind,
            RevEnvelope {
                body: pair.body,
                msg: pair.msg,
            },
        );
    }
    let payload = match serde_json::to_vec(&bundle) {
        Ok(p) => p,
        Err(e) => {
            error!("failed to serialize metasync bundle: {e}");
            return SyncHandle::resolved(vec![]);
        }
    };

    let smap = ctx.smap.get().await;
    let destinations = smap.peers_of(&ctx.self_id());
    metrics::METASYNC_SENT_TOTAL.inc();
    debug!(
        "metasync: dispatching {} revision(s) to {} node(s)",
        bundle.revs.len(),
        destinations.len()
    );

    let cplane = ctx.cluster_config().await.timeout.cplane_operation;
    let mut set: JoinSet<Option<SyncFailure>> = JoinSet::new();
    for dst in destinations {
        let ctx = ctx.clone();
        let payload = payload.clone();
        set.spawn(async move {
            let url = format!("{}/v1/metasync", dst.control_url);
            let mut last_err = OpalError::Internal("unreachable".into());
            for attempt in 1..=SYNC_RETRIES {
                let res = ctx
                    .request(Method::PUT, &url)
                    .await
                    .timeout(cplane)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(payload.clone())
                    .send()
                    .await;
                match res {
                    Ok(resp) if resp.status().is_success() => {
                        ctx.hb.heard_from(&dst.id);
                        return None;
                    }
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        let text = resp.text().await.unwrap_or_default();
                        // The receiver already holds these revisions.
                        if status == 400 && text.contains("downgrade") {
                            return None;
                        }
                        last_err = OpalError::Transient {
                            url: url.clone(),
                            reason: format!("HTTP {status}: {text}"),
                        };
                    }
                    Err(e) => last_err = e.into(),
                }
                tokio::time::sleep(cplane / 2 * attempt).await;
            }
            // Sustained unreachability: let keepalive-driven removal pick
            // the node up.
            ctx.hb.mark_failure(&dst.id);
            warn!("metasync to {} failed after {SYNC_RETRIES} attempts", dst.id);
            Some(SyncFailure {
                node_id: dst.id.clone(),
                err: last_err,
            })
        });
    }

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut failures = Vec::new();
        while let Some(res) = set.join_next().await {
            if let Ok(Some(failure)) = res {
                failures.push(failure);
            }
        }
        let _ = tx.send(failures);
    });
    SyncHandle { rx }
}

/// Per-kind apply outcome reported back to the primary, including a
/// cluster-info snapshot so version mismatches are easy to diagnose.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MsyncResponse {
    pub errs: BTreeMap<RevKind, String>,
    pub cluster_info: CluMeta,
}

/// Applies a received bundle on a non-primary node.
///
/// Revisions are applied in bundle order; per-kind failures are collected
/// rather than aborting the bundle, except for cluster-integrity errors,
/// which are returned immediately so the server can terminate the process.
pub async fn apply_bundle(
    ctx: &Arc<NodeContext>,
    bundle: SyncBundle,
) -> Result<MsyncResponse, OpalError> {
    if ctx.is_stopping() {
        return Err(OpalError::Unavailable("node is shutting down".into()));
    }
    if ctx.vote_in_progress.load(Ordering::SeqCst) {
        return Err(OpalError::VoteInProgress);
    }
    // The primary is the source of truth; an echo of its own metadata (or a
    // stale peer still claiming primacy) is refused.
    if ctx.is_primary().await {
        let self_id = ctx.self_id();
        let demotes_self = bundle
            .revs
            .get(&RevKind::Smap)
            .and_then(|env| serde_json::from_value::<Smap>(env.body.clone()).ok())
            .map(|incoming| incoming.primary_id != self_id)
            .unwrap_or(false);
        if !demotes_self {
            return Err(OpalError::InvalidState(
                "the primary does not accept metasync".into(),
            ));
        }
    }

    metrics::METASYNC_RECEIVED_TOTAL.inc();
    let mut resp = MsyncResponse::default();
    for (kind, env) in bundle.revs {
        let txn = env.msg.txn_uuid.clone();
        if let Some(uuid) = &txn {
            commit_before(ctx, uuid, &env.msg);
        }
        let result = apply_one(ctx, kind, env.body, &env.msg).await;
        if let Some(uuid) = &txn {
            commit_after(ctx, uuid, &env.msg, result.as_ref().err());
        }
        match result {
            Ok(()) => {}
            Err(e) if e.is_integrity() => return Err(e),
            Err(e) if e.is_downgrade() => {
                debug!("metasync {kind}: {e}");
                resp.errs.insert(kind, e.to_string());
            }
            Err(e) => {
                warn!("metasync {kind} apply failed: {e}");
                resp.errs.insert(kind, e.to_string());
            }
        }
    }
    resp.cluster_info = ctx.clu_meta().await;
    Ok(resp)
}

async fn apply_one(
    ctx: &Arc<NodeContext>,
    kind: RevKind,
    body: serde_json::Value,
    msg: &ActionMsg,
) -> Result<(), OpalError> {
    match kind {
        RevKind::Config => {
            let config: ClusterConfig = serde_json::from_value(body)?;
            if ctx.cluconf.put(config).await? {
                debug!("adopted cluster config via metasync ({:?})", msg.action);
            }
        }
        RevKind::Smap => {
            let smap: Smap = serde_json::from_value(body)?;
            info!("metasync: incoming {} ({:?})", smap.string_ex(), msg.action);
            if ctx.smap.put(smap).await? {
                let adopted = ctx.smap.get().await;
                ctx.react_smap_change(&adopted);
            }
        }
        RevKind::Bmd => {
            let bmd: Bmd = serde_json::from_value(body)?;
            ctx.bmd.put(bmd).await?;
        }
        RevKind::Rmd => {
            let rmd: Rmd = serde_json::from_value(body)?;
            if ctx.rmd.put(rmd).await? {
                let adopted = ctx.rmd.get().await;
                rebalance::on_rmd_adopted(ctx, &adopted).await;
            }
        }
    }
    Ok(())
}

// --- Three-phase transaction hooks -------------------------------------
//
// When a bundle carries a transaction UUID the apply is bracketed: the
// receiver records the transaction before applying and settles it after,
// reporting the apply error (if any) into the log stream. External
// collaborators (the data path) key their own prepare/commit off the same
// UUID.

fn commit_before(ctx: &Arc<NodeContext>, txn_uuid: &str, msg: &ActionMsg) {
    debug!("txn {txn_uuid}: commit-before ({:?})", msg.action);
    ctx.pending_txns.lock().insert(txn_uuid.to_string());
}

fn commit_after(ctx: &Arc<NodeContext>, txn_uuid: &str, msg: &ActionMsg, err: Option<&OpalError>) {
    ctx.pending_txns.lock().remove(txn_uuid);
    match err {
        None => debug!("txn {txn_uuid}: commit-after ok ({:?})", msg.action),
        Some(e) => warn!("txn {txn_uuid}: commit-after with error: {e}"),
    }
}
