// src/core/cluster/bootstrap.rs

//! Startup: role determination, secondary join, and the primary's
//! registration window.
//!
//! Role precedence is environment over persisted map over file config. A
//! primary candidate may change its mind twice — after the mid-window
//! broadcast and after post-merge discovery — but never once distribution
//! has begun.

use crate::config::NodeConfig;
use crate::core::cluster::discovery::{self, MAX_VER_CONFIRMATIONS};
use crate::core::cluster::regpool;
use crate::core::meta::{
    Bmd, CluMeta, ClusterConfig, JoinReq, NodeKind, REBALANCE_MARKER, RESTARTED_MARKER,
    SMAP_VERSION_TAKEOVER_JUMP, Smap, Snode,
};
use crate::core::metasync::{Action, ActionMsg, RevPair};
use crate::core::state::NodeContext;
use crate::core::{OpalError, metasync, metrics};
use reqwest::Method;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{info, warn};

/// Consecutive quiet sub-intervals after which the registration window
/// closes early.
const QUIESCENT_ITERS: u32 = 3;

#[derive(Debug)]
enum StartupRole {
    /// Primary candidate. `discard_loaded` is set when the environment names
    /// this node primary, overriding whatever was persisted.
    Primary { discard_loaded: bool },
    Secondary { candidates: Vec<String> },
}

/// The main entry point: drives this node into a consistent cluster, or
/// fails hard so the process exits non-zero.
pub async fn run(ctx: Arc<NodeContext>) -> Result<(), OpalError> {
    ctx.rmd_starting.store(true, Ordering::SeqCst);

    // A leftover restart marker means the previous incarnation did not exit
    // cleanly; a rebalance marker means one was cut short.
    let interrupted = ctx.marker_exists(REBALANCE_MARKER);
    if ctx.marker_exists(RESTARTED_MARKER) {
        info!("previous incarnation did not exit cleanly");
    }
    ctx.put_marker(RESTARTED_MARKER)?;

    let loaded = ctx.smap.get().await;
    let reliable = !loaded.is_empty() && loaded.validate().is_ok();
    if !loaded.is_empty() && !reliable {
        warn!("persisted cluster map failed validation, treating as unreliable");
    }
    ctx.loaded_smap_reliable.store(reliable, Ordering::SeqCst);

    let role = determine_role(&ctx, reliable.then(|| (*loaded).clone())).await;
    info!("startup role: {role:?}");

    match role {
        StartupRole::Primary { discard_loaded } => {
            let loaded = (!discard_loaded && reliable).then(|| (*loaded).clone());
            if let Some(demote_to) = primary_startup(&ctx, loaded, interrupted).await? {
                info!("changed mind: joining {demote_to} as a secondary");
                secondary_startup(&ctx, vec![demote_to], interrupted).await?;
            }
        }
        StartupRole::Secondary { candidates } => {
            secondary_startup(&ctx, candidates, interrupted).await?;
        }
    }

    ctx.in_startup.store(false, Ordering::SeqCst);
    ctx.rmd_starting.store(false, Ordering::SeqCst);
    ctx.remove_marker(RESTARTED_MARKER);
    info!("startup complete: {}", ctx.smap.get().await.string_ex());
    Ok(())
}

/// env > persisted map > file config; targets always join as secondaries.
async fn determine_role(ctx: &Arc<NodeContext>, loaded: Option<Smap>) -> StartupRole {
    let config = ctx.config.read().clone();
    let self_id = ctx.self_id();

    if config.node.role == NodeKind::Target {
        return StartupRole::Secondary {
            candidates: join_candidates(&config, loaded.as_ref()),
        };
    }

    if let Some(ep) = &config.primary_ep {
        if config.is_self_url(ep) {
            // The environment names this node primary; the persisted map, if
            // any, is discarded in favor of the hint.
            return StartupRole::Primary {
                discard_loaded: true,
            };
        }
        return StartupRole::Secondary {
            candidates: vec![ep.clone()],
        };
    }

    if let Some(smap) = &loaded {
        if smap.is_primary(&self_id) {
            return StartupRole::Primary {
                discard_loaded: false,
            };
        }
    }

    if config.is_self_url(&config.cluster.proxy.primary_url) {
        return StartupRole::Primary {
            discard_loaded: false,
        };
    }

    StartupRole::Secondary {
        candidates: join_candidates(&config, loaded.as_ref()),
    }
}

fn join_candidates(config: &NodeConfig, loaded: Option<&Smap>) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(smap) = loaded {
        if let Some(primary) = smap.primary() {
            candidates.push(primary.control_url.clone());
        }
    }
    if !config.cluster.proxy.primary_url.is_empty() {
        candidates.push(config.cluster.proxy.primary_url.clone());
    }
    if !config.cluster.proxy.discovery_url.is_empty() {
        candidates.push(config.cluster.proxy.discovery_url.clone());
    }
    if let Some(ep) = &config.endpoint {
        candidates.push(ep.clone());
    }
    candidates.dedup();
    candidates
}

// --- Secondary path ------------------------------------------------------

async fn secondary_startup(
    ctx: &Arc<NodeContext>,
    mut candidates: Vec<String>,
    interrupted: bool,
) -> Result<(), OpalError> {
    if candidates.is_empty() {
        return Err(OpalError::JoinFailed(
            "no primary URL to join: set the environment override or proxy.primary_url".into(),
        ));
    }
    let cc = ctx.cluster_config().await;
    let deadline = Instant::now() + cc.timeout.startup;

    loop {
        for url in &candidates {
            match join_once(ctx, url, interrupted).await {
                Ok(()) => {
                    ctx.in_startup.store(false, Ordering::SeqCst);
                    return Ok(());
                }
                Err(OpalError::NotPrimary { primary_url }) if !primary_url.is_empty() => {
                    info!("{url} is not primary, redirected to {primary_url}");
                    match join_once(ctx, &primary_url, interrupted).await {
                        Ok(()) => {
                            ctx.in_startup.store(false, Ordering::SeqCst);
                            return Ok(());
                        }
                        Err(e) => warn!("join via {primary_url} failed: {e}"),
                    }
                }
                Err(e) if e.is_integrity() => return Err(e),
                Err(e) => warn!("join via {url} failed: {e}"),
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(cc.timeout.cplane_operation).await;
    }

    // One-shot rediscovery: ask everyone the persisted map remembers.
    if ctx.loaded_smap_reliable.load(Ordering::SeqCst) {
        let smap = ctx.smap.get().await;
        let peers = smap.peers_of(&ctx.self_id());
        if !peers.is_empty() {
            info!("join failed; running one-shot discovery over {} peers", peers.len());
            let deadline = Instant::now() + cc.timeout.max_host_busy;
            if let Ok(discovered) = discovery::uncover_meta(ctx, &peers, deadline).await {
                if let Some(dsmap) = discovered.meta.smap {
                    if let Some(primary) = dsmap.primary() {
                        let url = primary.control_url.clone();
                        if !candidates.contains(&url) {
                            candidates.push(url.clone());
                        }
                        info!("discovered primary {} at {url}", primary.id);
                        if join_once(ctx, &url, interrupted).await.is_ok() {
                            ctx.in_startup.store(false, Ordering::SeqCst);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    Err(OpalError::JoinFailed(format!(
        "could not join the cluster via any of {candidates:?}"
    )))
}

async fn join_once(ctx: &Arc<NodeContext>, url: &str, interrupted: bool) -> Result<(), OpalError> {
    let req = JoinReq {
        node: ctx.self_snode(),
        meta: ctx.clu_meta().await,
        rebalance_interrupted: interrupted,
    };
    let endpoint = format!("{}/v1/cluster/join", url.trim_end_matches('/'));
    let cplane = ctx.cluster_config().await.timeout.cplane_operation;
    let resp = ctx
        .request(Method::POST, &endpoint)
        .await
        .timeout(cplane * 3)
        .json(&req)
        .send()
        .await?;

    let status = resp.status();
    if status.as_u16() == 421 {
        let primary_url = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        return Err(OpalError::NotPrimary { primary_url });
    }
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(OpalError::JoinFailed(format!("{url} answered {status}: {text}")));
    }

    let meta: CluMeta = resp.json().await?;
    apply_join_response(ctx, meta).await
}

/// Adopts the cluMeta the primary answered with.
async fn apply_join_response(ctx: &Arc<NodeContext>, meta: CluMeta) -> Result<(), OpalError> {
    if let Some(config) = meta.config {
        swallow_downgrade(ctx.cluconf.put(config).await)?;
    }
    if let Some(smap) = meta.smap {
        info!("joined: adopting {}", smap.string_ex());
        if swallow_downgrade(ctx.smap.put(smap).await)? {
            let adopted = ctx.smap.get().await;
            ctx.react_smap_change(&adopted);
        }
    }
    if let Some(bmd) = meta.bmd {
        swallow_downgrade(ctx.bmd.put(bmd).await)?;
    }
    if let Some(rmd) = meta.rmd {
        swallow_downgrade(ctx.rmd.put(rmd).await)?;
    }
    Ok(())
}

fn swallow_downgrade(res: Result<bool, OpalError>) -> Result<bool, OpalError> {
    match res {
        Err(e) if e.is_downgrade() => Ok(false),
        other => other,
    }
}

// --- Primary path --------------------------------------------------------

/// Runs the primary startup sequence. Returns `Some(primary_url)` when the
/// candidate changed its mind and must join that URL as a secondary instead.
async fn primary_startup(
    ctx: &Arc<NodeContext>,
    loaded: Option<Smap>,
    interrupted_marker: bool,
) -> Result<Option<String>, OpalError> {
    let cc = ctx.cluster_config().await;
    let self_snode = ctx.self_snode();
    let ntargets = ctx.config.read().node.ntargets;

    // Step 1: self-only map, carrying forward the loaded UUID and version.
    let mut bootstrap_smap = Smap::with_primary(self_snode.clone());
    if let Some(prev) = &loaded {
        bootstrap_smap.uuid = prev.uuid.clone();
        bootstrap_smap.version = prev.version;
        bootstrap_smap.creation_time = prev.creation_time.clone();
    }
    ctx.smap.force_put(bootstrap_smap).await?;

    // Step 2/3: registration window. Joins accumulate in the regpool; if a
    // persisted map exists, a mid-window broadcast may reveal that a
    // higher-version cluster already runs elsewhere (change of mind #1).
    let window_deadline = Instant::now() + cc.timeout.startup;
    let sub_interval = cc.timeout.max_keepalive;
    let mut quiescent: u32 = 0;
    let mut prev_targets = 0usize;
    let mut broadcast_done = loaded.is_none();

    while Instant::now() < window_deadline {
        tokio::time::sleep(sub_interval).await;

        let targets_now = ctx.regpool.count_targets();
        if targets_now == prev_targets {
            quiescent += 1;
        } else {
            quiescent = 0;
            prev_targets = targets_now;
        }
        let enough_targets = ntargets == 0 || targets_now >= ntargets;
        if quiescent >= QUIESCENT_ITERS
            && enough_targets
            && (!ctx.regpool.is_empty() || loaded.is_some())
        {
            info!("registration window quiescent with {targets_now} target(s), closing early");
            break;
        }

        if !broadcast_done {
            broadcast_done = true;
            let peers = loaded.as_ref().map(|s| s.peers_of(&self_snode.id)).unwrap_or_default();
            if !peers.is_empty() {
                if let Some(url) = detect_running_primary(ctx, &peers, &self_snode).await? {
                    return Ok(Some(url));
                }
            }
        }
    }

    // Step 4: merge the regpool, newest version of each revision winning.
    let pool = ctx.regpool.snapshot();
    info!("registration window closed with {} join(s)", pool.len());
    let base = CluMeta {
        smap: Some((*ctx.smap.get().await).clone()),
        bmd: {
            let bmd = ctx.bmd.get().await;
            (!bmd.is_empty()).then(|| (*bmd).clone())
        },
        rmd: {
            let rmd = ctx.rmd.get().await;
            (!rmd.is_empty()).then(|| (*rmd).clone())
        },
        config: {
            let conf = ctx.cluconf.get().await;
            (!conf.is_empty()).then(|| (*conf).clone())
        },
        vote_in_progress: false,
    };
    let pre_merge_smap = base.smap.clone().unwrap();
    let mut merged = regpool::merge(&pool, base)?;
    if merged.vote_in_progress {
        // Do not interfere with an ongoing election: keep the pre-merge map.
        warn!("a joiner reported an election in flight; keeping the pre-merge cluster map");
        merged.meta.smap = Some(pre_merge_smap);
    }
    let interrupted = interrupted_marker || merged.rebalance_interrupted || {
        merged.meta.rmd.as_ref().map(|r| r.interrupted).unwrap_or(false)
    };

    // Boundary: a cluster cannot be created out of thin air without targets.
    if ntargets == 0 && pool.is_empty() && loaded.is_none() {
        return Err(OpalError::InvalidState(
            "cannot create a new cluster with no targets".into(),
        ));
    }

    // Build the would-be final map: merged max-version membership plus every
    // joiner, this node primary.
    let mut smap = merged.meta.smap.take().unwrap();
    let had_cluster = smap.version > 0;
    smap.primary_id = self_snode.id.clone();
    smap.put_node(self_snode.clone())?;
    for req in &pool {
        smap.put_node(req.node.clone())?;
    }

    // Step 5: adopt or mint the cluster UUID.
    if smap.uuid.is_empty() {
        smap.uuid = uuid::Uuid::new_v4().to_string();
        smap.creation_time = chrono::Utc::now().to_rfc3339();
        info!("minted cluster UUID {}", smap.uuid);
    }

    // Step 6: discovery, to catch peers the window missed.
    let peers = smap.peers_of(&self_snode.id);
    if !peers.is_empty() {
        let deadline = Instant::now() + cc.timeout.max_host_busy;
        let discovered = discovery::uncover_meta(ctx, &peers, deadline).await?;
        if let Some(dsmap) = &discovered.meta.smap {
            smap.check_uuid(dsmap)?;
            // Step 7 / change of mind #2.
            if dsmap.version > smap.version
                && !dsmap.is_primary(&self_snode.id)
                && discovered.smap_confirmations >= MAX_VER_CONFIRMATIONS
            {
                if let Some(primary) = dsmap.primary() {
                    if let Some(url) = resolve_takeover_conflict(primary, &self_snode)? {
                        return Ok(Some(url));
                    }
                    // The "primary" is this very node under a stale ID; the
                    // final map rewrites the entry in place.
                    if primary.id != self_snode.id {
                        let stale_id = primary.id.clone();
                        smap.remove_node(&stale_id);
                    }
                }
            }
            if dsmap.version > smap.version {
                smap.version = dsmap.version;
            }
        }
        if let Some(bmd) = discovered.meta.bmd {
            merge_discovered(&mut merged.meta.bmd, bmd);
        }
        if let Some(rmd) = discovered.meta.rmd {
            merge_discovered(&mut merged.meta.rmd, rmd);
        }
        if let Some(conf) = discovered.meta.config {
            merge_discovered(&mut merged.meta.config, conf);
        }
    }

    // Step 8: staff the IC, order the new reign above the old one, persist.
    smap.staff_ic(cc.ic.count);
    smap.version += if had_cluster {
        SMAP_VERSION_TAKEOVER_JUMP
    } else {
        1
    };
    ctx.smap.force_put(smap).await?;
    let smap = ctx.smap.get().await;
    ctx.react_smap_change(&smap);
    metrics::IS_PRIMARY.set(1.0);

    // Step 9: the bucket map exists from version 1 on.
    let bmd = match merged.meta.bmd {
        Some(mut bmd) => {
            if bmd.uuid.is_empty() {
                bmd.uuid = smap.uuid.clone();
            }
            bmd
        }
        None => Bmd::initial(&smap.uuid),
    };
    ctx.bmd.force_put(bmd).await?;

    // Cluster config: adopt the merged revision or mint v1 from the seed.
    let config_rev = match merged.meta.config {
        Some(mut conf) => {
            if conf.uuid.is_empty() {
                conf.uuid = smap.uuid.clone();
            }
            conf
        }
        None => {
            let mut seed: ClusterConfig = ctx.config.read().cluster.clone();
            seed.uuid = smap.uuid.clone();
            seed.version = 1;
            seed
        }
    };
    ctx.cluconf.force_put(config_rev).await?;

    if let Some(mut rmd) = merged.meta.rmd {
        if rmd.uuid.is_empty() {
            rmd.uuid = smap.uuid.clone();
        }
        rmd.interrupted = interrupted;
        ctx.rmd.force_put(rmd).await?;
    }

    // Steps 10-12: distribute, then open for business. `rmd_starting` stays
    // up so the incoming target joins do not trigger a premature rebalance.
    let bmd = ctx.bmd.get().await;
    let conf = ctx.cluconf.get().await;
    let pairs = vec![
        RevPair::from_config(&conf, ActionMsg::new(Action::PrimaryStarted))?,
        RevPair::from_smap(&smap, ActionMsg::new(Action::PrimaryStarted))?,
        RevPair::from_bmd(&bmd, ActionMsg::new(Action::PrimaryStarted))?,
    ];
    let handle = metasync::sync(ctx, pairs).await;
    let failures = handle.wait().await;
    if !failures.is_empty() {
        warn!("initial metasync: {} node(s) unreachable", failures.len());
    }
    ctx.regpool.clear();
    ctx.in_startup.store(false, Ordering::SeqCst);

    // Step 13: resume an interrupted rebalance once the membership settles.
    if cc.rebalance.enabled && interrupted {
        spawn_rebalance_resume(ctx.clone());
    }
    Ok(None)
}

fn merge_discovered<T: crate::core::meta::Rev>(slot: &mut Option<T>, incoming: T) {
    match slot {
        Some(cur) if cur.version() >= incoming.version() => {}
        _ => *slot = Some(incoming),
    }
}

/// Mid-window broadcast: is a higher-version cluster already running?
async fn detect_running_primary(
    ctx: &Arc<NodeContext>,
    peers: &[Snode],
    self_snode: &Snode,
) -> Result<Option<String>, OpalError> {
    let cc = ctx.cluster_config().await;
    let deadline = Instant::now() + cc.timeout.cplane_operation * 3;
    let discovered = match discovery::uncover_meta(ctx, peers, deadline).await {
        Ok(d) => d,
        Err(e) if e.is_integrity() => return Err(e),
        Err(_) => return Ok(None), // best-effort only
    };
    let local_version = ctx.smap.get().await.version;
    if let Some(dsmap) = &discovered.meta.smap {
        if dsmap.version > local_version
            && !dsmap.is_primary(&self_snode.id)
            && discovered.smap_confirmations >= MAX_VER_CONFIRMATIONS
        {
            if let Some(primary) = dsmap.primary() {
                return resolve_takeover_conflict(primary, self_snode);
            }
        }
    }
    Ok(None)
}

/// Resolves where to demote to. The discovered primary may be this very
/// node under a previous identity (same endpoints, different ID after a
/// data-dir loss): when the ID is the *only* difference, the entry is
/// rewritten in place and this node stays primary (`Ok(None)`); any partial
/// endpoint collision is an integrity violation.
fn resolve_takeover_conflict(
    primary: &Snode,
    self_snode: &Snode,
) -> Result<Option<String>, OpalError> {
    if primary.id == self_snode.id {
        // Someone else distributes a map naming us primary — nothing to
        // demote to.
        return Ok(None);
    }
    if primary.url_conflict(self_snode) {
        let only_id_differs = primary.control_url == self_snode.control_url
            && primary.public_url == self_snode.public_url
            && primary.data_url == self_snode.data_url
            && primary.kind == self_snode.kind;
        if !only_id_differs {
            return Err(OpalError::ClusterIntegrity(format!(
                "discovered primary {} partially collides with this node's endpoints",
                primary.id
            )));
        }
        return Ok(None);
    }
    Ok(Some(primary.control_url.clone()))
}

/// Primary-side join handling, both during the registration window (the
/// request parks in the regpool) and in steady state (the map grows and is
/// redistributed immediately).
pub async fn handle_join(ctx: &Arc<NodeContext>, req: JoinReq) -> Result<CluMeta, OpalError> {
    metrics::JOINS_TOTAL.inc();
    if ctx.in_startup.load(Ordering::SeqCst) {
        info!("join of {} parked in the regpool", req.node);
        ctx.regpool.add(req);
        return Ok(ctx.clu_meta().await);
    }

    let node = req.node.clone();
    let is_target = node.is_target();
    let ic_count = ctx.cluster_config().await.ic.count;
    let changed = ctx
        .smap
        .modify(
            |smap| {
                let changed = smap.put_node(node.clone())?;
                if !changed {
                    return Ok(None);
                }
                smap.staff_ic(ic_count);
                smap.version += 1;
                Ok(Some(()))
            },
            |installed, _| info!("{} joined; now {}", node, installed.string_ex()),
        )
        .await?
        .is_some();

    if changed {
        let smap = ctx.smap.get().await;
        ctx.react_smap_change(&smap);
        let pair = RevPair::from_smap(
            &smap,
            ActionMsg::new(Action::JoinCluster {
                node_id: req.node.id.clone(),
            }),
        )?;
        if is_target {
            if req.rebalance_interrupted {
                ctx.rmd
                    .modify(
                        |rmd| {
                            rmd.interrupted = true;
                            Ok(Some(()))
                        },
                        |_, _: &()| {},
                    )
                    .await?;
            }
            crate::core::cluster::maintenance::trigger_rebalance(ctx, vec![pair]).await?;
        } else {
            metasync::sync(ctx, vec![pair]).await;
        }
    }
    Ok(ctx.clu_meta().await)
}

/// Waits for a quiet period (no cluster-map change for `max_keepalive`),
/// then resumes the interrupted rebalance.
fn spawn_rebalance_resume(ctx: Arc<NodeContext>) {
    tokio::spawn(async move {
        let cc = ctx.cluster_config().await;
        let quiet = cc.timeout.max_keepalive.max(cc.timeout.max_host_busy);
        loop {
            tokio::time::sleep(quiet).await;
            if ctx.is_stopping() {
                return;
            }
            if ctx.last_smap_change.lock().elapsed() >= quiet {
                break;
            }
        }
        ctx.rmd_starting.store(false, Ordering::SeqCst);
        info!("resuming interrupted rebalance");
        if let Err(e) =
            crate::core::cluster::maintenance::trigger_rebalance(&ctx, Vec::new()).await
        {
            warn!("failed to resume rebalance: {e}");
        }
    });
}
