// src/core/cluster/maintenance.rs

//! The node maintenance / decommission / shutdown lifecycle, plus the
//! two-phase forced primary change.
//!
//! All membership mutations run on the primary; affected nodes are told
//! afterwards and react locally (drain, wipe, exit).

use crate::core::meta::{NodeKind, SMAP_VERSION_TAKEOVER_JUMP, SnodeFlags};
use crate::core::metasync::{Action, ActionMsg, RevPair};
use crate::core::notifs::{NotifKind, NotifListener, now_ms};
use crate::core::state::NodeContext;
use crate::core::{OpalError, ic, metasync};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecommissionOpts {
    /// Leave the process running after cleanup.
    #[serde(default)]
    pub no_shutdown: bool,
    /// Also wipe user data (delegated to the data path).
    #[serde(default)]
    pub rm_user_data: bool,
}

/// Flags a node for maintenance and, unless told otherwise, triggers a
/// rebalance that drains it. Returns the rebalance ID when one started.
pub async fn start_maintenance(
    ctx: &Arc<NodeContext>,
    node_id: &str,
    skip_rebalance: bool,
) -> Result<Option<String>, OpalError> {
    set_node_flags(ctx, node_id, SnodeFlags::MAINTENANCE, true).await?;
    let smap = ctx.smap.get().await;
    let pair = RevPair::from_smap(
        &smap,
        ActionMsg::new(Action::StartMaintenance {
            node_id: node_id.to_string(),
        }),
    )?;
    let is_target = smap.get_node(node_id).map(|n| n.is_target()).unwrap_or(false);

    if is_target && !skip_rebalance {
        let rebalance_id = trigger_rebalance(ctx, vec![pair]).await?;
        return Ok(rebalance_id);
    }
    metasync::sync(ctx, vec![pair]).await;
    Ok(None)
}

/// Clears the maintenance flag; data must flow back, so another rebalance
/// follows.
pub async fn stop_maintenance(
    ctx: &Arc<NodeContext>,
    node_id: &str,
) -> Result<Option<String>, OpalError> {
    set_node_flags(ctx, node_id, SnodeFlags::MAINTENANCE, false).await?;
    let smap = ctx.smap.get().await;
    let pair = RevPair::from_smap(
        &smap,
        ActionMsg::new(Action::StopMaintenance {
            node_id: node_id.to_string(),
        }),
    )?;
    let is_target = smap.get_node(node_id).map(|n| n.is_target()).unwrap_or(false);
    if is_target {
        return trigger_rebalance(ctx, vec![pair]).await;
    }
    metasync::sync(ctx, vec![pair]).await;
    Ok(None)
}

/// Flags a node for decommission, tells it to clean up and exit, and drops
/// it from the map once it acknowledged.
pub async fn decommission_node(
    ctx: &Arc<NodeContext>,
    node_id: &str,
    opts: DecommissionOpts,
) -> Result<(), OpalError> {
    set_node_flags(ctx, node_id, SnodeFlags::DECOMMISSION, true).await?;
    let smap = ctx.smap.get().await;
    let Some(node) = smap.get_node(node_id) else {
        return Err(OpalError::NodeNotFound(node_id.to_string()));
    };
    let pair = RevPair::from_smap(
        &smap,
        ActionMsg::new(Action::DecommissionNode {
            node_id: node_id.to_string(),
        }),
    )?;
    metasync::sync(ctx, vec![pair]).await;

    let url = format!("{}/v1/daemon?action=decommission", node.control_url);
    let acked = match ctx.request(Method::PUT, &url).await.json(&opts).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            warn!("decommission call to {node_id} failed: {e}");
            false
        }
    };
    if acked {
        remove_from_smap(ctx, node_id).await?;
    }
    // Otherwise keepalive-driven removal reaps the silent member.
    Ok(())
}

/// Flags a node stopped-but-restartable and tells it to shut down. The node
/// stays in the map with the flag set.
pub async fn shutdown_node(ctx: &Arc<NodeContext>, node_id: &str) -> Result<(), OpalError> {
    set_node_flags(ctx, node_id, SnodeFlags::SHUTDOWN, true).await?;
    let smap = ctx.smap.get().await;
    let Some(node) = smap.get_node(node_id) else {
        return Err(OpalError::NodeNotFound(node_id.to_string()));
    };
    let pair = RevPair::from_smap(
        &smap,
        ActionMsg::new(Action::ShutdownNode {
            node_id: node_id.to_string(),
        }),
    )?;
    metasync::sync(ctx, vec![pair]).await;

    let url = format!("{}/v1/daemon?action=shutdown", node.control_url);
    if let Err(e) = ctx.request(Method::PUT, &url).await.send().await {
        warn!("shutdown call to {node_id} failed: {e}");
    }
    Ok(())
}

/// Bumps the RMD, registers the IC listener for the new rebalance, and
/// distributes the given revisions together with the new RMD in one bundle.
pub async fn trigger_rebalance(
    ctx: &Arc<NodeContext>,
    mut pairs: Vec<RevPair>,
) -> Result<Option<String>, OpalError> {
    if ctx.rmd_starting.load(Ordering::SeqCst) {
        info!("rebalance withheld: primary startup still in progress");
        metasync::sync(ctx, pairs).await;
        return Ok(None);
    }
    let cc = ctx.cluster_config().await;
    if !cc.rebalance.enabled {
        info!("rebalance disabled by configuration");
        metasync::sync(ctx, pairs).await;
        return Ok(None);
    }
    let smap = ctx.smap.get().await;
    let participants: Vec<String> = smap
        .targets
        .values()
        .filter(|t| !t.in_maint_or_decomm())
        .map(|t| t.id.clone())
        .collect();
    if participants.is_empty() {
        metasync::sync(ctx, pairs).await;
        return Ok(None);
    }

    let uuid = smap.uuid.clone();
    let rebalance_id = ctx
        .rmd
        .modify(
            |rmd| {
                if rmd.uuid.is_empty() {
                    rmd.uuid = uuid.clone();
                }
                Ok(Some(rmd.bump(participants.clone())))
            },
            |_, id: &String| info!("rebalance {id} triggered"),
        )
        .await?
        .expect("rmd bump always installs");

    let nl = NotifListener::new(
        &rebalance_id,
        NotifKind::Rebalance,
        BTreeSet::from_iter(participants),
        now_ms(),
    );
    ic::register_listener(ctx, nl).await;

    let rmd = ctx.rmd.get().await;
    pairs.push(RevPair::from_rmd(
        &rmd,
        ActionMsg::new(Action::RebalanceTriggered {
            rebalance_id: rebalance_id.clone(),
        }),
    )?);
    metasync::sync(ctx, pairs).await;
    Ok(Some(rebalance_id))
}

async fn set_node_flags(
    ctx: &Arc<NodeContext>,
    node_id: &str,
    flag: SnodeFlags,
    on: bool,
) -> Result<(), OpalError> {
    let ic_count = ctx.cluster_config().await.ic.count;
    let id = node_id.to_string();
    ctx.smap
        .modify(
            |smap| {
                let Some(node) = smap.get_node_mut(&id) else {
                    return Err(OpalError::NodeNotFound(id.clone()));
                };
                let mut flags = node.flags();
                let had = flags.contains(flag);
                if on {
                    flags.insert(flag);
                } else {
                    flags.remove(flag);
                }
                if had == on {
                    return Ok(None); // no-op
                }
                node.set_flags(flags);
                smap.staff_ic(ic_count);
                smap.version += 1;
                Ok(Some(()))
            },
            |installed, _| {
                info!(
                    "{}: {flag:?} {} (now {})",
                    id,
                    if on { "set" } else { "cleared" },
                    installed.string_ex()
                );
            },
        )
        .await?;
    let smap = ctx.smap.get().await;
    ctx.react_smap_change(&smap);
    Ok(())
}

async fn remove_from_smap(ctx: &Arc<NodeContext>, node_id: &str) -> Result<(), OpalError> {
    let ic_count = ctx.cluster_config().await.ic.count;
    let id = node_id.to_string();
    let removed = ctx
        .smap
        .modify(
            |smap| {
                if smap.remove_node(&id).is_none() {
                    return Ok(None);
                }
                smap.staff_ic(ic_count);
                smap.version += 1;
                Ok(Some(()))
            },
            |installed, _| info!("removed {id}; now {}", installed.string_ex()),
        )
        .await?;
    if removed.is_some() {
        let smap = ctx.smap.get().await;
        ctx.react_smap_change(&smap);
        let pair = RevPair::from_smap(
            &smap,
            ActionMsg::new(Action::RemoveNode {
                node_ids: vec![node_id.to_string()],
            }),
        )?;
        metasync::sync(ctx, vec![pair]).await;
    }
    Ok(())
}

// --- Node-local reactions -----------------------------------------------

/// Graceful self-shutdown: stop accepting metadata, signal every background
/// task, and let `main` unwind.
pub fn self_shutdown(ctx: &Arc<NodeContext>) {
    if ctx.stopping.swap(true, Ordering::SeqCst) {
        return;
    }
    info!("shutdown requested; stopping");
    let _ = ctx.shutdown_tx.send(());
}

/// Self-decommission: terminate cluster participation, abort local
/// operations, wipe persisted control-plane state, and exit the process
/// unless asked to stay up.
pub fn self_decommission(ctx: &Arc<NodeContext>, opts: DecommissionOpts) {
    if ctx.stopping.swap(true, Ordering::SeqCst) {
        return;
    }
    info!(
        "decommission requested (no_shutdown={}, rm_user_data={})",
        opts.no_shutdown, opts.rm_user_data
    );
    ctx.local_xactions.clear();
    let _ = ctx.shutdown_tx.send(());

    let ctx = ctx.clone();
    tokio::spawn(async move {
        ctx.wipe_persisted_state().await;
        if opts.rm_user_data {
            // Data wipe is owned by the data path; the registry empties here.
            ctx.mountpaths.write().clear();
        }
        if !opts.no_shutdown {
            // Give the HTTP response a moment to flush.
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            info!("decommissioned; exiting");
            std::process::exit(0);
        }
    });
}

// --- Two-phase forced primary change ------------------------------------

/// Runs on the current primary: phase 1 asks every member to validate and
/// freeze ("prepare"), phase 2 commits. The designated proxy finishes the
/// handover by bumping the version and distributing its own map.
pub async fn set_primary(ctx: &Arc<NodeContext>, new_primary_id: &str) -> Result<(), OpalError> {
    let smap = ctx.smap.get().await;
    let Some(new_primary) = smap.proxies.get(new_primary_id) else {
        return Err(OpalError::NodeNotFound(new_primary_id.to_string()));
    };
    if !new_primary.is_electable() {
        return Err(OpalError::InvalidRequest(format!(
            "{new_primary_id} is not electable"
        )));
    }
    if smap.is_primary(new_primary_id) {
        return Ok(());
    }

    let members = smap.peers_of("");
    for prepare in [true, false] {
        for node in &members {
            let url = format!(
                "{}/v1/daemon/proxy/{new_primary_id}?prepare={prepare}",
                node.control_url
            );
            let resp = ctx.request(Method::PUT, &url).await.send().await?;
            if !resp.status().is_success() {
                let text = resp.text().await.unwrap_or_default();
                if prepare {
                    return Err(OpalError::Internal(format!(
                        "primary change aborted in prepare phase by {}: {text}",
                        node.id
                    )));
                }
                warn!("commit phase failed on {}: {text}", node.id);
            }
        }
    }
    Ok(())
}

/// Runs on every member, both phases. In the commit phase the designated
/// proxy takes over.
pub async fn handle_primary_change(
    ctx: &Arc<NodeContext>,
    new_primary_id: &str,
    prepare: bool,
) -> Result<(), OpalError> {
    let smap = ctx.smap.get().await;
    let Some(_) = smap.proxies.get(new_primary_id) else {
        return Err(OpalError::NodeNotFound(new_primary_id.to_string()));
    };
    if prepare {
        return Ok(());
    }
    let self_id = ctx.self_id();
    if self_id == new_primary_id {
        let ic_count = ctx.cluster_config().await.ic.count;
        let id = new_primary_id.to_string();
        ctx.smap
            .modify(
                |smap| {
                    smap.primary_id = id.clone();
                    smap.version += SMAP_VERSION_TAKEOVER_JUMP;
                    smap.staff_ic(ic_count);
                    Ok(Some(()))
                },
                |installed, _| info!("took over as primary: {}", installed.string_ex()),
            )
            .await?;
        let smap = ctx.smap.get().await;
        ctx.react_smap_change(&smap);
        let pair = RevPair::from_smap(
            &smap,
            ActionMsg::new(Action::NewPrimary {
                node_id: self_id.clone(),
            }),
        )?;
        metasync::sync(ctx, vec![pair]).await;
    } else {
        // Commit locally; the new primary's metasync will follow with the
        // version bump.
        ctx.smap
            .modify(
                |smap| {
                    if smap.primary_id == new_primary_id {
                        return Ok(None);
                    }
                    smap.primary_id = new_primary_id.to_string();
                    Ok(Some(()))
                },
                |_, _: &()| info!("primary changed to {new_primary_id}"),
            )
            .await?;
    }
    Ok(())
}

/// Helpers used by HTTP handlers to enforce primacy.
pub async fn ensure_primary(ctx: &Arc<NodeContext>) -> Result<(), OpalError> {
    if ctx.is_primary().await {
        return Ok(());
    }
    let smap = ctx.smap.get().await;
    let primary_url = smap
        .primary()
        .map(|p| p.control_url.clone())
        .unwrap_or_default();
    Err(OpalError::NotPrimary { primary_url })
}

/// The lifecycle phase a node's flags put it in, as reported on status
/// queries.
pub fn lifecycle_phase(flags: SnodeFlags) -> &'static str {
    if flags.contains(SnodeFlags::DECOMMISSION) {
        "decommissioning"
    } else if flags.contains(SnodeFlags::SHUTDOWN) {
        "shutdown"
    } else if flags.contains(SnodeFlags::MAINTENANCE) {
        "maintenance"
    } else {
        "active"
    }
}
