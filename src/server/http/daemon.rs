// src/server/http/daemon.rs

//! `/v1/daemon`: node introspection and node-local lifecycle operations.

use super::{ApiResult, check_auth, note_caller};
use crate::core::cluster::maintenance::{self, DecommissionOpts};
use crate::core::OpalError;
use crate::core::state::NodeContext;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct WhatQuery {
    #[serde(default)]
    what: String,
}

pub async fn get_what(
    State(ctx): State<Arc<NodeContext>>,
    Query(q): Query<WhatQuery>,
) -> ApiResult<Json<Value>> {
    let out = match q.what.as_str() {
        "smap" => json!(&*ctx.smap.get().await),
        "bmd" => json!(&*ctx.bmd.get().await),
        "rmd" => json!(&*ctx.rmd.get().await),
        "config" => json!(&*ctx.cluconf.get().await),
        "smapvote" => json!(ctx.clu_meta().await),
        "nodestatus" | "" => node_status(&ctx).await,
        other => {
            return Err(OpalError::InvalidRequest(format!("unknown query: what={other}")).into());
        }
    };
    Ok(Json(out))
}

async fn node_status(ctx: &Arc<NodeContext>) -> Value {
    let snode = ctx.self_snode();
    let smap = ctx.smap.get().await;
    json!({
        "node": snode,
        "phase": maintenance::lifecycle_phase(snode.flags()),
        "is_primary": smap.is_primary(&snode.id),
        "uptime_secs": ctx.start_time.elapsed().as_secs(),
        "smap_version": smap.version,
        "smap_uuid": smap.uuid,
        "bmd_version": ctx.bmd.get().await.version,
        "rmd_version": ctx.rmd.get().await.version,
        "config_version": ctx.cluconf.get().await.version,
        "rebalance": ctx.rebalance_status(),
        "notifs_running": ctx.notifs.running_count(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ActionQuery {
    action: String,
    #[serde(default)]
    node_id: Option<String>,
    #[serde(default)]
    skip_rebalance: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SetConfigBody {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub rebalance_enabled: Option<bool>,
}

/// Node-local lifecycle actions, plus the cluster-level maintenance verbs
/// when this node happens to be the primary (callers hitting a secondary
/// get redirected).
pub async fn put_action(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Query(q): Query<ActionQuery>,
    body: Option<Json<Value>>,
) -> ApiResult<Json<Value>> {
    check_auth(&ctx, &headers)?;
    let smap = ctx.smap.get().await;
    note_caller(&ctx, &headers, smap.version);
    info!("daemon action: {}", q.action);

    match q.action.as_str() {
        "shutdown" => {
            maintenance::self_shutdown(&ctx);
            Ok(Json(json!({})))
        }
        "decommission" => {
            let opts: DecommissionOpts = body
                .map(|Json(v)| serde_json::from_value(v))
                .transpose()
                .map_err(OpalError::from)?
                .unwrap_or_default();
            maintenance::self_decommission(&ctx, opts);
            Ok(Json(json!({})))
        }
        "set-config" => {
            let cfg: SetConfigBody = body
                .map(|Json(v)| serde_json::from_value(v))
                .transpose()
                .map_err(OpalError::from)?
                .unwrap_or_default();
            apply_set_config(&ctx, cfg).await?;
            Ok(Json(json!({})))
        }
        "start-maintenance" => {
            maintenance::ensure_primary(&ctx).await?;
            let node_id = required_node_id(&q)?;
            let rebalance_id =
                maintenance::start_maintenance(&ctx, &node_id, q.skip_rebalance).await?;
            Ok(Json(json!({ "rebalance_id": rebalance_id })))
        }
        "stop-maintenance" => {
            maintenance::ensure_primary(&ctx).await?;
            let node_id = required_node_id(&q)?;
            let rebalance_id = maintenance::stop_maintenance(&ctx, &node_id).await?;
            Ok(Json(json!({ "rebalance_id": rebalance_id })))
        }
        other => Err(OpalError::InvalidRequest(format!("unknown action: {other}")).into()),
    }
}

fn required_node_id(q: &ActionQuery) -> Result<String, OpalError> {
    q.node_id
        .clone()
        .ok_or_else(|| OpalError::InvalidRequest("node_id is required".into()))
}

async fn apply_set_config(ctx: &Arc<NodeContext>, cfg: SetConfigBody) -> Result<(), OpalError> {
    if let Some(level) = &cfg.log_level {
        let filter = tracing_subscriber::filter::EnvFilter::try_new(level)
            .map_err(|e| OpalError::InvalidRequest(format!("bad log level '{level}': {e}")))?;
        ctx.log_reload_handle
            .reload(filter)
            .map_err(|e| OpalError::Internal(format!("failed to apply log level: {e}")))?;
        ctx.config.write().log_level = level.clone();
        info!("log level changed to {level}");
    }
    if let Some(enabled) = cfg.rebalance_enabled {
        // Cluster-wide knob: bump and distribute the config revision.
        maintenance::ensure_primary(ctx).await?;
        ctx.cluconf
            .modify(
                |conf| {
                    if conf.rebalance.enabled == enabled {
                        return Ok(None);
                    }
                    conf.rebalance.enabled = enabled;
                    conf.version += 1;
                    Ok(Some(()))
                },
                |installed, _| info!("cluster config now v{}", installed.version),
            )
            .await?;
        let conf = ctx.cluconf.get().await;
        let pair = crate::core::metasync::RevPair::from_config(
            &conf,
            crate::core::metasync::ActionMsg::new(crate::core::metasync::Action::ConfigUpdated),
        )?;
        crate::core::metasync::sync(ctx, vec![pair]).await;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct PrepareQuery {
    #[serde(default)]
    prepare: bool,
}

/// Two-phase forced primary change, member side.
pub async fn primary_change(
    State(ctx): State<Arc<NodeContext>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(q): Query<PrepareQuery>,
) -> ApiResult<Json<Value>> {
    check_auth(&ctx, &headers)?;
    let smap = ctx.smap.get().await;
    note_caller(&ctx, &headers, smap.version);
    maintenance::handle_primary_change(&ctx, &id, q.prepare).await?;
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
pub struct MountpathBody {
    pub path: String,
    /// attach/detach also double as enable/disable with this set.
    #[serde(default)]
    pub enable_only: bool,
}

/// Attach (or re-enable) a mountpath. Target only; the registry is
/// persisted on every change.
pub async fn mountpaths_attach(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Json(body): Json<MountpathBody>,
) -> ApiResult<Json<Value>> {
    check_auth(&ctx, &headers)?;
    ensure_target(&ctx)?;
    let mps = ctx.attach_mountpath(&body.path, body.enable_only)?;
    info!("mountpath {} attached/enabled", body.path);
    Ok(Json(json!({ "mountpaths": mps })))
}

/// Detach (or disable) a mountpath. Target only; the registry is persisted
/// on every change.
pub async fn mountpaths_detach(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Json(body): Json<MountpathBody>,
) -> ApiResult<Json<Value>> {
    check_auth(&ctx, &headers)?;
    ensure_target(&ctx)?;
    let mps = ctx.detach_mountpath(&body.path, body.enable_only)?;
    info!("mountpath {} detached/disabled", body.path);
    Ok(Json(json!({ "mountpaths": mps })))
}

fn ensure_target(ctx: &Arc<NodeContext>) -> Result<(), OpalError> {
    if ctx.self_snode().is_target() {
        Ok(())
    } else {
        Err(OpalError::InvalidRequest(
            "mountpath operations apply to targets only".into(),
        ))
    }
}

/// Answering a housekeeping probe for an operation this node is not running
/// yields 404, which the IC interprets via the progress-interval rule.
pub fn probe_answer(ctx: &Arc<NodeContext>, uuid: &str) -> Result<serde_json::Value, OpalError> {
    ctx.local_xactions.get(uuid).map(|v| v.clone()).ok_or_else(|| {
        OpalError::NotFound(format!("operation {uuid} is not running on this node"))
    })
}
