// src/server/http/cluster.rs

//! `/v1/cluster`: admin join plus primary-only cluster operations.

use super::{ApiResult, check_auth, note_caller};
use crate::core::cluster::maintenance::{self, DecommissionOpts};
use crate::core::meta::JoinReq;
use crate::core::metasync::{Action, ActionMsg, RevPair};
use crate::core::state::NodeContext;
use crate::core::{OpalError, metasync};
use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

pub async fn get_cluster(State(ctx): State<Arc<NodeContext>>) -> ApiResult<Json<Value>> {
    let smap = ctx.smap.get().await;
    let bmd = ctx.bmd.get().await;
    Ok(Json(json!({
        "smap": &*smap,
        "bmd_version": bmd.version,
        "primary": &smap.primary_id,
    })))
}

/// A node (or admin on its behalf) joins the cluster.
pub async fn join(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Json(req): Json<JoinReq>,
) -> ApiResult<Json<crate::core::meta::CluMeta>> {
    check_auth(&ctx, &headers)?;
    let smap = ctx.smap.get().await;
    note_caller(&ctx, &headers, smap.version);
    if ctx.is_stopping() {
        return Err(OpalError::Unavailable("node is shutting down".into()).into());
    }
    // Joins go to the primary; during its own startup a candidate accepts
    // them into the regpool regardless.
    if !ctx.in_startup.load(std::sync::atomic::Ordering::SeqCst) {
        maintenance::ensure_primary(&ctx).await?;
    }
    let meta = crate::core::cluster::bootstrap::handle_join(&ctx, req).await?;
    Ok(Json(meta))
}

/// The administrative operations the primary executes on the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum AdminOp {
    StartMaintenance {
        node_id: String,
        #[serde(default)]
        skip_rebalance: bool,
    },
    StopMaintenance {
        node_id: String,
    },
    DecommissionNode {
        node_id: String,
        #[serde(default)]
        opts: DecommissionOpts,
    },
    ShutdownNode {
        node_id: String,
    },
    SetPrimary {
        node_id: String,
    },
    CreateBucket {
        name: String,
    },
    DestroyBucket {
        name: String,
    },
    RebalanceCluster,
}

pub async fn admin_op(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Json(op): Json<AdminOp>,
) -> ApiResult<Json<Value>> {
    check_auth(&ctx, &headers)?;
    let smap = ctx.smap.get().await;
    note_caller(&ctx, &headers, smap.version);
    maintenance::ensure_primary(&ctx).await?;
    info!("admin op: {op:?}");

    let out = match op {
        AdminOp::StartMaintenance {
            node_id,
            skip_rebalance,
        } => {
            let rebalance_id = maintenance::start_maintenance(&ctx, &node_id, skip_rebalance).await?;
            json!({ "rebalance_id": rebalance_id })
        }
        AdminOp::StopMaintenance { node_id } => {
            let rebalance_id = maintenance::stop_maintenance(&ctx, &node_id).await?;
            json!({ "rebalance_id": rebalance_id })
        }
        AdminOp::DecommissionNode { node_id, opts } => {
            maintenance::decommission_node(&ctx, &node_id, opts).await?;
            json!({})
        }
        AdminOp::ShutdownNode { node_id } => {
            maintenance::shutdown_node(&ctx, &node_id).await?;
            json!({})
        }
        AdminOp::SetPrimary { node_id } => {
            maintenance::set_primary(&ctx, &node_id).await?;
            json!({})
        }
        AdminOp::CreateBucket { name } => {
            mutate_bmd(&ctx, &name, true).await?;
            json!({})
        }
        AdminOp::DestroyBucket { name } => {
            mutate_bmd(&ctx, &name, false).await?;
            json!({})
        }
        AdminOp::RebalanceCluster => {
            let rebalance_id = maintenance::trigger_rebalance(&ctx, Vec::new()).await?;
            json!({ "rebalance_id": rebalance_id })
        }
    };
    Ok(Json(out))
}

async fn mutate_bmd(ctx: &Arc<NodeContext>, name: &str, create: bool) -> Result<(), OpalError> {
    let bucket = name.to_string();
    ctx.bmd
        .modify(
            |bmd| {
                if create {
                    bmd.add_bucket(&bucket, Default::default())?;
                } else {
                    bmd.del_bucket(&bucket)?;
                }
                Ok(Some(()))
            },
            |installed, _| info!("bucket map now v{}", installed.version),
        )
        .await?;
    let bmd = ctx.bmd.get().await;
    let action = if create {
        Action::BucketCreated {
            name: name.to_string(),
        }
    } else {
        Action::BucketDestroyed {
            name: name.to_string(),
        }
    };
    let txn_uuid = uuid::Uuid::new_v4().to_string();
    let pair = RevPair::from_bmd(&bmd, ActionMsg::with_txn(action, &txn_uuid))?;
    metasync::sync(ctx, vec![pair]).await;
    Ok(())
}
