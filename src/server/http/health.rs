// src/server/http/health.rs

//! `/v1/health`: liveness plus a cluster-info piggyback in the response
//! headers, and rebalance status for targets on request.

use super::note_caller;
use crate::core::state::NodeContext;
use crate::core::{HDR_BMD_VERSION, HDR_SMAP_UUID, HDR_SMAP_VERSION, HDR_VOTE_IN_PROGRESS};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    rebalance: bool,
}

pub async fn health(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Query(q): Query<HealthQuery>,
) -> impl IntoResponse {
    let smap = ctx.smap.get().await;
    note_caller(&ctx, &headers, smap.version);

    let status = if ctx.is_stopping() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let mut out = HeaderMap::new();
    let vote = ctx.vote_in_progress.load(Ordering::SeqCst);
    for (name, value) in [
        (HDR_SMAP_VERSION, smap.version.to_string()),
        (HDR_SMAP_UUID, smap.uuid.clone()),
        (HDR_BMD_VERSION, ctx.bmd.get().await.version.to_string()),
        (HDR_VOTE_IN_PROGRESS, vote.to_string()),
    ] {
        if let Ok(v) = value.parse() {
            out.insert(name, v);
        }
    }

    let body = if q.rebalance {
        json!({
            "smap_version": smap.version,
            "bmd_version": ctx.bmd.get().await.version,
            "rebalance": ctx.rebalance_status(),
        })
    } else {
        json!({
            "smap_version": smap.version,
            "bmd_version": ctx.bmd.get().await.version,
        })
    };
    (status, out, axum::Json(body))
}
