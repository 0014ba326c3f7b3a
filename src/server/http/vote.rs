// src/server/http/vote.rs

//! `/v1/vote/*`: election messages.

use super::{ApiResult, note_caller};
use crate::core::cluster::election::{self, VoteRecord, VoteRes, VoteResultMsg};
use crate::core::state::NodeContext;
use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

/// A peer nudges this node to start campaigning (it is the HRW successor).
pub async fn init(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Json(record): Json<VoteRecord>,
) -> ApiResult<Json<Value>> {
    let smap = ctx.smap.get().await;
    note_caller(&ctx, &headers, smap.version);
    info!(
        "election nudge received (presumed-dead primary: {})",
        record.primary_id
    );
    if record.candidate.id == ctx.self_id() {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            election::campaign(ctx).await;
        });
    }
    Ok(Json(json!({})))
}

/// A candidate requests this node's vote.
pub async fn request_vote(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Json(record): Json<VoteRecord>,
) -> ApiResult<Json<VoteRes>> {
    let smap = ctx.smap.get().await;
    note_caller(&ctx, &headers, smap.version);
    let res = election::handle_vote_request(&ctx, &record).await;
    info!(
        "vote request from {}: {}",
        record.candidate.id,
        if res.yes { "yes" } else { res.reason.as_str() }
    );
    Ok(Json(res))
}

/// The winner announces the settled election.
pub async fn result_announce(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Json(msg): Json<VoteResultMsg>,
) -> ApiResult<Json<Value>> {
    let smap = ctx.smap.get().await;
    note_caller(&ctx, &headers, smap.version);
    election::handle_vote_result(&ctx, &msg);
    Ok(Json(json!({})))
}
