// src/server/http/notifs.rs

//! `/v1/notifs`: notifier→IC reports, table queries, table sync, and aborts.

use super::{ApiResult, check_auth, note_caller};
use crate::core::OpalError;
use crate::core::notifs::{NotifDump, NotifMsg};
use crate::core::state::NodeContext;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

/// A notifier reports progress. Unknown UUIDs are tolerated silently.
pub async fn progress(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Json(msg): Json<NotifMsg>,
) -> ApiResult<Json<Value>> {
    let smap = ctx.smap.get().await;
    note_caller(&ctx, &headers, smap.version);
    let stats = msg.stats.unwrap_or(Value::Null);
    ctx.notifs.handle_progress(&msg.uuid, &msg.node_id, stats);
    Ok(Json(json!({})))
}

/// A notifier reports completion. A duplicate report is a 400.
pub async fn finished(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Json(msg): Json<NotifMsg>,
) -> ApiResult<Json<Value>> {
    let smap = ctx.smap.get().await;
    note_caller(&ctx, &headers, smap.version);
    let done = ctx
        .notifs
        .handle_finished(&msg.uuid, &msg.node_id, msg.err, msg.aborted)?;
    Ok(Json(json!({ "done": done })))
}

/// Queries a single tracked operation (either table).
pub async fn get_one(
    State(ctx): State<Arc<NodeContext>>,
    Path(uuid): Path<String>,
) -> ApiResult<Json<Value>> {
    // IC members answer from their tables; notifiers answer from their
    // local-operation registry (the housekeeping probe path).
    if let Some(nl) = ctx.notifs.get(&uuid) {
        return Ok(Json(json!(nl)));
    }
    let stats = super::daemon::probe_answer(&ctx, &uuid)?;
    Ok(Json(stats))
}

/// Administrative abort. Moving the listener to the finished table emits
/// the single completion event; the dispatcher reacting to it fans the
/// abort out to notifiers on the primary.
pub async fn abort(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> ApiResult<Json<Value>> {
    check_auth(&ctx, &headers)?;
    let smap = ctx.smap.get().await;
    note_caller(&ctx, &headers, smap.version);

    // On a notifier this is the abort fan-out arriving: stop the local
    // operation and acknowledge.
    if ctx.local_xactions.remove(&uuid).is_some() {
        info!("operation {uuid} aborted locally");
        return Ok(Json(json!({})));
    }

    ctx.notifs.abort(&uuid, "administrative abort")?;
    Ok(Json(json!({})))
}

/// Full-table dump, consumed by proxies newly promoted into the IC.
pub async fn dump(State(ctx): State<Arc<NodeContext>>) -> ApiResult<Json<NotifDump>> {
    let dump = ctx.notifs.dump()?;
    Ok(Json(dump))
}

/// Full-table sync from another IC member.
pub async fn absorb(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Json(dump): Json<NotifDump>,
) -> ApiResult<Json<Value>> {
    check_auth(&ctx, &headers)?;
    let smap = ctx.smap.get().await;
    note_caller(&ctx, &headers, smap.version);
    if !ctx.self_snode().is_ic_member() && !smap.is_primary(&ctx.self_id()) {
        return Err(OpalError::InvalidRequest(
            "this proxy is not an information-center member".into(),
        )
        .into());
    }
    ctx.notifs.absorb(dump)?;
    Ok(Json(json!({})))
}
