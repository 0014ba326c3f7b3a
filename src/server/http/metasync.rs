// src/server/http/metasync.rs

//! `/v1/metasync`: revision-bundle receive (PUT) and the get-from-neighbor
//! window control (POST).

use super::{ApiResult, check_auth, note_caller};
use crate::core::metasync::{MsyncResponse, SyncBundle, apply_bundle};
use crate::core::OpalError;
use crate::core::state::NodeContext;
use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

/// Applies a revision bundle. A cluster-integrity failure is unrecoverable
/// at node scope: the response is flushed and the process exits non-zero.
pub async fn receive(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Json(bundle): Json<SyncBundle>,
) -> ApiResult<Json<MsyncResponse>> {
    check_auth(&ctx, &headers)?;
    let local_version = ctx.smap.get().await.version;
    note_caller(&ctx, &headers, local_version);

    match apply_bundle(&ctx, bundle).await {
        Ok(resp) => Ok(Json(resp)),
        Err(e) if e.is_integrity() => {
            error!("FATAL: {e}");
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let _ = ctx.shutdown_tx.send(());
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                std::process::exit(1);
            });
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct GfnMsg {
    /// "start" or "stop".
    pub action: String,
}

/// Opens or closes the bounded window during which this target serves reads
/// by asking peers for objects not yet locally resilvered. A `stop` does
/// not close the window immediately: deactivation is scheduled after a
/// linger so in-flight neighbor reads can drain.
pub async fn gfn_control(
    State(ctx): State<Arc<NodeContext>>,
    headers: HeaderMap,
    Json(msg): Json<GfnMsg>,
) -> ApiResult<Json<Value>> {
    check_auth(&ctx, &headers)?;
    let smap = ctx.smap.get().await;
    note_caller(&ctx, &headers, smap.version);
    if !ctx.self_snode().is_target() {
        return Err(
            OpalError::InvalidRequest("the GFN window applies to targets only".into()).into(),
        );
    }

    // A stale caller driving GFN transitions is a red flag mid-rebalance.
    let caller_version: u64 = headers
        .get(crate::core::HDR_CALLER_SMAP_VERSION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if caller_version > 0 && caller_version < smap.version {
        warn!("stale GFN control (caller v{caller_version} < v{})", smap.version);
    }

    let active = match msg.action.as_str() {
        "start" => {
            let n = ctx.gfn_active.fetch_add(1, Ordering::SeqCst) + 1;
            info!("GFN window activated (count={n})");
            n
        }
        "stop" => {
            let linger = ctx.cluster_config().await.timeout.max_host_busy;
            let due = std::time::Instant::now() + linger;
            *ctx.gfn_deadline.lock() = Some(due);
            let gfn_ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(linger).await;
                let prev = gfn_ctx
                    .gfn_active
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                        Some(v.saturating_sub(1))
                    })
                    .unwrap_or(0);
                let n = prev.saturating_sub(1);
                if n == 0 {
                    let mut deadline = gfn_ctx.gfn_deadline.lock();
                    if deadline.map(|d| d <= std::time::Instant::now()).unwrap_or(false) {
                        *deadline = None;
                    }
                }
                info!("GFN window deactivated (count={n})");
            });
            let n = ctx.gfn_active.load(Ordering::SeqCst);
            info!(
                "GFN deactivation scheduled in {}s (count={n})",
                linger.as_secs()
            );
            n
        }
        other => {
            return Err(OpalError::InvalidRequest(format!("unknown GFN action: {other}")).into());
        }
    };
    let deadline_in_ms = ctx
        .gfn_deadline
        .lock()
        .map(|d| d.saturating_duration_since(std::time::Instant::now()).as_millis() as u64);
    Ok(Json(json!({ "gfn_active": active, "gfn_deadline_in_ms": deadline_in_ms })))
}
