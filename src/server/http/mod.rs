// src/server/http/mod.rs

//! The intra-cluster and administrative HTTP surface.

mod cluster;
mod daemon;
mod health;
mod metasync;
mod notifs;
mod vote;

use crate::core::metrics::gather_metrics;
use crate::core::state::NodeContext;
use crate::core::{HDR_CALLER_ID, HDR_CALLER_NAME, HDR_CALLER_SMAP_VERSION, OpalError};
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Maps control-plane errors onto HTTP responses. Not-primary errors carry
/// the current primary in the `Location` header so callers can follow.
pub struct ApiError(pub OpalError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::Json(json!({ "error": self.0.to_string() }));
        let mut resp = (status, body).into_response();
        if let OpalError::NotPrimary { primary_url } = &self.0 {
            if !primary_url.is_empty() {
                if let Ok(v) = primary_url.parse() {
                    resp.headers_mut().insert(header::LOCATION, v);
                }
            }
        }
        resp
    }
}

impl From<OpalError> for ApiError {
    fn from(e: OpalError) -> Self {
        ApiError(e)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Compares the caller's map version against ours and logs staleness; every
/// control request carries the caller-identity headers.
pub fn note_caller(ctx: &Arc<NodeContext>, headers: &HeaderMap, local_smap_version: u64) {
    let caller_id = headers
        .get(HDR_CALLER_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    let caller_version: u64 = headers
        .get(HDR_CALLER_SMAP_VERSION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if caller_version > 0 && caller_version < local_smap_version {
        let caller_name = headers
            .get(HDR_CALLER_NAME)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(caller_id);
        warn!(
            "stale caller {caller_name}: map v{caller_version} < local v{local_smap_version}"
        );
    }
    if caller_id != "-" {
        ctx.hb.heard_from(caller_id);
    }
}

/// Bearer-token check for mutating endpoints, active only when a token is
/// configured.
pub fn check_auth(ctx: &Arc<NodeContext>, headers: &HeaderMap) -> Result<(), OpalError> {
    let expected = ctx.config.read().auth_token.clone();
    let Some(expected) = expected else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(OpalError::NoPermission("bad bearer token".into())),
        None => Err(OpalError::AuthRequired),
    }
}

async fn metrics_handler(State(ctx): State<Arc<NodeContext>>) -> impl IntoResponse {
    let smap = ctx.smap.get().await;
    crate::core::metrics::SMAP_VERSION.set(smap.version as f64);
    crate::core::metrics::BMD_VERSION.set(ctx.bmd.get().await.version as f64);
    crate::core::metrics::IS_PRIMARY.set(if smap.is_primary(&ctx.self_id()) {
        1.0
    } else {
        0.0
    });
    crate::core::metrics::NOTIFS_RUNNING.set(ctx.notifs.running_count() as f64);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

pub fn router(ctx: Arc<NodeContext>) -> Router {
    Router::new()
        // cluster (primary-only ops, admin join)
        .route(
            "/v1/cluster",
            get(cluster::get_cluster)
                .put(cluster::admin_op)
                .post(cluster::join),
        )
        .route("/v1/cluster/join", post(cluster::join))
        // daemon
        .route("/v1/daemon", get(daemon::get_what).put(daemon::put_action))
        .route("/v1/daemon/proxy/{id}", put(daemon::primary_change))
        .route(
            "/v1/daemon/mountpaths",
            post(daemon::mountpaths_attach).delete(daemon::mountpaths_detach),
        )
        // metasync
        .route(
            "/v1/metasync",
            put(metasync::receive).post(metasync::gfn_control),
        )
        // health
        .route("/v1/health", get(health::health))
        // notifs
        .route(
            "/v1/notifs",
            get(notifs::dump).put(notifs::absorb),
        )
        .route("/v1/notifs/progress", post(notifs::progress))
        .route("/v1/notifs/finished", post(notifs::finished))
        .route(
            "/v1/notifs/{uuid}",
            get(notifs::get_one).delete(notifs::abort),
        )
        // vote
        .route("/v1/vote/init", post(vote::init))
        .route("/v1/vote/proxy", post(vote::request_vote))
        .route("/v1/vote/primary", put(vote::result_announce))
        // metrics
        .route("/metrics", get(metrics_handler))
        .with_state(ctx)
}

/// Binds the control listener and serves until shutdown.
pub async fn serve(
    listener: tokio::net::TcpListener,
    ctx: Arc<NodeContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let addr = listener.local_addr().ok();
    info!("control plane listening on {addr:?}");
    let app = router(ctx);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("control plane shutting down");
        })
        .await
    {
        error!("control-plane server error: {e}");
    }
}
