// src/core/errors.rs

//! Defines the primary error type for the entire control plane.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the node.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum OpalError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("HTTP client error: {0}")]
    HttpClientError(String),

    /// Two pieces of cluster metadata carry conflicting UUIDs. This is a
    /// split-brain condition and is fatal at node scope.
    #[error("cluster integrity error: {0}")]
    ClusterIntegrity(String),

    /// An incoming revision does not supersede the local one.
    #[error("downgrade {kind}: incoming v{incoming} <= local v{local}")]
    Downgrade {
        kind: &'static str,
        incoming: u64,
        local: u64,
    },

    /// The operation must be executed by the current primary.
    #[error("not primary: current primary is {primary_url}")]
    NotPrimary { primary_url: String },

    #[error("node {0} not found in the cluster map")]
    NodeNotFound(String),

    /// A transient control-plane RPC failure; retried with bounded backoff.
    #[error("transient RPC failure talking to {url}: {reason}")]
    Transient { url: String, reason: String },

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("NOAUTH authentication required")]
    AuthRequired,

    #[error("permission denied: {0}")]
    NoPermission(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The node is shutting down or has not finished starting up.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("failed to join cluster: {0}")]
    JoinFailed(String),

    #[error("vote in progress")]
    VoteInProgress,

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl OpalError {
    /// Maps the error kind to the HTTP status code returned to callers.
    pub fn http_status(&self) -> u16 {
        match self {
            OpalError::AuthRequired => 401,
            OpalError::NoPermission(_) => 403,
            OpalError::NotFound(_) | OpalError::NodeNotFound(_) => 404,
            OpalError::InvalidRequest(_) | OpalError::Downgrade { .. } => 400,
            OpalError::NotPrimary { .. } => 421,
            OpalError::Timeout(_) => 408,
            OpalError::Unavailable(_) | OpalError::VoteInProgress => 503,
            _ => 500,
        }
    }

    /// Whether a caller should retry after a short delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OpalError::Transient { .. }
                | OpalError::Timeout(_)
                | OpalError::Unavailable(_)
                | OpalError::VoteInProgress
                | OpalError::NodeNotFound(_)
        )
    }

    /// Downgrade errors are benign: the receiver already holds a newer revision.
    pub fn is_downgrade(&self) -> bool {
        matches!(self, OpalError::Downgrade { .. })
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, OpalError::ClusterIntegrity(_))
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for OpalError {
    fn clone(&self) -> Self {
        match self {
            OpalError::Io(e) => OpalError::Io(Arc::clone(e)),
            OpalError::HttpClientError(s) => OpalError::HttpClientError(s.clone()),
            OpalError::ClusterIntegrity(s) => OpalError::ClusterIntegrity(s.clone()),
            OpalError::Downgrade {
                kind,
                incoming,
                local,
            } => OpalError::Downgrade {
                kind,
                incoming: *incoming,
                local: *local,
            },
            OpalError::NotPrimary { primary_url } => OpalError::NotPrimary {
                primary_url: primary_url.clone(),
            },
            OpalError::NodeNotFound(s) => OpalError::NodeNotFound(s.clone()),
            OpalError::Transient { url, reason } => OpalError::Transient {
                url: url.clone(),
                reason: reason.clone(),
            },
            OpalError::Timeout(s) => OpalError::Timeout(s.clone()),
            OpalError::AuthRequired => OpalError::AuthRequired,
            OpalError::NoPermission(s) => OpalError::NoPermission(s.clone()),
            OpalError::InvalidRequest(s) => OpalError::InvalidRequest(s.clone()),
            OpalError::NotFound(s) => OpalError::NotFound(s.clone()),
            OpalError::Unavailable(s) => OpalError::Unavailable(s.clone()),
            OpalError::InvalidState(s) => OpalError::InvalidState(s.clone()),
            OpalError::JoinFailed(s) => OpalError::JoinFailed(s.clone()),
            OpalError::VoteInProgress => OpalError::VoteInProgress,
            OpalError::Internal(s) => OpalError::Internal(s.clone()),
        }
    }
}

impl PartialEq for OpalError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OpalError::Io(e1), OpalError::Io(e2)) => e1.to_string() == e2.to_string(),
            (OpalError::HttpClientError(s1), OpalError::HttpClientError(s2)) => s1 == s2,
            (OpalError::ClusterIntegrity(s1), OpalError::ClusterIntegrity(s2)) => s1 == s2,
            (
                OpalError::Downgrade {
                    kind: k1,
                    incoming: i1,
                    local: l1,
                },
                OpalError::Downgrade {
                    kind: k2,
                    incoming: i2,
                    local: l2,
                },
            ) => k1 == k2 && i1 == i2 && l1 == l2,
            (
                OpalError::NotPrimary { primary_url: u1 },
                OpalError::NotPrimary { primary_url: u2 },
            ) => u1 == u2,
            (OpalError::NodeNotFound(s1), OpalError::NodeNotFound(s2)) => s1 == s2,
            (OpalError::InvalidRequest(s1), OpalError::InvalidRequest(s2)) => s1 == s2,
            (OpalError::NotFound(s1), OpalError::NotFound(s2)) => s1 == s2,
            (OpalError::Unavailable(s1), OpalError::Unavailable(s2)) => s1 == s2,
            (OpalError::InvalidState(s1), OpalError::InvalidState(s2)) => s1 == s2,
            (OpalError::JoinFailed(s1), OpalError::JoinFailed(s2)) => s1 == s2,
            (OpalError::Internal(s1), OpalError::Internal(s2)) => s1 == s2,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for OpalError {
    fn from(e: std::io::Error) -> Self {
        OpalError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for OpalError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            OpalError::Timeout(e.to_string())
        } else if e.is_connect() {
            OpalError::Transient {
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
                reason: e.to_string(),
            }
        } else {
            OpalError::HttpClientError(e.to_string())
        }
    }
}

impl From<serde_json::Error> for OpalError {
    fn from(e: serde_json::Error) -> Self {
        OpalError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<toml::de::Error> for OpalError {
    fn from(e: toml::de::Error) -> Self {
        OpalError::InvalidRequest(format!("TOML parse error: {e}"))
    }
}

impl From<url::ParseError> for OpalError {
    fn from(e: url::ParseError) -> Self {
        OpalError::InvalidRequest(format!("bad URL: {e}"))
    }
}
