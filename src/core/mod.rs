// src/core/mod.rs

//! The central module containing the control-plane logic and data structures.

pub mod cluster;
pub mod errors;
pub mod hrw;
pub mod ic;
pub mod meta;
pub mod metasync;
pub mod metrics;
pub mod notifs;
pub mod state;

pub use errors::OpalError;
pub use state::NodeContext;

/// Control-request headers carried on every intra-cluster call. Receivers
/// use the caller's map version to detect stale peers.
pub const HDR_CALLER_ID: &str = "x-opal-caller-id";
pub const HDR_CALLER_NAME: &str = "x-opal-caller-name";
pub const HDR_CALLER_SMAP_VERSION: &str = "x-opal-caller-smap-version";

/// Cluster-info piggyback headers on health responses.
pub const HDR_SMAP_VERSION: &str = "x-opal-smap-version";
pub const HDR_SMAP_UUID: &str = "x-opal-smap-uuid";
pub const HDR_BMD_VERSION: &str = "x-opal-bmd-version";
pub const HDR_VOTE_IN_PROGRESS: &str = "x-opal-vote-in-progress";
