// src/core/meta/clumeta.rs

//! The `CluMeta` bundle exchanged during joins and discovery: all four
//! revisions plus in-flight flags.

use super::{Bmd, ClusterConfig, Rmd, Smap, Snode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CluMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smap: Option<Smap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmd: Option<Bmd>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rmd: Option<Rmd>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ClusterConfig>,
    /// Set while the sender participates in a primary election; any metadata
    /// carried alongside must not be adopted.
    #[serde(default)]
    pub vote_in_progress: bool,
}

impl CluMeta {
    pub fn smap_version(&self) -> u64 {
        self.smap.as_ref().map(|s| s.version).unwrap_or(0)
    }
}

/// The body of a join request: the joiner's descriptor plus whatever
/// metadata it holds. Collected into the regpool during the primary's
/// registration window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinReq {
    pub node: Snode,
    #[serde(default)]
    pub meta: CluMeta,
    /// Set when the joiner found a restart marker and expects the primary to
    /// resume an interrupted rebalance.
    #[serde(default)]
    pub rebalance_interrupted: bool,
}
