// src/core/meta/rmd.rs

//! The rebalance map: a versioned trigger for global data movement.
//!
//! A version bump is the signal; the data-movement engine itself lives
//! outside the control plane.

use super::{Rev, RevKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rmd {
    #[serde(default)]
    pub uuid: String,
    pub version: u64,
    /// Targets participating in the rebalance this version triggered.
    pub target_ids: Vec<String>,
    /// Set when the bump also requests a local resilver on one target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resilver_id: Option<String>,
    /// A previous rebalance did not run to completion; resume on restart.
    #[serde(default)]
    pub interrupted: bool,
}

impl Rev for Rmd {
    const KIND: RevKind = RevKind::Rmd;

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Rmd {
    pub fn is_empty(&self) -> bool {
        self.version == 0
    }

    /// Bumps the version with a fresh participant list, clearing any stale
    /// interruption state. The returned ID names the triggered rebalance.
    pub fn bump(&mut self, target_ids: Vec<String>) -> String {
        self.version += 1;
        self.target_ids = target_ids;
        self.resilver_id = None;
        self.interrupted = false;
        self.rebalance_id()
    }

    /// The globally agreed identifier of the rebalance a given RMD version
    /// triggers. Derived, not stored, so every node computes the same ID.
    pub fn rebalance_id(&self) -> String {
        format!("g{}", self.version)
    }
}
