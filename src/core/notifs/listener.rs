// src/core/notifs/listener.rs

//! A single tracked long-running operation and its per-notifier progress.

use crate::core::OpalError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// The kinds of long-running operations the IC tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifKind {
    Rebalance,
    Resilver,
    CopyBucket,
    ListObjects,
}

impl NotifKind {
    /// How long a finished listener stays queryable before pruning. Listing
    /// results go stale quickly and get a shorter retention.
    pub fn fin_ttl(&self) -> Duration {
        match self {
            NotifKind::ListObjects => Duration::from_secs(2 * 60),
            _ => Duration::from_secs(10 * 60),
        }
    }

    /// Whether a notifier silently disappearing from the cluster map is
    /// expected for this kind (membership change is what triggers it).
    pub fn tolerates_lost_notifier(&self) -> bool {
        matches!(self, NotifKind::Rebalance | NotifKind::Resilver)
    }
}

impl std::fmt::Display for NotifKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifKind::Rebalance => write!(f, "rebalance"),
            NotifKind::Resilver => write!(f, "resilver"),
            NotifKind::CopyBucket => write!(f, "copy-bucket"),
            NotifKind::ListObjects => write!(f, "list-objects"),
        }
    }
}

/// IC-side bookkeeping for one cluster-wide operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifListener {
    pub uuid: String,
    pub kind: NotifKind,
    #[serde(default)]
    pub buckets: Vec<String>,
    /// Nodes expected to report completion.
    pub notifiers: BTreeSet<String>,
    /// Nodes that have reported completion; always a subset of `notifiers`.
    #[serde(default)]
    pub finished: BTreeSet<String>,
    /// Milliseconds since the epoch.
    pub added_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    /// Latest per-notifier stats payload, opaque to the IC.
    #[serde(default)]
    pub stats: BTreeMap<String, serde_json::Value>,
    /// Last progress timestamp per notifier (ms since epoch).
    #[serde(default)]
    pub progress_ts: BTreeMap<String, u64>,
    #[serde(default)]
    pub aborted: bool,
    #[serde(default)]
    pub errs: Vec<String>,
}

impl NotifListener {
    pub fn new(uuid: &str, kind: NotifKind, notifiers: BTreeSet<String>, now: u64) -> Self {
        NotifListener {
            uuid: uuid.to_string(),
            kind,
            buckets: Vec::new(),
            notifiers,
            finished: BTreeSet::new(),
            added_at: now,
            end_time: None,
            stats: BTreeMap::new(),
            progress_ts: BTreeMap::new(),
            aborted: false,
            errs: Vec::new(),
        }
    }

    /// Done means every notifier reported in, or the operation was aborted.
    pub fn is_done(&self) -> bool {
        self.aborted || (!self.notifiers.is_empty() && self.finished == self.notifiers)
    }

    pub fn record_progress(&mut self, node_id: &str, stats: serde_json::Value, now: u64) {
        self.stats.insert(node_id.to_string(), stats);
        self.progress_ts.insert(node_id.to_string(), now);
    }

    /// Marks `node_id` finished. A duplicate report is a caller error.
    pub fn mark_finished(
        &mut self,
        node_id: &str,
        err: Option<String>,
        now: u64,
    ) -> Result<(), OpalError> {
        if !self.notifiers.contains(node_id) {
            return Err(OpalError::NodeNotFound(format!(
                "{node_id} is not a notifier of {}",
                self.uuid
            )));
        }
        if !self.finished.insert(node_id.to_string()) {
            return Err(OpalError::InvalidRequest(format!(
                "duplicate finished notification from {node_id} for {}",
                self.uuid
            )));
        }
        self.progress_ts.insert(node_id.to_string(), now);
        if let Some(e) = err {
            self.errs.push(format!("{node_id}: {e}"));
        }
        Ok(())
    }

    pub fn abort(&mut self, reason: &str, now: u64) {
        self.aborted = true;
        self.errs.push(reason.to_string());
        self.end_time = Some(now);
    }

    /// Notifiers whose last progress report is older than `interval_ms`.
    pub fn stale_notifiers(&self, now: u64, interval_ms: u64) -> Vec<String> {
        self.notifiers
            .iter()
            .filter(|n| !self.finished.contains(*n))
            .filter(|n| {
                let last = self.progress_ts.get(*n).copied().unwrap_or(self.added_at);
                now.saturating_sub(last) > interval_ms
            })
            .cloned()
            .collect()
    }
}
