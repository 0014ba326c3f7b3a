// src/core/notifs/mod.rs

//! IC-side bookkeeping of long-running cluster operations.
//!
//! Senders are asynchronous and fire-and-forget: a progress or completion
//! report for an unknown operation is silently tolerated. Completion of a
//! listener is observed exactly once — the move from the `running` to the
//! `finished` table emits a single event on the notification bus.
//!
//! Lock order: `running` before `finished`, always.

pub mod housekeeper;
pub mod listener;

pub use listener::{NotifKind, NotifListener};

use crate::core::OpalError;
use crate::core::meta::Smap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Helper to get the current system time in milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The wire form of a notifier→IC report, POSTed to
/// `/v1/notifs/{progress|finished}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifMsg {
    pub uuid: String,
    pub kind: NotifKind,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
    #[serde(default)]
    pub aborted: bool,
}

/// Emitted once per listener lifecycle, when it transitions to `finished`.
#[derive(Debug, Clone)]
pub struct NotifEvent {
    pub uuid: String,
    pub kind: NotifKind,
    pub aborted: bool,
    pub errs: Vec<String>,
}

/// A kind-tagged envelope used when the whole table is shipped to a proxy
/// newly promoted into the IC. Receivers dispatch on `kind` to rebuild the
/// listener from the opaque payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct NotifEnvelope {
    pub kind: NotifKind,
    pub payload: serde_json::Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NotifDump {
    pub running: Vec<NotifEnvelope>,
    pub finished: Vec<NotifEnvelope>,
}

#[derive(Debug)]
pub struct NotifTables {
    running: RwLock<HashMap<String, NotifListener>>,
    fin: RwLock<HashMap<String, NotifListener>>,
    event_tx: mpsc::UnboundedSender<NotifEvent>,
}

impl NotifTables {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotifEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            NotifTables {
                running: RwLock::new(HashMap::new()),
                fin: RwLock::new(HashMap::new()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn running_count(&self) -> usize {
        self.running.read().len()
    }

    pub fn finished_count(&self) -> usize {
        self.fin.read().len()
    }

    /// Registers a new listener. Re-registering a known UUID is an error.
    pub fn add(&self, nl: NotifListener) -> Result<(), OpalError> {
        let mut running = self.running.write();
        if running.contains_key(&nl.uuid) || self.fin.read().contains_key(&nl.uuid) {
            return Err(OpalError::InvalidRequest(format!(
                "operation {} is already tracked",
                nl.uuid
            )));
        }
        info!("tracking {} operation {}", nl.kind, nl.uuid);
        running.insert(nl.uuid.clone(), nl);
        Ok(())
    }

    /// Looks the listener up in either table.
    pub fn get(&self, uuid: &str) -> Option<NotifListener> {
        if let Some(nl) = self.running.read().get(uuid) {
            return Some(nl.clone());
        }
        self.fin.read().get(uuid).cloned()
    }

    /// Applies a progress report. Unknown UUIDs are benign — the sender is
    /// asynchronous and may be ahead of or behind this IC member.
    pub fn handle_progress(&self, uuid: &str, node_id: &str, stats: serde_json::Value) {
        let mut running = self.running.write();
        match running.get_mut(uuid) {
            Some(nl) => nl.record_progress(node_id, stats, now_ms()),
            None => debug!("progress for unknown operation {uuid} from {node_id}, ignoring"),
        }
    }

    /// Applies a completion report. Returns whether the listener transitioned
    /// to the finished table as a result.
    pub fn handle_finished(
        &self,
        uuid: &str,
        node_id: &str,
        err: Option<String>,
        abort: bool,
    ) -> Result<bool, OpalError> {
        let now = now_ms();
        let mut running = self.running.write();
        let Some(nl) = running.get_mut(uuid) else {
            debug!("finished for unknown operation {uuid} from {node_id}, ignoring");
            return Ok(false);
        };
        if abort {
            nl.abort(&format!("aborted by {node_id}"), now);
        } else {
            nl.mark_finished(node_id, err, now)?;
        }
        if nl.is_done() {
            let mut nl = running.remove(uuid).unwrap();
            drop(running);
            nl.end_time.get_or_insert(now);
            self.move_to_fin(nl);
            return Ok(true);
        }
        Ok(false)
    }

    /// Aborts a running listener outright (administrative abort or lost
    /// notifier).
    pub fn abort(&self, uuid: &str, reason: &str) -> Result<NotifListener, OpalError> {
        let mut running = self.running.write();
        let Some(mut nl) = running.remove(uuid) else {
            return Err(OpalError::NotFound(format!("operation {uuid}")));
        };
        drop(running);
        nl.abort(reason, now_ms());
        let copy = nl.clone();
        self.move_to_fin(nl);
        Ok(copy)
    }

    // The single transition point into the finished table; fires the
    // completion event exactly once per listener.
    fn move_to_fin(&self, nl: NotifListener) {
        info!(
            "operation {} ({}) finished, aborted={}, errs={}",
            nl.uuid,
            nl.kind,
            nl.aborted,
            nl.errs.len()
        );
        let event = NotifEvent {
            uuid: nl.uuid.clone(),
            kind: nl.kind,
            aborted: nl.aborted,
            errs: nl.errs.clone(),
        };
        self.fin.write().insert(nl.uuid.clone(), nl);
        let _ = self.event_tx.send(event);
    }

    /// Reacts to a membership change: a running listener whose notifier left
    /// the map is aborted with a node-not-found error, unless the kind
    /// tolerates the loss (rebalance caused the change in the first place).
    pub fn handle_smap_change(&self, smap: &Smap) -> Vec<String> {
        let mut lost: Vec<(String, String)> = Vec::new();
        {
            let running = self.running.read();
            for nl in running.values() {
                for n in &nl.notifiers {
                    if smap.get_node(n).is_none() && !nl.finished.contains(n) {
                        lost.push((nl.uuid.clone(), n.clone()));
                    }
                }
            }
        }
        let mut aborted = Vec::new();
        for (uuid, node_id) in lost {
            let tolerate = {
                let running = self.running.read();
                running
                    .get(&uuid)
                    .map(|nl| nl.kind.tolerates_lost_notifier())
                    .unwrap_or(true)
            };
            if tolerate {
                warn!("notifier {node_id} of {uuid} left the cluster map, tolerating");
                continue;
            }
            if self
                .abort(&uuid, &format!("node {node_id} not found in the cluster map"))
                .is_ok()
            {
                aborted.push(uuid);
            }
        }
        aborted
    }

    /// Running listeners with notifiers whose progress is older than
    /// `interval_ms`, for the housekeeper to probe.
    pub fn stale_running(&self, interval_ms: u64) -> Vec<(String, Vec<String>)> {
        let now = now_ms();
        self.running
            .read()
            .values()
            .filter_map(|nl| {
                let stale = nl.stale_notifiers(now, interval_ms);
                if stale.is_empty() {
                    None
                } else {
                    Some((nl.uuid.clone(), stale))
                }
            })
            .collect()
    }

    /// A probe against `node_id` for `uuid` came back 404 and the notifier's
    /// silence exceeds the progress interval: the operation is not running
    /// there. Mark it finished with an error.
    pub fn mark_lost(&self, uuid: &str, node_id: &str) {
        let _ = self.handle_finished(
            uuid,
            node_id,
            Some("operation not found on notifier".into()),
            false,
        );
    }

    /// Prunes finished listeners past their per-kind retention.
    pub fn prune_fin(&self) {
        let now = now_ms();
        self.fin.write().retain(|uuid, nl| {
            let cutoff = nl.kind.fin_ttl().as_millis() as u64;
            let end = nl.end_time.unwrap_or(nl.added_at);
            let keep = now.saturating_sub(end) < cutoff;
            if !keep {
                debug!("pruning finished operation {uuid}");
            }
            keep
        });
    }

    /// Serializes both tables for shipping to a newly promoted IC member.
    pub fn dump(&self) -> Result<NotifDump, OpalError> {
        let envelope = |nl: &NotifListener| -> Result<NotifEnvelope, OpalError> {
            Ok(NotifEnvelope {
                kind: nl.kind,
                payload: serde_json::to_value(nl)?,
            })
        };
        let running = self
            .running
            .read()
            .values()
            .map(envelope)
            .collect::<Result<Vec<_>, _>>()?;
        let finished = self
            .fin
            .read()
            .values()
            .map(envelope)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(NotifDump { running, finished })
    }

    /// Merges a shipped table dump into the local tables. Listeners already
    /// known locally are kept — the local copy may be further along.
    pub fn absorb(&self, dump: NotifDump) -> Result<(), OpalError> {
        for env in dump.running {
            let nl = decode_envelope(env)?;
            self.running.write().entry(nl.uuid.clone()).or_insert(nl);
        }
        for env in dump.finished {
            let nl = decode_envelope(env)?;
            // A listener the dump says is finished must not linger as running.
            self.running.write().remove(&nl.uuid);
            self.fin.write().entry(nl.uuid.clone()).or_insert(nl);
        }
        Ok(())
    }
}

// Kind-keyed constructor dispatch. All kinds currently share one listener
// shape; the envelope keeps the wire format stable if that changes.
fn decode_envelope(env: NotifEnvelope) -> Result<NotifListener, OpalError> {
    match env.kind {
        NotifKind::Rebalance
        | NotifKind::Resilver
        | NotifKind::CopyBucket
        | NotifKind::ListObjects => Ok(serde_json::from_value(env.payload)?),
    }
}
