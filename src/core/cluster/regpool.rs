// src/core/cluster/regpool.rs

//! The regpool: a transient buffer of join requests collected while a
//! primary candidate holds its registration window open.

use crate::core::OpalError;
use crate::core::meta::{CluMeta, JoinReq, NodeKind, Rev};
use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct RegPool {
    entries: RwLock<Vec<JoinReq>>,
}

impl RegPool {
    pub fn new() -> Self {
        RegPool::default()
    }

    /// Adds or replaces a join request; a re-join from the same node id
    /// supersedes its earlier entry.
    pub fn add(&self, req: JoinReq) {
        let mut entries = self.entries.write();
        if let Some(slot) = entries.iter_mut().find(|e| e.node.id == req.node.id) {
            *slot = req;
        } else {
            entries.push(req);
        }
    }

    pub fn snapshot(&self) -> Vec<JoinReq> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn count_targets(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| e.node.kind == NodeKind::Target)
            .count()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

/// The outcome of merging the regpool into the candidate's own metadata.
#[derive(Debug, Default)]
pub struct MergedMeta {
    pub meta: CluMeta,
    /// Any joiner reported an election in flight; the pre-merge cluster map
    /// must be kept so the vote is not interfered with.
    pub vote_in_progress: bool,
    /// Any joiner asked for an interrupted rebalance to be resumed.
    pub rebalance_interrupted: bool,
}

/// Folds the collected join requests into a single max-version `CluMeta`.
///
/// For each revision kind independently: take the highest version whose UUID
/// agrees with what has been seen so far; two different non-empty UUIDs for
/// the same kind are a split brain and fatal.
pub fn merge(pool: &[JoinReq], base: CluMeta) -> Result<MergedMeta, OpalError> {
    let mut out = MergedMeta {
        meta: base,
        ..Default::default()
    };

    for req in pool {
        out.vote_in_progress |= req.meta.vote_in_progress;
        out.rebalance_interrupted |= req.rebalance_interrupted;

        if let Some(smap) = &req.meta.smap {
            merge_rev(&mut out.meta.smap, smap, &req.node.id)?;
        }
        if let Some(bmd) = &req.meta.bmd {
            merge_rev(&mut out.meta.bmd, bmd, &req.node.id)?;
        }
        if let Some(rmd) = &req.meta.rmd {
            merge_rev(&mut out.meta.rmd, rmd, &req.node.id)?;
        }
        if let Some(config) = &req.meta.config {
            merge_rev(&mut out.meta.config, config, &req.node.id)?;
        }
    }
    Ok(out)
}

fn merge_rev<T: Rev>(slot: &mut Option<T>, incoming: &T, from: &str) -> Result<(), OpalError> {
    match slot {
        None => {
            *slot = Some(incoming.clone());
            Ok(())
        }
        Some(cur) => {
            if !cur.uuid().is_empty()
                && !incoming.uuid().is_empty()
                && cur.uuid() != incoming.uuid()
            {
                return Err(OpalError::ClusterIntegrity(format!(
                    "{} UUID conflict while merging join requests: {} vs {} (from node {})",
                    T::KIND,
                    cur.uuid(),
                    incoming.uuid(),
                    from
                )));
            }
            if incoming.version() > cur.version()
                || (incoming.version() == cur.version() && cur.uuid().is_empty())
            {
                *slot = Some(incoming.clone());
            }
            Ok(())
        }
    }
}
