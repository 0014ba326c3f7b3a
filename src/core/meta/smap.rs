// src/core/meta/smap.rs

//! The cluster map: versioned membership plus the primary designation.

use super::node::{NodeKind, Snode, SnodeFlags};
use super::{Rev, RevKind};
use crate::core::OpalError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The versioned membership table. Produced only on the primary (or adopted
/// from peers during discovery), then replicated to every node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Smap {
    #[serde(default)]
    pub uuid: String,
    pub version: u64,
    pub primary_id: String,
    pub proxies: HashMap<String, Snode>,
    pub targets: HashMap<String, Snode>,
    #[serde(default)]
    pub creation_time: String,
}

impl Rev for Smap {
    const KIND: RevKind = RevKind::Smap;

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Smap {
    /// A self-only map installed by a primary candidate at startup.
    pub fn with_primary(node: Snode) -> Self {
        let mut proxies = HashMap::new();
        let primary_id = node.id.clone();
        proxies.insert(node.id.clone(), node);
        Smap {
            uuid: String::new(),
            version: 0,
            primary_id,
            proxies,
            targets: HashMap::new(),
            creation_time: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.version == 0 && self.proxies.is_empty() && self.targets.is_empty()
    }

    pub fn get_node(&self, id: &str) -> Option<&Snode> {
        self.proxies.get(id).or_else(|| self.targets.get(id))
    }

    pub fn get_node_mut(&mut self, id: &str) -> Option<&mut Snode> {
        if self.proxies.contains_key(id) {
            self.proxies.get_mut(id)
        } else {
            self.targets.get_mut(id)
        }
    }

    pub fn primary(&self) -> Option<&Snode> {
        self.proxies.get(&self.primary_id)
    }

    pub fn is_primary(&self, id: &str) -> bool {
        self.primary_id == id
    }

    /// Nodes counted as present and serving (not drained, stopped, or leaving).
    pub fn count_active_proxies(&self) -> usize {
        self.proxies.values().filter(|p| !p.in_maint_or_decomm()).count()
    }

    pub fn count_active_targets(&self) -> usize {
        self.targets.values().filter(|t| !t.in_maint_or_decomm()).count()
    }

    pub fn ic_members(&self) -> Vec<&Snode> {
        self.proxies.values().filter(|p| p.is_ic_member()).collect()
    }

    /// Every node except `self_id`, targets first. Control-plane broadcasts
    /// walk this order so target responses arbitrate UUID conflicts early.
    pub fn peers_of(&self, self_id: &str) -> Vec<Snode> {
        let mut out: Vec<Snode> = self
            .targets
            .values()
            .filter(|n| n.id != self_id)
            .cloned()
            .collect();
        out.extend(self.proxies.values().filter(|n| n.id != self_id).cloned());
        out
    }

    /// Inserts or replaces a node, checking the endpoint-uniqueness invariant.
    /// Returns whether the membership actually changed.
    pub fn put_node(&mut self, node: Snode) -> Result<bool, OpalError> {
        for existing in self.proxies.values().chain(self.targets.values()) {
            if existing.id != node.id && existing.url_conflict(&node) {
                return Err(OpalError::ClusterIntegrity(format!(
                    "node {} and node {} share a network endpoint",
                    existing.id, node.id
                )));
            }
        }
        let table = match node.kind {
            NodeKind::Proxy => &mut self.proxies,
            NodeKind::Target => &mut self.targets,
        };
        let changed = match table.get(&node.id) {
            Some(prev) => {
                prev.flags_raw != node.flags_raw
                    || prev.public_url != node.public_url
                    || prev.control_url != node.control_url
                    || prev.data_url != node.data_url
            }
            None => true,
        };
        table.insert(node.id.clone(), node);
        Ok(changed)
    }

    pub fn remove_node(&mut self, id: &str) -> Option<Snode> {
        self.proxies.remove(id).or_else(|| self.targets.remove(id))
    }

    /// Structural sanity. A map that fails validation is not *reliable* and
    /// must not drive bootstrap decisions.
    pub fn validate(&self) -> Result<(), OpalError> {
        if self.version == 0 {
            return Err(OpalError::InvalidState("cluster map version is zero".into()));
        }
        if self.primary_id.is_empty() {
            return Err(OpalError::InvalidState("cluster map has no primary".into()));
        }
        if !self.proxies.contains_key(&self.primary_id) {
            return Err(OpalError::InvalidState(format!(
                "primary {} is not among the proxies",
                self.primary_id
            )));
        }
        for (id, n) in self.proxies.iter().chain(self.targets.iter()) {
            if *id != n.id {
                return Err(OpalError::InvalidState(format!(
                    "map key {} does not match node id {}",
                    id, n.id
                )));
            }
        }
        Ok(())
    }

    /// Compares this map against an incoming one of the same cluster.
    /// A non-empty UUID mismatch is a split brain and therefore fatal.
    pub fn check_uuid(&self, other: &Smap) -> Result<(), OpalError> {
        if !self.uuid.is_empty() && !other.uuid.is_empty() && self.uuid != other.uuid {
            return Err(OpalError::ClusterIntegrity(format!(
                "cluster map UUID split: local {} vs incoming {}",
                self.uuid, other.uuid
            )));
        }
        Ok(())
    }

    /// Grows or shrinks the IC to `count` members, preferring currently
    /// seated members, then electable proxies. Returns true when membership
    /// changed.
    pub fn staff_ic(&mut self, count: usize) -> bool {
        let mut seated: Vec<String> = Vec::new();
        let mut bench: Vec<String> = Vec::new();
        let mut ids: Vec<&String> = self.proxies.keys().collect();
        ids.sort(); // deterministic staffing across primaries
        for id in ids {
            let p = &self.proxies[id];
            if !p.is_electable() {
                continue;
            }
            if p.is_ic_member() {
                seated.push(id.clone());
            } else {
                bench.push(id.clone());
            }
        }
        let mut changed = false;
        while seated.len() > count {
            let id = seated.pop().unwrap();
            let p = self.proxies.get_mut(&id).unwrap();
            let mut f = p.flags();
            f.remove(SnodeFlags::IC_MEMBER);
            p.set_flags(f);
            changed = true;
        }
        while seated.len() < count {
            let Some(id) = bench.pop() else { break };
            let p = self.proxies.get_mut(&id).unwrap();
            let mut f = p.flags();
            f.insert(SnodeFlags::IC_MEMBER);
            p.set_flags(f);
            seated.push(id);
            changed = true;
        }
        // Strip the flag from any non-electable stragglers (e.g. a member
        // that just entered maintenance).
        let stale: Vec<String> = self
            .proxies
            .values()
            .filter(|p| p.is_ic_member() && !p.is_electable())
            .map(|p| p.id.clone())
            .collect();
        for id in stale {
            let p = self.proxies.get_mut(&id).unwrap();
            let mut f = p.flags();
            f.remove(SnodeFlags::IC_MEMBER);
            p.set_flags(f);
            changed = true;
        }
        changed
    }

    pub fn string_ex(&self) -> String {
        format!(
            "Smap v{}[{}, primary={}, p={}, t={}]",
            self.version,
            self.uuid,
            self.primary_id,
            self.proxies.len(),
            self.targets.len()
        )
    }
}
