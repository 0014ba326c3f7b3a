// src/core/hrw.rs

//! Highest-random-weight (rendezvous) selection.
//!
//! Elections and task placement require every node to independently compute
//! the same ranking, so the weight function must be bit-reproducible: the
//! 64-bit low half of murmur3 x64-128 over `id ⧺ salt` with seed zero.

use crate::core::meta::{Smap, Snode};
use std::io::Cursor;

/// Deterministic weight of a node for a given salt.
pub fn node_weight(id: &str, salt: &str) -> u64 {
    let mut buf = Vec::with_capacity(id.len() + salt.len());
    buf.extend_from_slice(id.as_bytes());
    buf.extend_from_slice(salt.as_bytes());
    // Cursor reads cannot fail.
    let h = murmur3::murmur3_x64_128(&mut Cursor::new(buf), 0).unwrap_or_default();
    h as u64
}

/// Electable proxies ranked by descending weight. Excludes the node named by
/// `skip_id` (typically the primary being replaced).
pub fn rank_electable<'a>(smap: &'a Smap, skip_id: &str) -> Vec<&'a Snode> {
    let salt = if smap.uuid.is_empty() {
        smap.primary_id.as_str()
    } else {
        smap.uuid.as_str()
    };
    let mut ranked: Vec<&Snode> = smap
        .proxies
        .values()
        .filter(|p| p.id != skip_id && p.is_electable())
        .collect();
    ranked.sort_by(|a, b| {
        node_weight(&b.id, salt)
            .cmp(&node_weight(&a.id, salt))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

/// The proxy every node agrees should succeed the current primary.
pub fn next_primary(smap: &Smap) -> Option<&Snode> {
    rank_electable(smap, &smap.primary_id).into_iter().next()
}

/// The target every node agrees should own a cluster-wide task for `salt`.
pub fn select_target<'a>(smap: &'a Smap, salt: &str) -> Option<&'a Snode> {
    smap.targets
        .values()
        .filter(|t| !t.in_maint_or_decomm())
        .max_by(|a, b| {
            node_weight(&a.id, salt)
                .cmp(&node_weight(&b.id, salt))
                .then_with(|| b.id.cmp(&a.id))
        })
}
