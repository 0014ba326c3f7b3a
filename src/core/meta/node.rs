// src/core/meta/node.rs

//! Node descriptors: identity, network endpoints, and lifecycle flags.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// The role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A stateless gateway that routes and coordinates.
    Proxy,
    /// A stateful data holder.
    Target,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Proxy => write!(f, "proxy"),
            NodeKind::Target => write!(f, "target"),
        }
    }
}

bitflags! {
    /// Lifecycle and capability flags carried by every node descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct SnodeFlags: u16 {
        const MAINTENANCE  = 1 << 0; // Drained; excluded from new writes.
        const DECOMMISSION = 1 << 1; // Being permanently removed.
        const SHUTDOWN     = 1 << 2; // Stopped but still a member; restartable.
        const NON_ELECTABLE = 1 << 3; // Proxy that may never become primary.
        const IC_MEMBER    = 1 << 4; // Proxy co-owning the notification tables.
    }
}

/// A single node's descriptor as carried in the cluster map. Gossiped,
/// persisted, and compared by `id` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snode {
    pub id: String,
    pub kind: NodeKind,
    /// URL clients talk to.
    pub public_url: String,
    /// URL for intra-cluster control traffic (metasync, votes, keepalive).
    pub control_url: String,
    /// URL for intra-cluster data traffic (rebalance, GFN).
    pub data_url: String,
    #[serde(default)]
    pub flags_raw: u16,
}

impl Snode {
    pub fn flags(&self) -> SnodeFlags {
        SnodeFlags::from_bits_truncate(self.flags_raw)
    }

    pub fn set_flags(&mut self, flags: SnodeFlags) {
        self.flags_raw = flags.bits();
    }

    pub fn is_proxy(&self) -> bool {
        self.kind == NodeKind::Proxy
    }

    pub fn is_target(&self) -> bool {
        self.kind == NodeKind::Target
    }

    pub fn in_maintenance(&self) -> bool {
        self.flags().contains(SnodeFlags::MAINTENANCE)
    }

    /// True when the node is being drained or removed and must be excluded
    /// from placement, IC staffing, and elections.
    pub fn in_maint_or_decomm(&self) -> bool {
        self.flags()
            .intersects(SnodeFlags::MAINTENANCE | SnodeFlags::DECOMMISSION | SnodeFlags::SHUTDOWN)
    }

    pub fn is_ic_member(&self) -> bool {
        self.flags().contains(SnodeFlags::IC_MEMBER)
    }

    /// A proxy that may be staffed into the IC or elected primary.
    pub fn is_electable(&self) -> bool {
        self.is_proxy() && !self.flags().contains(SnodeFlags::NON_ELECTABLE) && !self.in_maint_or_decomm()
    }

    /// Returns true when `other` shares any URL with `self` on the same network.
    /// Two distinct nodes must never collide on an endpoint.
    pub fn url_conflict(&self, other: &Snode) -> bool {
        self.public_url == other.public_url
            || self.control_url == other.control_url
            || self.data_url == other.data_url
    }
}

// Node equality is identity equality. URLs and flags may legitimately change
// across restarts of the same node.
impl PartialEq for Snode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Snode {}

impl std::fmt::Display for Snode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.kind, self.id)
    }
}
