// src/core/meta/cluconf.rs

//! The replicated cluster-wide configuration revision.
//!
//! Distinct from the node-local file configuration (`crate::config`): this
//! one is owned by the primary, versioned, and metasynced like any other
//! revision.

use super::{Rev, RevKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_startup() -> Duration {
    Duration::from_secs(60)
}
fn default_cplane() -> Duration {
    Duration::from_secs(2)
}
fn default_max_keepalive() -> Duration {
    Duration::from_secs(4)
}
fn default_max_host_busy() -> Duration {
    Duration::from_secs(20)
}
fn default_keepalive_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_keepalive_retries() -> u32 {
    3
}
fn default_ic_count() -> usize {
    3
}
fn default_rebalance_enabled() -> bool {
    true
}

/// Proxy-related cluster settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConf {
    /// Where an initial deployment expects the primary to listen.
    #[serde(default)]
    pub primary_url: String,
    /// Optional well-known endpoint tried during rediscovery.
    #[serde(default)]
    pub discovery_url: String,
}

/// Control-plane timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConf {
    /// Governs the full startup/registration window.
    #[serde(with = "humantime_serde", default = "default_startup")]
    pub startup: Duration,
    /// Governs a single-hop control-plane operation.
    #[serde(with = "humantime_serde", default = "default_cplane")]
    pub cplane_operation: Duration,
    /// Upper bound on keepalive silence before a peer is suspect.
    #[serde(with = "humantime_serde", default = "default_max_keepalive")]
    pub max_keepalive: Duration,
    /// Upper bound on a busy peer answering a long control operation.
    #[serde(with = "humantime_serde", default = "default_max_host_busy")]
    pub max_host_busy: Duration,
}

impl Default for TimeoutConf {
    fn default() -> Self {
        TimeoutConf {
            startup: default_startup(),
            cplane_operation: default_cplane(),
            max_keepalive: default_max_keepalive(),
            max_host_busy: default_max_host_busy(),
        }
    }
}

/// Heartbeat cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConf {
    #[serde(with = "humantime_serde", default = "default_keepalive_interval")]
    pub interval: Duration,
    /// Consecutive missed heartbeats before a peer is declared unreachable.
    #[serde(default = "default_keepalive_retries")]
    pub retries: u32,
}

impl Default for KeepaliveConf {
    fn default() -> Self {
        KeepaliveConf {
            interval: default_keepalive_interval(),
            retries: default_keepalive_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConf {
    #[serde(default = "default_rebalance_enabled")]
    pub enabled: bool,
}

impl Default for RebalanceConf {
    fn default() -> Self {
        RebalanceConf {
            enabled: default_rebalance_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcConf {
    /// Target size of the information-center set. The IC shrinks when fewer
    /// electable proxies exist.
    #[serde(default = "default_ic_count")]
    pub count: usize,
}

impl Default for IcConf {
    fn default() -> Self {
        IcConf {
            count: default_ic_count(),
        }
    }
}

/// The versioned, replicated cluster configuration. `uuid` equals the
/// cluster map UUID once the cluster is initialized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub proxy: ProxyConf,
    #[serde(default)]
    pub timeout: TimeoutConf,
    #[serde(default)]
    pub keepalive: KeepaliveConf,
    #[serde(default)]
    pub rebalance: RebalanceConf,
    #[serde(default)]
    pub ic: IcConf,
    /// Feature flags, forward-compatible bit set.
    #[serde(default)]
    pub features: u64,
}

impl Rev for ClusterConfig {
    const KIND: RevKind = RevKind::Config;

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl ClusterConfig {
    pub fn is_empty(&self) -> bool {
        self.version == 0
    }
}
