// src/core/metrics.rs

//! Defines and registers Prometheus metrics for control-plane monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire process lifecycle.

use lazy_static::lazy_static;
use prometheus::{Counter, Gauge, TextEncoder, register_counter, register_gauge};

lazy_static! {
    // --- Gauges ---
    /// The version of the currently adopted cluster map.
    pub static ref SMAP_VERSION: Gauge =
        register_gauge!("opalstore_smap_version", "Version of the adopted cluster map.").unwrap();
    /// The version of the currently adopted bucket map.
    pub static ref BMD_VERSION: Gauge =
        register_gauge!("opalstore_bmd_version", "Version of the adopted bucket map.").unwrap();
    /// Whether this node currently believes it is the primary.
    pub static ref IS_PRIMARY: Gauge =
        register_gauge!("opalstore_is_primary", "1 when this node is the primary, 0 otherwise.").unwrap();
    /// Long-running operations currently tracked by this IC member.
    pub static ref NOTIFS_RUNNING: Gauge =
        register_gauge!("opalstore_notifs_running", "Tracked operations in the running table.").unwrap();

    // --- Counters ---
    /// Join requests accepted (regpool or steady state).
    pub static ref JOINS_TOTAL: Counter =
        register_counter!("opalstore_joins_total", "Total join requests accepted.").unwrap();
    /// Metasync payloads dispatched by this node while primary.
    pub static ref METASYNC_SENT_TOTAL: Counter =
        register_counter!("opalstore_metasync_sent_total", "Metasync payloads dispatched.").unwrap();
    /// Metasync payloads applied by this node.
    pub static ref METASYNC_RECEIVED_TOTAL: Counter =
        register_counter!("opalstore_metasync_received_total", "Metasync payloads applied.").unwrap();
    /// Elections this node has initiated.
    pub static ref ELECTIONS_TOTAL: Counter =
        register_counter!("opalstore_elections_total", "Primary elections initiated.").unwrap();
    /// Keepalive probes that failed.
    pub static ref KEEPALIVE_FAILURES_TOTAL: Counter =
        register_counter!("opalstore_keepalive_failures_total", "Failed keepalive probes.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
