use opalstore::core::cluster::maintenance::{DecommissionOpts, lifecycle_phase};
use opalstore::core::meta::{ClusterConfig, NodeKind, Snode, SnodeFlags};
use std::time::Duration;

fn node(flags: SnodeFlags) -> Snode {
    Snode {
        id: "t1".to_string(),
        kind: NodeKind::Target,
        public_url: "http://127.0.0.1:9090".to_string(),
        control_url: "http://127.0.0.1:9090".to_string(),
        data_url: "http://127.0.0.1:9090".to_string(),
        flags_raw: flags.bits(),
    }
}

#[tokio::test]
async fn test_lifecycle_phases() {
    assert_eq!(lifecycle_phase(SnodeFlags::empty()), "active");
    assert_eq!(lifecycle_phase(SnodeFlags::MAINTENANCE), "maintenance");
    assert_eq!(lifecycle_phase(SnodeFlags::SHUTDOWN), "shutdown");
    assert_eq!(lifecycle_phase(SnodeFlags::DECOMMISSION), "decommissioning");
    // Decommission outranks maintenance when both are set.
    assert_eq!(
        lifecycle_phase(SnodeFlags::MAINTENANCE | SnodeFlags::DECOMMISSION),
        "decommissioning"
    );
}

#[tokio::test]
async fn test_flag_helpers_drive_eligibility() {
    let active = node(SnodeFlags::empty());
    assert!(!active.in_maint_or_decomm());

    for flags in [
        SnodeFlags::MAINTENANCE,
        SnodeFlags::DECOMMISSION,
        SnodeFlags::SHUTDOWN,
    ] {
        let n = node(flags);
        assert!(n.in_maint_or_decomm(), "{flags:?} must drain the node");
        assert!(!n.is_electable());
    }
}

#[tokio::test]
async fn test_decommission_opts_defaults() {
    let opts: DecommissionOpts = serde_json::from_str("{}").unwrap();
    assert!(!opts.no_shutdown);
    assert!(!opts.rm_user_data);

    let opts: DecommissionOpts =
        serde_json::from_str(r#"{"no_shutdown":true,"rm_user_data":true}"#).unwrap();
    assert!(opts.no_shutdown);
    assert!(opts.rm_user_data);
}

#[tokio::test]
async fn test_cluster_config_rev_serde() {
    let mut conf = ClusterConfig::default();
    conf.uuid = "u".to_string();
    conf.version = 2;
    conf.proxy.primary_url = "http://10.0.0.1:8080".to_string();
    conf.rebalance.enabled = false;

    let wire = serde_json::to_string(&conf).unwrap();
    let back: ClusterConfig = serde_json::from_str(&wire).unwrap();
    assert_eq!(back.uuid, "u");
    assert_eq!(back.version, 2);
    assert_eq!(back.proxy.primary_url, "http://10.0.0.1:8080");
    assert!(!back.rebalance.enabled);
    // Durations survive the humantime encoding.
    assert_eq!(back.timeout.cplane_operation, Duration::from_secs(2));
    assert_eq!(back.keepalive.interval, Duration::from_secs(1));
}
