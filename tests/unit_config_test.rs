use opalstore::config::NodeConfig;
use opalstore::core::meta::NodeKind;
use std::io::Write;
use std::time::Duration;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f.flush().unwrap();
    f
}

#[tokio::test]
async fn test_minimal_config_with_defaults() {
    let f = write_config(
        r#"
        [node]
        role = "proxy"

        [net]
        public_url = "http://10.0.0.1:8080"
        "#,
    );
    let cfg = NodeConfig::from_file(f.path().to_str().unwrap()).unwrap();
    assert_eq!(cfg.node.role, NodeKind::Proxy);
    assert_eq!(cfg.log_level, "info");
    // Control and data URLs default to the public one.
    assert_eq!(cfg.net.control_url, "http://10.0.0.1:8080");
    assert_eq!(cfg.net.data_url, "http://10.0.0.1:8080");
    // Cluster seed defaults.
    assert_eq!(cfg.cluster.ic.count, 3);
    assert_eq!(cfg.cluster.keepalive.retries, 3);
    assert_eq!(cfg.cluster.timeout.startup, Duration::from_secs(60));
    assert!(cfg.cluster.rebalance.enabled);
}

#[tokio::test]
async fn test_full_config_overrides() {
    let f = write_config(
        r#"
        log_level = "debug"

        [node]
        id = "p-alpha"
        role = "target"
        data_dir = "/tmp/opal-t1"
        ntargets = 3

        [net]
        public_url = "http://10.0.0.2:8080"
        control_url = "http://10.0.0.2:8081"
        data_url = "http://10.0.0.2:8082"

        [cluster.proxy]
        primary_url = "http://10.0.0.1:8081"

        [cluster.timeout]
        startup = "90s"
        cplane_operation = "3s"
        max_keepalive = "6s"
        max_host_busy = "30s"

        [cluster.keepalive]
        interval = "2s"
        retries = 5

        [cluster.ic]
        count = 5

        [cluster.rebalance]
        enabled = false
        "#,
    );
    let cfg = NodeConfig::from_file(f.path().to_str().unwrap()).unwrap();
    assert_eq!(cfg.node.id, "p-alpha");
    assert_eq!(cfg.node.role, NodeKind::Target);
    assert_eq!(cfg.node.ntargets, 3);
    assert_eq!(cfg.net.control_url, "http://10.0.0.2:8081");
    assert_eq!(cfg.cluster.proxy.primary_url, "http://10.0.0.1:8081");
    assert_eq!(cfg.cluster.timeout.startup, Duration::from_secs(90));
    assert_eq!(cfg.cluster.keepalive.interval, Duration::from_secs(2));
    assert_eq!(cfg.cluster.keepalive.retries, 5);
    assert_eq!(cfg.cluster.ic.count, 5);
    assert!(!cfg.cluster.rebalance.enabled);
    assert_eq!(cfg.log_level, "debug");

    // A pinned ID is carried into the node descriptor verbatim.
    let snode = cfg.snode().unwrap();
    assert_eq!(snode.id, "p-alpha");
    assert_eq!(snode.kind, NodeKind::Target);
}

#[tokio::test]
async fn test_bad_url_rejected() {
    let f = write_config(
        r#"
        [node]
        role = "proxy"

        [net]
        public_url = "not a url"
        "#,
    );
    assert!(NodeConfig::from_file(f.path().to_str().unwrap()).is_err());
}

#[tokio::test]
async fn test_zero_ic_count_rejected() {
    let f = write_config(
        r#"
        [node]
        role = "proxy"

        [net]
        public_url = "http://10.0.0.1:8080"

        [cluster.ic]
        count = 0
        "#,
    );
    assert!(NodeConfig::from_file(f.path().to_str().unwrap()).is_err());
}

#[tokio::test]
async fn test_minted_ids_are_unique() {
    let f = write_config(
        r#"
        [node]
        role = "proxy"

        [net]
        public_url = "http://10.0.0.1:8080"
        "#,
    );
    let cfg = NodeConfig::from_file(f.path().to_str().unwrap()).unwrap();
    let a = cfg.snode().unwrap();
    let b = cfg.snode().unwrap();
    assert_eq!(a.id.len(), 16);
    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn test_is_self_url() {
    let f = write_config(
        r#"
        [node]
        role = "proxy"

        [net]
        public_url = "http://10.0.0.1:8080"
        control_url = "http://10.0.0.1:8081"
        "#,
    );
    let cfg = NodeConfig::from_file(f.path().to_str().unwrap()).unwrap();
    assert!(cfg.is_self_url("http://10.0.0.1:8080"));
    assert!(cfg.is_self_url("http://10.0.0.1:8081/"));
    assert!(!cfg.is_self_url("http://10.0.0.9:8080"));
}
