use opalstore::config::{NetSection, NodeConfig, NodeSection};
use opalstore::core::NodeContext;
use opalstore::core::meta::NodeKind;
use opalstore::core::state::Mountpath;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{filter::EnvFilter, reload};

fn target_ctx(data_dir: &Path) -> Arc<NodeContext> {
    let config = NodeConfig {
        node: NodeSection {
            id: "t1".to_string(),
            role: NodeKind::Target,
            data_dir: data_dir.to_str().unwrap().to_string(),
            ntargets: 0,
        },
        net: NetSection {
            public_url: "http://127.0.0.1:9090".to_string(),
            control_url: "http://127.0.0.1:9090".to_string(),
            data_url: "http://127.0.0.1:9090".to_string(),
        },
        log_level: "info".to_string(),
        cluster: Default::default(),
        primary_ep: None,
        endpoint: None,
        auth_token: None,
    };
    let (shutdown_tx, _) = broadcast::channel(1);
    let (_layer, handle) =
        reload::Layer::<EnvFilter, tracing_subscriber::Registry>::new(EnvFilter::new("info"));
    NodeContext::initialize(config, shutdown_tx, Arc::new(handle))
        .unwrap()
        .ctx
}

#[tokio::test]
async fn test_attach_and_detach() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = target_ctx(dir.path());

    let mps = ctx.attach_mountpath("/data/1", false).unwrap();
    assert_eq!(
        mps,
        vec![Mountpath {
            path: "/data/1".to_string(),
            enabled: true
        }]
    );
    // Attaching the same path again does not duplicate it.
    let mps = ctx.attach_mountpath("/data/1", false).unwrap();
    assert_eq!(mps.len(), 1);

    ctx.attach_mountpath("/data/2", false).unwrap();
    let mps = ctx.detach_mountpath("/data/1", false).unwrap();
    assert_eq!(mps.len(), 1);
    assert_eq!(mps[0].path, "/data/2");
}

#[tokio::test]
async fn test_enable_disable() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = target_ctx(dir.path());
    ctx.attach_mountpath("/data/1", false).unwrap();

    let mps = ctx.detach_mountpath("/data/1", true).unwrap();
    assert!(!mps[0].enabled);
    // The disabled path stays registered and can be re-enabled.
    let mps = ctx.attach_mountpath("/data/1", true).unwrap();
    assert!(mps[0].enabled);
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = target_ctx(dir.path());

    assert_eq!(ctx.attach_mountpath("/ghost", true).unwrap_err().http_status(), 404);
    assert_eq!(ctx.detach_mountpath("/ghost", false).unwrap_err().http_status(), 404);
    assert_eq!(ctx.detach_mountpath("/ghost", true).unwrap_err().http_status(), 404);
    // Failed operations leave the registry empty and unpersisted changes out.
    assert!(ctx.mountpaths.read().is_empty());
}

#[tokio::test]
async fn test_registry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let ctx = target_ctx(dir.path());
        ctx.attach_mountpath("/data/1", false).unwrap();
        ctx.attach_mountpath("/data/2", false).unwrap();
        ctx.detach_mountpath("/data/2", true).unwrap();
    }

    // A fresh context over the same data dir sees the persisted registry,
    // including the disabled state.
    let ctx = target_ctx(dir.path());
    let mps = ctx.mountpaths.read().clone();
    assert_eq!(
        mps,
        vec![
            Mountpath {
                path: "/data/1".to_string(),
                enabled: true
            },
            Mountpath {
                path: "/data/2".to_string(),
                enabled: false
            },
        ]
    );
}

#[tokio::test]
async fn test_wipe_removes_registry() {
    let dir = tempfile::tempdir().unwrap();
    {
        let ctx = target_ctx(dir.path());
        ctx.attach_mountpath("/data/1", false).unwrap();
        ctx.wipe_persisted_state().await;
    }
    let ctx = target_ctx(dir.path());
    assert!(ctx.mountpaths.read().is_empty());
}
