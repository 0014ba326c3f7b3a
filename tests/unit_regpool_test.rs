use opalstore::core::cluster::regpool::{self, RegPool};
use opalstore::core::meta::{Bmd, CluMeta, JoinReq, NodeKind, Smap, Snode};

fn node(id: &str, kind: NodeKind, port: u16) -> Snode {
    Snode {
        id: id.to_string(),
        kind,
        public_url: format!("http://127.0.0.1:{port}"),
        control_url: format!("http://127.0.0.1:{port}"),
        data_url: format!("http://127.0.0.1:{port}"),
        flags_raw: 0,
    }
}

fn join(id: &str, kind: NodeKind, port: u16, meta: CluMeta) -> JoinReq {
    JoinReq {
        node: node(id, kind, port),
        meta,
        rebalance_interrupted: false,
    }
}

fn smap_with(uuid: &str, version: u64) -> Smap {
    let mut s = Smap::with_primary(node("p0", NodeKind::Proxy, 8000));
    s.uuid = uuid.to_string();
    s.version = version;
    s
}

#[tokio::test]
async fn test_pool_rejoin_supersedes() {
    let pool = RegPool::new();
    pool.add(join("t1", NodeKind::Target, 9090, CluMeta::default()));
    pool.add(join("t1", NodeKind::Target, 9090, CluMeta::default()));
    pool.add(join("p2", NodeKind::Proxy, 8081, CluMeta::default()));
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.count_targets(), 1);
    pool.clear();
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_merge_picks_max_version() {
    let pool = vec![
        join(
            "t1",
            NodeKind::Target,
            9090,
            CluMeta {
                smap: Some(smap_with("u", 4)),
                ..Default::default()
            },
        ),
        join(
            "t2",
            NodeKind::Target,
            9091,
            CluMeta {
                smap: Some(smap_with("u", 9)),
                bmd: Some(Bmd {
                    uuid: "u".to_string(),
                    version: 3,
                    buckets: Default::default(),
                }),
                ..Default::default()
            },
        ),
    ];
    let merged = regpool::merge(&pool, CluMeta::default()).unwrap();
    assert_eq!(merged.meta.smap.unwrap().version, 9);
    assert_eq!(merged.meta.bmd.unwrap().version, 3);
    assert!(!merged.vote_in_progress);
}

#[tokio::test]
async fn test_merge_uuid_conflict_is_fatal() {
    let pool = vec![
        join(
            "t1",
            NodeKind::Target,
            9090,
            CluMeta {
                smap: Some(smap_with("cluster-a", 4)),
                ..Default::default()
            },
        ),
        join(
            "t2",
            NodeKind::Target,
            9091,
            CluMeta {
                smap: Some(smap_with("cluster-b", 9)),
                ..Default::default()
            },
        ),
    ];
    let err = regpool::merge(&pool, CluMeta::default()).unwrap_err();
    assert!(err.is_integrity());
}

#[tokio::test]
async fn test_merge_uuid_wins_over_uuidless_equal_version() {
    let pool = vec![
        join(
            "t1",
            NodeKind::Target,
            9090,
            CluMeta {
                smap: Some(smap_with("", 5)),
                ..Default::default()
            },
        ),
        join(
            "t2",
            NodeKind::Target,
            9091,
            CluMeta {
                smap: Some(smap_with("u", 5)),
                ..Default::default()
            },
        ),
    ];
    let merged = regpool::merge(&pool, CluMeta::default()).unwrap();
    assert_eq!(merged.meta.smap.unwrap().uuid, "u");
}

#[tokio::test]
async fn test_merge_carries_vote_flag() {
    let pool = vec![join(
        "p2",
        NodeKind::Proxy,
        8081,
        CluMeta {
            smap: Some(smap_with("u", 2)),
            vote_in_progress: true,
            ..Default::default()
        },
    )];
    let merged = regpool::merge(&pool, CluMeta::default()).unwrap();
    assert!(merged.vote_in_progress);
}
