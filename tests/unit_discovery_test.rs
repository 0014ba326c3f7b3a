use opalstore::core::cluster::discovery;
use opalstore::core::meta::{Bmd, CluMeta, NodeKind, Smap, Snode};

fn smap(uuid: &str, version: u64) -> Smap {
    let node = Snode {
        id: "p0".to_string(),
        kind: NodeKind::Proxy,
        public_url: "http://127.0.0.1:8000".to_string(),
        control_url: "http://127.0.0.1:8000".to_string(),
        data_url: "http://127.0.0.1:8000".to_string(),
        flags_raw: 0,
    };
    let mut s = Smap::with_primary(node);
    s.uuid = uuid.to_string();
    s.version = version;
    s
}

fn resp(kind: NodeKind, uuid: &str, version: u64) -> (NodeKind, CluMeta) {
    (
        kind,
        CluMeta {
            smap: Some(smap(uuid, version)),
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_fast_path_single_uuid() {
    let responses = vec![
        resp(NodeKind::Target, "u", 4),
        resp(NodeKind::Target, "u", 7),
        resp(NodeKind::Proxy, "u", 6),
    ];
    let agg = discovery::aggregate(&responses).unwrap();
    assert!(!agg.vote_in_progress);
    assert_eq!(agg.meta.smap.unwrap().version, 7);
    assert_eq!(agg.smap_confirmations, 3);
}

#[tokio::test]
async fn test_slow_path_target_majority() {
    // Two targets say cluster "a", one target says "b": "a" wins and the
    // stray response is discarded even though its version is higher.
    let responses = vec![
        resp(NodeKind::Target, "a", 5),
        resp(NodeKind::Target, "a", 6),
        resp(NodeKind::Target, "b", 50),
        resp(NodeKind::Proxy, "b", 51),
    ];
    let agg = discovery::aggregate(&responses).unwrap();
    let smap = agg.meta.smap.unwrap();
    assert_eq!(smap.uuid, "a");
    assert_eq!(smap.version, 6);
    assert_eq!(agg.smap_confirmations, 2);
}

#[tokio::test]
async fn test_slow_path_without_majority_is_fatal() {
    let responses = vec![
        resp(NodeKind::Target, "a", 5),
        resp(NodeKind::Target, "b", 6),
    ];
    let err = discovery::aggregate(&responses).unwrap_err();
    assert!(err.is_integrity());
}

#[tokio::test]
async fn test_vote_in_progress_invalidates_round() {
    let mut voting = resp(NodeKind::Proxy, "u", 9);
    voting.1.vote_in_progress = true;
    let responses = vec![resp(NodeKind::Target, "u", 4), voting];
    let agg = discovery::aggregate(&responses).unwrap();
    assert!(agg.vote_in_progress);
    // Nothing may be adopted from an invalidated round.
    assert!(agg.meta.smap.is_none());
}

#[tokio::test]
async fn test_other_revisions_follow_winning_uuid() {
    let mut with_bmd = resp(NodeKind::Target, "a", 5);
    with_bmd.1.bmd = Some(Bmd {
        uuid: "a".to_string(),
        version: 11,
        buckets: Default::default(),
    });
    let mut stray_bmd = resp(NodeKind::Target, "a", 4);
    stray_bmd.1.bmd = Some(Bmd {
        uuid: "b".to_string(),
        version: 99,
        buckets: Default::default(),
    });
    let responses = vec![with_bmd, stray_bmd, resp(NodeKind::Target, "a", 6)];
    let agg = discovery::aggregate(&responses).unwrap();
    let bmd = agg.meta.bmd.unwrap();
    assert_eq!(bmd.uuid, "a");
    assert_eq!(bmd.version, 11);
}

#[tokio::test]
async fn test_empty_responses_yield_nothing() {
    let agg = discovery::aggregate(&[]).unwrap();
    assert!(agg.meta.smap.is_none());
    assert_eq!(agg.smap_confirmations, 0);
}
