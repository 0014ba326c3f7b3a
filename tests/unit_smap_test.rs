use opalstore::core::OpalError;
use opalstore::core::meta::{NodeKind, Smap, Snode, SnodeFlags};

fn proxy(id: &str, port: u16) -> Snode {
    Snode {
        id: id.to_string(),
        kind: NodeKind::Proxy,
        public_url: format!("http://127.0.0.1:{port}"),
        control_url: format!("http://127.0.0.1:{port}"),
        data_url: format!("http://127.0.0.1:{port}"),
        flags_raw: 0,
    }
}

fn target(id: &str, port: u16) -> Snode {
    Snode {
        kind: NodeKind::Target,
        ..proxy(id, port)
    }
}

#[tokio::test]
async fn test_with_primary_is_self_only() {
    let smap = Smap::with_primary(proxy("p1", 8080));
    assert_eq!(smap.primary_id, "p1");
    assert_eq!(smap.proxies.len(), 1);
    assert!(smap.targets.is_empty());
    assert_eq!(smap.version, 0);
}

#[tokio::test]
async fn test_put_node_rejects_endpoint_collision() {
    let mut smap = Smap::with_primary(proxy("p1", 8080));
    // Same port as p1 but a different ID.
    let err = smap.put_node(proxy("p2", 8080)).unwrap_err();
    assert!(matches!(err, OpalError::ClusterIntegrity(_)));

    // Distinct endpoints are fine.
    assert!(smap.put_node(proxy("p2", 8081)).unwrap());
}

#[tokio::test]
async fn test_put_node_reports_changes() {
    let mut smap = Smap::with_primary(proxy("p1", 8080));
    assert!(smap.put_node(target("t1", 9090)).unwrap());
    // Identical re-join changes nothing.
    assert!(!smap.put_node(target("t1", 9090)).unwrap());
    // A flag change does.
    let mut t1 = target("t1", 9090);
    t1.set_flags(SnodeFlags::MAINTENANCE);
    assert!(smap.put_node(t1).unwrap());
}

#[tokio::test]
async fn test_validate() {
    let mut smap = Smap::with_primary(proxy("p1", 8080));
    assert!(smap.validate().is_err()); // version 0
    smap.version = 1;
    assert!(smap.validate().is_ok());

    smap.primary_id = "ghost".to_string();
    assert!(smap.validate().is_err());
}

#[tokio::test]
async fn test_check_uuid_split_is_fatal() {
    let mut a = Smap::with_primary(proxy("p1", 8080));
    a.uuid = "cluster-a".to_string();
    let mut b = Smap::with_primary(proxy("p2", 8081));
    b.uuid = "cluster-b".to_string();
    let err = a.check_uuid(&b).unwrap_err();
    assert!(matches!(err, OpalError::ClusterIntegrity(_)));

    // Empty UUIDs never conflict.
    b.uuid.clear();
    assert!(a.check_uuid(&b).is_ok());
}

#[tokio::test]
async fn test_staff_ic_converges_to_count() {
    let mut smap = Smap::with_primary(proxy("p1", 8080));
    for (i, id) in ["p2", "p3", "p4", "p5"].iter().enumerate() {
        smap.put_node(proxy(id, 8081 + i as u16)).unwrap();
    }
    assert!(smap.staff_ic(3));
    assert_eq!(smap.ic_members().len(), 3);
    // Idempotent.
    assert!(!smap.staff_ic(3));

    // Fewer electable proxies than the configured count: the IC shrinks.
    assert!(smap.staff_ic(10));
    assert_eq!(smap.ic_members().len(), 5);
    assert!(smap.staff_ic(3));
    assert_eq!(smap.ic_members().len(), 3);
}

#[tokio::test]
async fn test_staff_ic_evicts_drained_member() {
    let mut smap = Smap::with_primary(proxy("p1", 8080));
    smap.put_node(proxy("p2", 8081)).unwrap();
    smap.put_node(proxy("p3", 8082)).unwrap();
    smap.staff_ic(3);
    assert_eq!(smap.ic_members().len(), 3);

    // Drain a member: it must lose the seat on the next staffing pass.
    let member_id = smap.ic_members()[0].id.clone();
    let node = smap.get_node_mut(&member_id).unwrap();
    let mut flags = node.flags();
    flags.insert(SnodeFlags::MAINTENANCE);
    node.set_flags(flags);

    smap.staff_ic(3);
    assert!(smap.ic_members().iter().all(|p| p.id != member_id));
}

#[tokio::test]
async fn test_non_electable_never_seated() {
    let mut smap = Smap::with_primary(proxy("p1", 8080));
    let mut p2 = proxy("p2", 8081);
    p2.set_flags(SnodeFlags::NON_ELECTABLE);
    smap.put_node(p2).unwrap();
    smap.staff_ic(3);
    assert!(smap.ic_members().iter().all(|p| p.id != "p2"));
}

#[tokio::test]
async fn test_peers_of_lists_targets_first() {
    let mut smap = Smap::with_primary(proxy("p1", 8080));
    smap.put_node(proxy("p2", 8081)).unwrap();
    smap.put_node(target("t1", 9090)).unwrap();
    smap.put_node(target("t2", 9091)).unwrap();

    let peers = smap.peers_of("p1");
    assert_eq!(peers.len(), 3);
    assert!(peers[0].is_target());
    assert!(peers[1].is_target());
    assert!(peers[2].is_proxy());
    assert!(peers.iter().all(|n| n.id != "p1"));
}

#[tokio::test]
async fn test_active_counts_exclude_drained() {
    let mut smap = Smap::with_primary(proxy("p1", 8080));
    let mut t1 = target("t1", 9090);
    t1.set_flags(SnodeFlags::MAINTENANCE);
    smap.put_node(t1).unwrap();
    smap.put_node(target("t2", 9091)).unwrap();
    assert_eq!(smap.count_active_targets(), 1);
    assert_eq!(smap.count_active_proxies(), 1);
}

#[tokio::test]
async fn test_node_equality_is_by_id() {
    let a = proxy("n1", 8080);
    let mut b = proxy("n1", 9999);
    b.set_flags(SnodeFlags::MAINTENANCE);
    assert_eq!(a, b);
    assert_ne!(a, proxy("n2", 8080));
}
