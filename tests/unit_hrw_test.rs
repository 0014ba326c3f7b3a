use opalstore::core::hrw;
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

fn five_proxy_smap() -> Smap {
    let mut smap = Smap::with_primary(proxy("p1", 8080));
    for (i, id) in ["p2", "p3", "p4", "p5"].iter().enumerate() {
        smap.put_node(proxy(id, 8081 + i as u16)).unwrap();
    }
    smap.uuid = "cluster-u".to_string();
    smap.version = 9;
    smap
}

#[tokio::test]
async fn test_weight_is_deterministic() {
    let a = hrw::node_weight("p2", "salt");
    let b = hrw::node_weight("p2", "salt");
    assert_eq!(a, b);
    // Different salt, different ranking input.
    assert_ne!(hrw::node_weight("p2", "salt"), hrw::node_weight("p2", "other"));
    assert_ne!(hrw::node_weight("p2", "salt"), hrw::node_weight("p3", "salt"));
}

#[tokio::test]
async fn test_next_primary_is_stable_across_nodes() {
    // Every node computes the successor from its own copy of the map; the
    // answers must agree.
    let smap = five_proxy_smap();
    let copy: Smap = serde_json::from_str(&serde_json::to_string(&smap).unwrap()).unwrap();
    let a = hrw::next_primary(&smap).unwrap().id.clone();
    let b = hrw::next_primary(&copy).unwrap().id.clone();
    assert_eq!(a, b);
    // The dead primary is never its own successor.
    assert_ne!(a, "p1");
}

#[tokio::test]
async fn test_next_primary_skips_ineligible() {
    let mut smap = five_proxy_smap();
    // Knock out every proxy but one.
    for id in ["p2", "p3", "p4"] {
        let n = smap.get_node_mut(id).unwrap();
        let mut f = n.flags();
        f.insert(SnodeFlags::MAINTENANCE);
        n.set_flags(f);
    }
    let n = smap.get_node_mut("p5").unwrap();
    let mut f = n.flags();
    f.insert(SnodeFlags::NON_ELECTABLE);
    n.set_flags(f);

    // Nobody is left.
    assert!(hrw::next_primary(&smap).is_none());

    // Re-enable one.
    let n = smap.get_node_mut("p3").unwrap();
    n.set_flags(SnodeFlags::empty());
    assert_eq!(hrw::next_primary(&smap).unwrap().id, "p3");
}

#[tokio::test]
async fn test_rank_orders_all_electable() {
    let smap = five_proxy_smap();
    let ranked = hrw::rank_electable(&smap, "p1");
    assert_eq!(ranked.len(), 4);
    // Ranking is a permutation, deterministic under repetition.
    let again = hrw::rank_electable(&smap, "p1");
    let ids: Vec<_> = ranked.iter().map(|n| &n.id).collect();
    let ids2: Vec<_> = again.iter().map(|n| &n.id).collect();
    assert_eq!(ids, ids2);
}

#[tokio::test]
async fn test_select_target_deterministic() {
    let mut smap = five_proxy_smap();
    for (i, id) in ["t1", "t2", "t3"].iter().enumerate() {
        smap.put_node(Snode {
            kind: NodeKind::Target,
            ..proxy(id, 9090 + i as u16)
        })
        .unwrap();
    }
    let a = hrw::select_target(&smap, "job-42").unwrap().id.clone();
    let b = hrw::select_target(&smap, "job-42").unwrap().id.clone();
    assert_eq!(a, b);
}
