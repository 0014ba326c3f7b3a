// tests/property/serialization_test.rs

//! Property-based tests: revision serde round-trips and owner monotonicity.

use opalstore::core::meta::{Bmd, BucketProps, NodeKind, Rmd, Smap, SmapOwner, Snode};
use proptest::prelude::*;

fn arb_node(kind: NodeKind) -> impl Strategy<Value = Snode> {
    ("[a-z0-9]{4,16}", 1024u16..=u16::MAX, any::<u16>()).prop_map(move |(id, port, flags)| Snode {
        public_url: format!("http://10.0.0.1:{port}"),
        control_url: format!("http://10.0.0.2:{port}"),
        data_url: format!("http://10.0.0.3:{port}"),
        id,
        kind,
        // Only the low bits are defined flags; the truncation must be stable.
        flags_raw: flags & 0b1_1111,
    })
}

fn arb_smap() -> impl Strategy<Value = Smap> {
    (
        arb_node(NodeKind::Proxy),
        proptest::collection::vec(arb_node(NodeKind::Target), 0..5),
        "[a-f0-9]{0,12}",
        1u64..1_000_000,
    )
        .prop_map(|(primary, targets, uuid, version)| {
            let mut smap = Smap::with_primary(primary);
            for t in targets {
                // Endpoint collisions are legitimately rejected; skip them.
                let _ = smap.put_node(t);
            }
            smap.uuid = uuid;
            smap.version = version;
            smap.creation_time = "2024-01-01T00:00:00Z".to_string();
            smap
        })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_smap_roundtrip(smap in arb_smap()) {
        let wire = serde_json::to_string(&smap).unwrap();
        let back: Smap = serde_json::from_str(&wire).unwrap();
        prop_assert_eq!(&back.uuid, &smap.uuid);
        prop_assert_eq!(back.version, smap.version);
        prop_assert_eq!(&back.primary_id, &smap.primary_id);
        prop_assert_eq!(back.proxies.len(), smap.proxies.len());
        prop_assert_eq!(back.targets.len(), smap.targets.len());
        for (id, node) in &smap.targets {
            let got = back.targets.get(id).unwrap();
            prop_assert_eq!(&got.control_url, &node.control_url);
            prop_assert_eq!(got.flags_raw, node.flags_raw);
        }
    }

    #[test]
    fn test_bmd_roundtrip(
        uuid in "[a-f0-9]{1,12}",
        version in 1u64..1_000_000,
        names in proptest::collection::btree_set("[a-z0-9-]{1,24}", 0..8),
    ) {
        let mut bmd = Bmd { uuid, version, buckets: Default::default() };
        for name in &names {
            bmd.add_bucket(name, BucketProps::default()).unwrap();
        }
        let wire = serde_json::to_string(&bmd).unwrap();
        let back: Bmd = serde_json::from_str(&wire).unwrap();
        prop_assert_eq!(&back.uuid, &bmd.uuid);
        prop_assert_eq!(back.version, bmd.version);
        prop_assert_eq!(&back.buckets, &bmd.buckets);
    }

    #[test]
    fn test_rmd_roundtrip(
        version in 1u64..1_000_000,
        targets in proptest::collection::vec("[a-z0-9]{4,8}", 0..6),
        interrupted in any::<bool>(),
    ) {
        let rmd = Rmd {
            uuid: "u".to_string(),
            version,
            target_ids: targets,
            resilver_id: None,
            interrupted,
        };
        let wire = serde_json::to_string(&rmd).unwrap();
        let back: Rmd = serde_json::from_str(&wire).unwrap();
        prop_assert_eq!(back.version, rmd.version);
        prop_assert_eq!(&back.target_ids, &rmd.target_ids);
        prop_assert_eq!(back.interrupted, rmd.interrupted);
    }

    /// Feeding an owner an arbitrary sequence of versions never moves the
    /// observed version backwards, whatever order the puts arrive in.
    #[test]
    fn test_owner_version_monotonic(versions in proptest::collection::vec(1u64..1000, 1..20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let owner = SmapOwner::new(Smap::default(), None);
            let mut high_water = 0u64;
            for v in versions {
                let mut smap = Smap::with_primary(Snode {
                    id: "p1".to_string(),
                    kind: NodeKind::Proxy,
                    public_url: "http://10.0.0.1:8080".to_string(),
                    control_url: "http://10.0.0.1:8080".to_string(),
                    data_url: "http://10.0.0.1:8080".to_string(),
                    flags_raw: 0,
                });
                smap.uuid = "u".to_string();
                smap.version = v;
                let before = owner.get().await.version;
                let _ = owner.put(smap).await; // downgrades are rejected
                let after = owner.get().await.version;
                assert!(after >= before, "version moved backwards: {before} -> {after}");
                high_water = high_water.max(v);
                assert_eq!(after, high_water);
            }
        });
    }
}
