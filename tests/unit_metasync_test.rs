use opalstore::core::meta::{NodeKind, RevKind, Smap, Snode};
use opalstore::core::metasync::{Action, ActionMsg, RevEnvelope, RevPair, SyncBundle};

fn smap() -> Smap {
    let node = Snode {
        id: "p1".to_string(),
        kind: NodeKind::Proxy,
        public_url: "http://127.0.0.1:8080".to_string(),
        control_url: "http://127.0.0.1:8080".to_string(),
        data_url: "http://127.0.0.1:8080".to_string(),
        flags_raw: 0,
    };
    let mut s = Smap::with_primary(node);
    s.uuid = "u".to_string();
    s.version = 3;
    s
}

#[tokio::test]
async fn test_bundle_iterates_in_apply_order() {
    // The documented order: Config before Smap before BMD before RMD,
    // regardless of insertion order.
    let mut bundle = SyncBundle::default();
    for kind in [RevKind::Rmd, RevKind::Smap, RevKind::Config, RevKind::Bmd] {
        bundle.revs.insert(
            kind,
            RevEnvelope {
                body: serde_json::Value::Null,
                msg: ActionMsg::new(Action::PrimaryStarted),
            },
        );
    }
    let order: Vec<RevKind> = bundle.revs.keys().copied().collect();
    assert_eq!(
        order,
        vec![RevKind::Config, RevKind::Smap, RevKind::Bmd, RevKind::Rmd]
    );
}

#[tokio::test]
async fn test_bundle_serde_roundtrip() {
    let pair = RevPair::from_smap(
        &smap(),
        ActionMsg::new(Action::JoinCluster {
            node_id: "t1".to_string(),
        }),
    )
    .unwrap();
    let mut bundle = SyncBundle::default();
    bundle.revs.insert(
        pair.kind,
        RevEnvelope {
            body: pair.body,
            msg: pair.msg,
        },
    );

    let wire = serde_json::to_vec(&bundle).unwrap();
    let back: SyncBundle = serde_json::from_slice(&wire).unwrap();
    let env = back.revs.get(&RevKind::Smap).unwrap();
    let got: Smap = serde_json::from_value(env.body.clone()).unwrap();
    assert_eq!(got.version, 3);
    assert_eq!(got.uuid, "u");
    assert!(matches!(env.msg.action, Action::JoinCluster { ref node_id } if node_id == "t1"));
}

#[tokio::test]
async fn test_action_msg_is_tagged() {
    let msg = ActionMsg::with_txn(
        Action::StartMaintenance {
            node_id: "t2".to_string(),
        },
        "txn-1",
    );
    let v = serde_json::to_value(&msg).unwrap();
    assert_eq!(v["action"], "start-maintenance");
    assert_eq!(v["node_id"], "t2");
    assert_eq!(v["txn_uuid"], "txn-1");

    let back: ActionMsg = serde_json::from_value(v).unwrap();
    assert!(matches!(back.action, Action::StartMaintenance { .. }));
    assert_eq!(back.txn_uuid.as_deref(), Some("txn-1"));
}

#[tokio::test]
async fn test_action_msg_without_txn_omits_field() {
    let msg = ActionMsg::new(Action::ConfigUpdated);
    let v = serde_json::to_value(&msg).unwrap();
    assert_eq!(v["action"], "config-updated");
    assert!(v.get("txn_uuid").is_none());
}

#[tokio::test]
async fn test_rev_kind_wire_names() {
    // Kinds serialize as stable lowercase strings, usable as map keys.
    let wire = serde_json::to_string(&RevKind::Config).unwrap();
    assert_eq!(wire, "\"config\"");
    let back: RevKind = serde_json::from_str("\"rmd\"").unwrap();
    assert_eq!(back, RevKind::Rmd);
}
