use opalstore::core::OpalError;
use opalstore::core::meta::{NodeKind, Smap, SmapOwner, Snode};

fn smap(uuid: &str, version: u64) -> Smap {
    let node = Snode {
        id: "p1".to_string(),
        kind: NodeKind::Proxy,
        public_url: "http://127.0.0.1:8080".to_string(),
        control_url: "http://127.0.0.1:8080".to_string(),
        data_url: "http://127.0.0.1:8080".to_string(),
        flags_raw: 0,
    };
    let mut s = Smap::with_primary(node);
    s.uuid = uuid.to_string();
    s.version = version;
    s
}

#[tokio::test]
async fn test_put_and_get() {
    let owner = SmapOwner::new(Smap::default(), None);
    assert!(owner.put(smap("u", 3)).await.unwrap());
    assert_eq!(owner.get().await.version, 3);
}

#[tokio::test]
async fn test_put_rejects_downgrade() {
    let owner = SmapOwner::new(smap("u", 5), None);
    let err = owner.put(smap("u", 4)).await.unwrap_err();
    assert!(matches!(err, OpalError::Downgrade { incoming: 4, local: 5, .. }));
    assert_eq!(owner.get().await.version, 5);
}

#[tokio::test]
async fn test_put_equal_version_is_a_noop() {
    let owner = SmapOwner::new(smap("u", 5), None);
    assert!(!owner.put(smap("u", 5)).await.unwrap());
    assert_eq!(owner.get().await.version, 5);
}

#[tokio::test]
async fn test_put_uuid_mismatch_is_fatal() {
    let owner = SmapOwner::new(smap("cluster-a", 5), None);
    let err = owner.put(smap("cluster-b", 9)).await.unwrap_err();
    assert!(err.is_integrity());
    assert_eq!(owner.get().await.uuid, "cluster-a");
}

#[tokio::test]
async fn test_put_adopts_uuid_when_local_is_empty() {
    let owner = SmapOwner::new(smap("", 1), None);
    assert!(owner.put(smap("u", 2)).await.unwrap());
    assert_eq!(owner.get().await.uuid, "u");
}

#[tokio::test]
async fn test_modify_installs_only_on_update() {
    let owner = SmapOwner::new(smap("u", 1), None);
    // pre declines: nothing installed.
    let out: Option<()> = owner
        .modify(|_| Ok(None), |_, _: &()| panic!("post must not run"))
        .await
        .unwrap();
    assert!(out.is_none());
    assert_eq!(owner.get().await.version, 1);

    // pre mutates and accepts.
    let out = owner
        .modify(
            |s| {
                s.version += 1;
                Ok(Some(s.version))
            },
            |installed, v| assert_eq!(installed.version, *v),
        )
        .await
        .unwrap();
    assert_eq!(out, Some(2));
    assert_eq!(owner.get().await.version, 2);
}

#[tokio::test]
async fn test_modify_propagates_pre_error() {
    let owner = SmapOwner::new(smap("u", 1), None);
    let err = owner
        .modify(
            |_| -> Result<Option<()>, OpalError> {
                Err(OpalError::NodeNotFound("t404".to_string()))
            },
            |_, _| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OpalError::NodeNotFound(_)));
    assert_eq!(owner.get().await.version, 1);
}

#[tokio::test]
async fn test_persistence_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cluster.smap");

    let (owner, loaded) = SmapOwner::load_or_default(path.clone()).unwrap();
    assert!(!loaded);
    owner.put(smap("u", 7)).await.unwrap();

    // A second owner over the same path sees the persisted revision.
    let (owner2, loaded2) = SmapOwner::load_or_default(path).unwrap();
    assert!(loaded2);
    let got = owner2.get().await;
    assert_eq!(got.version, 7);
    assert_eq!(got.uuid, "u");
    assert_eq!(got.primary_id, "p1");
}

#[tokio::test]
async fn test_remove_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cluster.smap");
    let (owner, _) = SmapOwner::load_or_default(path.clone()).unwrap();
    owner.put(smap("u", 1)).await.unwrap();
    assert!(path.exists());
    owner.remove_snapshot();
    assert!(!path.exists());
}
