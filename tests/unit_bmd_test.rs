use opalstore::core::OpalError;
use opalstore::core::meta::{Bmd, BucketProps};

#[tokio::test]
async fn test_initial_bmd() {
    let bmd = Bmd::initial("cluster-u");
    assert_eq!(bmd.version, 1);
    assert_eq!(bmd.uuid, "cluster-u");
    assert!(bmd.buckets.is_empty());
    assert!(!bmd.is_empty());
}

#[tokio::test]
async fn test_add_bucket_bumps_version() {
    let mut bmd = Bmd::initial("u");
    bmd.add_bucket("logs", BucketProps::default()).unwrap();
    assert_eq!(bmd.version, 2);
    assert!(bmd.get("logs").is_some());
    assert_eq!(bmd.get("logs").unwrap().bid, 2);

    let err = bmd.add_bucket("logs", BucketProps::default()).unwrap_err();
    assert!(matches!(err, OpalError::InvalidRequest(_)));
    // Version must not have moved on the failed add.
    assert_eq!(bmd.version, 2);
}

#[tokio::test]
async fn test_del_bucket_bumps_version() {
    let mut bmd = Bmd::initial("u");
    bmd.add_bucket("logs", BucketProps::default()).unwrap();
    let props = bmd.del_bucket("logs").unwrap();
    assert_eq!(props.bid, 2);
    assert_eq!(bmd.version, 3);
    assert!(bmd.get("logs").is_none());

    let err = bmd.del_bucket("logs").unwrap_err();
    assert!(matches!(err, OpalError::NotFound(_)));
    assert_eq!(bmd.version, 3);
}
