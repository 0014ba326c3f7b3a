use opalstore::core::meta::Rmd;

#[tokio::test]
async fn test_bump_clears_interruption() {
    let mut rmd = Rmd {
        interrupted: true,
        resilver_id: Some("t9".to_string()),
        ..Default::default()
    };
    let id = rmd.bump(vec!["t1".to_string(), "t2".to_string()]);
    assert_eq!(id, "g1");
    assert_eq!(rmd.version, 1);
    assert!(!rmd.interrupted);
    assert!(rmd.resilver_id.is_none());
    assert_eq!(rmd.target_ids, vec!["t1", "t2"]);
}

#[tokio::test]
async fn test_rebalance_id_is_derived_from_version() {
    let mut rmd = Rmd::default();
    rmd.bump(vec!["t1".to_string()]);
    rmd.bump(vec!["t1".to_string()]);
    assert_eq!(rmd.rebalance_id(), "g2");
    // Every node computes the same ID from the same RMD.
    let copy: Rmd = serde_json::from_str(&serde_json::to_string(&rmd).unwrap()).unwrap();
    assert_eq!(copy.rebalance_id(), rmd.rebalance_id());
}
