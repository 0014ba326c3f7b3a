use opalstore::core::meta::{NodeKind, Smap, Snode};
use opalstore::core::notifs::{NotifKind, NotifListener, NotifTables, now_ms};
use std::collections::BTreeSet;

fn listener(uuid: &str, kind: NotifKind, notifiers: &[&str]) -> NotifListener {
    NotifListener::new(
        uuid,
        kind,
        notifiers.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        now_ms(),
    )
}

fn smap_with_targets(ids: &[&str]) -> Smap {
    let mut smap = Smap::with_primary(Snode {
        id: "p1".to_string(),
        kind: NodeKind::Proxy,
        public_url: "http://127.0.0.1:8080".to_string(),
        control_url: "http://127.0.0.1:8080".to_string(),
        data_url: "http://127.0.0.1:8080".to_string(),
        flags_raw: 0,
    });
    for (i, id) in ids.iter().enumerate() {
        smap.put_node(Snode {
            id: id.to_string(),
            kind: NodeKind::Target,
            public_url: format!("http://127.0.0.1:{}", 9090 + i),
            control_url: format!("http://127.0.0.1:{}", 9090 + i),
            data_url: format!("http://127.0.0.1:{}", 9090 + i),
            flags_raw: 0,
        })
        .unwrap();
    }
    smap.version = 1;
    smap
}

#[tokio::test]
async fn test_finished_moves_listener_exactly_once() {
    let (tables, mut events) = NotifTables::new();
    tables
        .add(listener("op-1", NotifKind::CopyBucket, &["t1", "t2"]))
        .unwrap();

    assert!(!tables.handle_finished("op-1", "t1", None, false).unwrap());
    assert_eq!(tables.running_count(), 1);

    assert!(tables.handle_finished("op-1", "t2", None, false).unwrap());
    assert_eq!(tables.running_count(), 0);
    assert_eq!(tables.finished_count(), 1);

    // The completion event fires exactly once.
    let ev = events.try_recv().unwrap();
    assert_eq!(ev.uuid, "op-1");
    assert!(!ev.aborted);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_duplicate_finished_is_a_bad_request() {
    let (tables, _events) = NotifTables::new();
    tables
        .add(listener("op-1", NotifKind::CopyBucket, &["t1", "t2"]))
        .unwrap();
    tables.handle_finished("op-1", "t1", None, false).unwrap();

    let err = tables.handle_finished("op-1", "t1", None, false).unwrap_err();
    assert_eq!(err.http_status(), 400);
    // State is unchanged: t2 can still complete the operation.
    assert!(tables.handle_finished("op-1", "t2", None, false).unwrap());
}

#[tokio::test]
async fn test_unknown_uuid_is_benign() {
    let (tables, mut events) = NotifTables::new();
    tables.handle_progress("ghost", "t1", serde_json::Value::Null);
    assert!(!tables.handle_finished("ghost", "t1", None, false).unwrap());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let (tables, _events) = NotifTables::new();
    tables
        .add(listener("op-1", NotifKind::ListObjects, &["t1"]))
        .unwrap();
    let err = tables
        .add(listener("op-1", NotifKind::ListObjects, &["t1"]))
        .unwrap_err();
    assert_eq!(err.http_status(), 400);
}

#[tokio::test]
async fn test_finished_with_error_collects_it() {
    let (tables, _events) = NotifTables::new();
    tables
        .add(listener("op-1", NotifKind::CopyBucket, &["t1"]))
        .unwrap();
    tables
        .handle_finished("op-1", "t1", Some("disk full".to_string()), false)
        .unwrap();
    let nl = tables.get("op-1").unwrap();
    assert_eq!(nl.errs.len(), 1);
    assert!(nl.errs[0].contains("disk full"));
}

#[tokio::test]
async fn test_abort_report_short_circuits() {
    let (tables, mut events) = NotifTables::new();
    tables
        .add(listener("op-1", NotifKind::CopyBucket, &["t1", "t2", "t3"]))
        .unwrap();
    assert!(tables.handle_finished("op-1", "t1", None, true).unwrap());
    let ev = events.try_recv().unwrap();
    assert!(ev.aborted);
}

#[tokio::test]
async fn test_smap_change_aborts_unknown_kinds_only() {
    let (tables, mut events) = NotifTables::new();
    tables
        .add(listener("copy-op", NotifKind::CopyBucket, &["t1", "t2"]))
        .unwrap();
    tables
        .add(listener("reb-op", NotifKind::Rebalance, &["t1", "t2"]))
        .unwrap();

    // t2 leaves the cluster map.
    let smap = smap_with_targets(&["t1"]);
    let aborted = tables.handle_smap_change(&smap);

    // The copy operation loses a notifier and dies with node-not-found; the
    // rebalance tolerates the loss (membership change caused it).
    assert_eq!(aborted, vec!["copy-op".to_string()]);
    assert_eq!(tables.running_count(), 1);
    let ev = events.try_recv().unwrap();
    assert_eq!(ev.uuid, "copy-op");
    assert!(ev.aborted);
    assert!(ev.errs.iter().any(|e| e.contains("not found")));
}

#[tokio::test]
async fn test_finished_subset_invariant() {
    let (tables, _events) = NotifTables::new();
    tables
        .add(listener("op-1", NotifKind::CopyBucket, &["t1", "t2"]))
        .unwrap();
    // A node that is not a notifier cannot finish the operation.
    let err = tables.handle_finished("op-1", "t9", None, false).unwrap_err();
    assert_eq!(err.http_status(), 404);
    let nl = tables.get("op-1").unwrap();
    assert!(nl.finished.is_empty());
}

#[tokio::test]
async fn test_stale_notifier_detection() {
    let (tables, _events) = NotifTables::new();
    let mut nl = listener("op-1", NotifKind::CopyBucket, &["t1", "t2"]);
    // Backdate the listener so every silent notifier counts as stale.
    nl.added_at = now_ms().saturating_sub(60_000);
    tables.add(nl).unwrap();
    tables.handle_progress("op-1", "t1", serde_json::Value::Null);

    let stale = tables.stale_running(30_000);
    assert_eq!(stale.len(), 1);
    let (uuid, nodes) = &stale[0];
    assert_eq!(uuid, "op-1");
    assert_eq!(nodes, &vec!["t2".to_string()]);
}

#[tokio::test]
async fn test_mark_lost_finishes_with_error() {
    let (tables, _events) = NotifTables::new();
    tables
        .add(listener("op-1", NotifKind::CopyBucket, &["t1"]))
        .unwrap();
    tables.mark_lost("op-1", "t1");
    assert_eq!(tables.finished_count(), 1);
    let nl = tables.get("op-1").unwrap();
    assert!(!nl.errs.is_empty());
}

#[tokio::test]
async fn test_dump_absorb_roundtrip() {
    let (tables, _events) = NotifTables::new();
    tables
        .add(listener("run-op", NotifKind::Rebalance, &["t1", "t2"]))
        .unwrap();
    tables
        .add(listener("fin-op", NotifKind::ListObjects, &["t1"]))
        .unwrap();
    tables.handle_finished("fin-op", "t1", None, false).unwrap();

    let dump = tables.dump().unwrap();
    assert_eq!(dump.running.len(), 1);
    assert_eq!(dump.finished.len(), 1);

    // A freshly promoted IC member absorbs the dump.
    let (other, _ev2) = NotifTables::new();
    let wire = serde_json::to_string(&dump).unwrap();
    other.absorb(serde_json::from_str(&wire).unwrap()).unwrap();
    assert_eq!(other.running_count(), 1);
    assert_eq!(other.finished_count(), 1);
    assert_eq!(other.get("run-op").unwrap().kind, NotifKind::Rebalance);
}

#[tokio::test]
async fn test_fin_ttl_per_kind() {
    // Listing results are pruned sooner than everything else.
    assert!(NotifKind::ListObjects.fin_ttl() < NotifKind::CopyBucket.fin_ttl());
    assert!(NotifKind::Rebalance.tolerates_lost_notifier());
    assert!(!NotifKind::CopyBucket.tolerates_lost_notifier());
}
