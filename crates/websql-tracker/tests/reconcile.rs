mod common;

use std::sync::Arc;

use common::{origin, tracker_in, Event, FakeHandle, FakeThread, RecordingClient};
use websql_tracker::DatabaseHandle;

fn remove_origin_row(tracker_path: &std::path::Path, identifier: &str) {
    let conn = rusqlite::Connection::open(tracker_path).unwrap();
    conn.execute("DELETE FROM Origins WHERE origin = ?1", [identifier])
        .unwrap();
}

#[test_log::test]
fn test_picks_up_origin_added_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let ours = tracker_in(dir.path());
    let theirs = tracker_in(dir.path());
    let client = Arc::new(RecordingClient::default());
    ours.set_client(Some(client.clone()));

    let a = origin("a.example");
    let b = origin("b.example");
    ours.set_quota(&a, 10);
    client.clear();

    theirs.set_quota(&b, 20);
    assert!(!ours.has_entry_for_origin(&b));

    assert_eq!(ours.origins_did_change(), vec![b.clone()]);
    assert_eq!(ours.quota_for_origin(&b), 20);
    assert_eq!(client.events(), vec![Event::ModifiedOrigin(b.to_string())]);

    assert!(ours.origins_did_change().is_empty());
}

#[test_log::test]
fn test_drops_empty_origin_deleted_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let ours = tracker_in(dir.path());
    let theirs = tracker_in(dir.path());
    let a = origin("a.example");
    let b = origin("b.example");
    ours.set_quota(&a, 10);
    ours.set_quota(&b, 10);

    theirs.delete_origin(&b).unwrap();

    assert_eq!(ours.origins_did_change(), vec![b.clone()]);
    assert!(!ours.has_entry_for_origin(&b));
    assert!(ours.has_entry_for_origin(&a));
}

#[test_log::test]
fn test_keeps_origin_that_still_has_databases() {
    let dir = tempfile::tempdir().unwrap();
    let ours = tracker_in(dir.path());
    let a = origin("a.example");
    let b = origin("b.example");
    ours.set_quota(&a, 10);
    ours.set_quota(&b, 10);
    ours.full_path_for_database(&b, "x", true).unwrap();

    remove_origin_row(ours.tracker_database_path(), b.database_identifier());

    assert!(ours.origins_did_change().is_empty());
    assert!(ours.has_entry_for_origin(&b));
}

#[test_log::test]
fn test_keeps_origin_with_open_handles() {
    let dir = tempfile::tempdir().unwrap();
    let ours = tracker_in(dir.path());
    let a = origin("a.example");
    let b = origin("b.example");
    ours.set_quota(&a, 10);
    ours.set_quota(&b, 10);

    let handle: Arc<dyn DatabaseHandle> = FakeHandle::new(
        &b,
        "opening",
        ours.origin_path(&b).join("0000000000000001.db"),
        Arc::new(FakeThread::default()),
    );
    ours.add_open_database(handle.clone());
    remove_origin_row(ours.tracker_database_path(), b.database_identifier());

    assert!(ours.origins_did_change().is_empty());
    assert!(ours.has_entry_for_origin(&b));

    ours.remove_open_database(&handle);
    assert_eq!(ours.origins_did_change(), vec![b]);
}

#[test_log::test]
fn test_closes_handles_of_databases_deleted_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let ours = tracker_in(dir.path());
    let theirs = tracker_in(dir.path());
    let client = Arc::new(RecordingClient::default());
    let a = origin("a.example");
    ours.set_quota(&a, 100);

    let x = ours.full_path_for_database(&a, "x", true).unwrap();
    let y = ours.full_path_for_database(&a, "y", true).unwrap();
    let thread = Arc::new(FakeThread::default());
    let x_handle = FakeHandle::new(&a, "x", x, thread.clone());
    let y_handle = FakeHandle::new(&a, "y", y, thread);
    ours.add_open_database(x_handle.clone());
    ours.add_open_database(y_handle.clone());
    ours.set_client(Some(client.clone()));

    theirs.delete_database(&a, "x").unwrap();

    assert_eq!(ours.remove_deleted_opened_databases(), 1);
    assert!(x_handle.is_deleted());
    assert!(!y_handle.is_deleted());
    assert_eq!(
        client.events(),
        vec![
            Event::ModifiedOrigin(a.to_string()),
            Event::ModifiedDatabase(a.to_string(), "x".to_string()),
        ]
    );

    // Already closed handles are left alone.
    assert_eq!(ours.remove_deleted_opened_databases(), 0);
}

#[test_log::test]
fn test_closes_handles_of_replaced_databases() {
    let dir = tempfile::tempdir().unwrap();
    let ours = tracker_in(dir.path());
    let client = Arc::new(RecordingClient::default());
    let a = origin("a.example");
    ours.set_quota(&a, 100);
    ours.full_path_for_database(&a, "x", true).unwrap();

    // The handle still points at a file the catalog no longer names.
    let stale = FakeHandle::new(
        &a,
        "x",
        ours.origin_path(&a).join("00000000000000ff.db"),
        Arc::new(FakeThread::default()),
    );
    ours.add_open_database(stale.clone());
    ours.set_client(Some(client.clone()));

    assert_eq!(ours.remove_deleted_opened_databases(), 1);
    assert!(stale.is_deleted());
    assert!(client.events().is_empty());
}

#[test_log::test]
fn test_reconcile_without_catalog_is_quiet() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = tracker_in(dir.path());

    assert!(tracker.origins_did_change().is_empty());
    assert_eq!(tracker.remove_deleted_opened_databases(), 0);
    assert!(!tracker.tracker_database_path().exists());
}
