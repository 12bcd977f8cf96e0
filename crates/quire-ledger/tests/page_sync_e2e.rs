#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! End-to-end scenarios: several devices, one shared store, real conflict
//! resolution passes. Each device is one store connection with its own
//! ledger client; the store itself is the in-memory testkit backend.

use assert_matches::assert_matches;
use parking_lot::Mutex;
use quire_core::Conflict;
use quire_ledger::{LedgerClient, PageClient, PageObserver, WriteData};
use quire_testkit::{init_tracing, test_page_id, wait_until, MemoryPageStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

const WAIT: Duration = Duration::from_secs(2);

/// Observer that records every delivery and optionally resolves conflicts
/// to a fixed merged value. Without a merge value conflicts are left at
/// their initial resolution, which keeps the committing side.
struct RecordingObserver {
    merge_value: Option<Vec<u8>>,
    changes: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    deletes: Mutex<Vec<Vec<u8>>>,
    conflict_keys: Mutex<Vec<Vec<u8>>>,
}

impl RecordingObserver {
    fn new() -> Arc<Self> {
        Self::build(None)
    }

    fn merging_to(value: &[u8]) -> Arc<Self> {
        Self::build(Some(value.to_vec()))
    }

    fn build(merge_value: Option<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            merge_value,
            changes: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            conflict_keys: Mutex::new(Vec::new()),
        })
    }

    fn changes(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.changes.lock().clone()
    }

    fn saw_change(&self, key: &[u8], value: &[u8]) -> bool {
        self.changes
            .lock()
            .iter()
            .any(|(k, v)| k == key && v == value)
    }

    fn saw_delete(&self, key: &[u8]) -> bool {
        self.deletes.lock().iter().any(|k| k == key)
    }

    fn deletes(&self) -> Vec<Vec<u8>> {
        self.deletes.lock().clone()
    }

    fn conflict_keys(&self) -> Vec<Vec<u8>> {
        self.conflict_keys.lock().clone()
    }

    fn conflict_count(&self) -> usize {
        self.conflict_keys.lock().len()
    }
}

impl PageObserver for RecordingObserver {
    fn on_page_change(&self, key: &[u8], value: &[u8]) {
        self.changes.lock().push((key.to_vec(), value.to_vec()));
    }

    fn on_page_delete(&self, key: &[u8]) {
        self.deletes.lock().push(key.to_vec());
    }

    fn on_page_conflict(&self, conflict: &mut Conflict) {
        self.conflict_keys.lock().push(conflict.key.clone());
        if let Some(value) = &self.merge_value {
            conflict.resolve_merge(value.clone());
        }
    }
}

#[tokio::test]
async fn clients_of_one_page_share_one_connection() {
    let store = MemoryPageStore::new();
    let ledger = LedgerClient::new(store.connect());

    let first = PageClient::new(&ledger, "alpha", test_page_id(60), "a/", RecordingObserver::new())
        .await
        .expect("first client");
    let second = PageClient::new(&ledger, "beta", test_page_id(60), "b/", RecordingObserver::new())
        .await
        .expect("second client");
    let elsewhere = PageClient::new(&ledger, "gamma", test_page_id(61), "", RecordingObserver::new())
        .await
        .expect("third client");

    assert!(Arc::ptr_eq(first.page(), second.page()));
    assert!(!Arc::ptr_eq(first.page(), elsewhere.page()));
}

#[tokio::test]
async fn observers_are_scoped_to_their_prefix() {
    let store = MemoryPageStore::new();
    let ledger = LedgerClient::new(store.connect());

    let obs_a = RecordingObserver::new();
    let obs_b = RecordingObserver::new();
    let client_a = PageClient::new(&ledger, "alpha", test_page_id(62), "a/", obs_a.clone())
        .await
        .expect("client a");
    let _client_b = PageClient::new(&ledger, "beta", test_page_id(62), "b/", obs_b.clone())
        .await
        .expect("client b");

    client_a.page().put(b"a/x", b"1").await.expect("put");
    client_a.page().put(b"b/y", b"2").await.expect("put");

    assert!(wait_until(WAIT, || obs_a.saw_change(b"a/x", b"1")).await);
    assert!(wait_until(WAIT, || obs_b.saw_change(b"b/y", b"2")).await);
    assert!(obs_a.changes().iter().all(|(key, _)| key.starts_with(b"a/")));
    assert!(obs_b.changes().iter().all(|(key, _)| key.starts_with(b"b/")));

    client_a.page().delete(b"a/x").await.expect("delete");
    assert!(wait_until(WAIT, || obs_a.saw_delete(b"a/x")).await);
    assert!(obs_b.deletes().is_empty());
}

#[tokio::test]
async fn conflicting_writes_converge_through_observer_merge() {
    init_tracing();
    let store = MemoryPageStore::new();
    let ledger_a = LedgerClient::new(store.connect());
    let ledger_b = LedgerClient::new(store.connect());
    let mut events = ledger_b.watch_conflicts();

    let obs_a = RecordingObserver::new();
    let obs_b = RecordingObserver::merging_to(b"v3");
    let client_a = PageClient::new(&ledger_a, "notes-a", test_page_id(63), "k/", obs_a.clone())
        .await
        .expect("client a");
    let client_b = PageClient::new(&ledger_b, "notes-b", test_page_id(63), "k/", obs_b.clone())
        .await
        .expect("client b");

    // A commits first; B still builds on the empty page, so B's write is a
    // concurrent change to the same key.
    client_a.page().put(b"k/title", b"v1").await.expect("put a");
    client_b.page().put(b"k/title", b"v2").await.expect("put b");

    assert!(wait_until(WAIT, || obs_a.saw_change(b"k/title", b"v3")).await);
    assert!(wait_until(WAIT, || obs_b.saw_change(b"k/title", b"v3")).await);

    // Only the committing device's ledger runs the pass, and only the one
    // registered observer is asked.
    assert_eq!(obs_b.conflict_keys(), vec![b"k/title".to_vec()]);
    assert_eq!(obs_a.conflict_count(), 0);

    let event = events.try_recv().expect("conflict event");
    assert_eq!(event.page_id, test_page_id(63));
    assert_eq!(event.resolved, 1);
    assert_eq!(event.skipped, 0);
    assert_matches!(events.try_recv(), Err(TryRecvError::Empty));

    let snapshot = client_a.page().snapshot(b"", None).await.expect("snapshot");
    assert_eq!(
        snapshot.get(b"k/title").await.expect("get").as_deref(),
        Some(b"v3".as_slice())
    );
}

#[tokio::test]
async fn disjoint_concurrent_writes_merge_without_conflicts() {
    let store = MemoryPageStore::new();
    let ledger_a = LedgerClient::new(store.connect());
    let ledger_b = LedgerClient::new(store.connect());

    let obs_a = RecordingObserver::new();
    let obs_b = RecordingObserver::new();
    let client_a = PageClient::new(&ledger_a, "alpha", test_page_id(64), "a/", obs_a.clone())
        .await
        .expect("client a");
    let client_b = PageClient::new(&ledger_b, "beta", test_page_id(64), "b/", obs_b.clone())
        .await
        .expect("client b");

    client_a.page().put(b"a/x", b"1").await.expect("put a");
    client_b.page().put(b"b/y", b"2").await.expect("put b");

    assert!(wait_until(WAIT, || obs_a.saw_change(b"a/x", b"1")).await);
    assert!(wait_until(WAIT, || obs_b.saw_change(b"b/y", b"2")).await);
    assert_eq!(obs_a.conflict_count() + obs_b.conflict_count(), 0);

    let snapshot = client_a.page().snapshot(b"", None).await.expect("snapshot");
    assert_eq!(
        snapshot.get(b"a/x").await.expect("get").as_deref(),
        Some(b"1".as_slice())
    );
    assert_eq!(
        snapshot.get(b"b/y").await.expect("get").as_deref(),
        Some(b"2".as_slice())
    );
}

#[tokio::test]
async fn unwatched_pages_fall_back_to_last_one_wins() {
    let store = MemoryPageStore::new();
    let conn_a = store.connect();
    let conn_b = store.connect();
    let ledger_b = LedgerClient::new(conn_b.clone());
    let mut events = ledger_b.watch_conflicts();

    // No client anywhere for this page; writes go through raw handles.
    let page_a = conn_a.page(test_page_id(65)).await.expect("page a");
    let page_b = conn_b.page(test_page_id(65)).await.expect("page b");

    page_a.put(b"k", b"v1").await.expect("put a");
    page_b.put(b"k", b"v2").await.expect("put b");

    // B's ledger is the factory for B's connection; with nobody registered
    // it answers last-one-wins and the committing side sticks.
    let snapshot = page_b.snapshot(b"", None).await.expect("snapshot");
    assert_eq!(
        snapshot.get(b"k").await.expect("get").as_deref(),
        Some(b"v2".as_slice())
    );
    assert_matches!(events.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn conflicts_outside_every_prefix_keep_the_committer_value() {
    init_tracing();
    let store = MemoryPageStore::new();
    let conn_a = store.connect();
    let ledger_b = LedgerClient::new(store.connect());
    let mut events = ledger_b.watch_conflicts();

    // B keeps the merge policy automatic by holding a client, but that
    // client only claims "a/" while the contested key lives under "z/".
    let obs_b = RecordingObserver::merging_to(b"v3");
    let client_b = PageClient::new(&ledger_b, "narrow", test_page_id(66), "a/", obs_b.clone())
        .await
        .expect("client b");

    let page_a = conn_a.page(test_page_id(66)).await.expect("page a");
    page_a.put(b"z/k", b"v1").await.expect("put a");
    client_b.page().put(b"z/k", b"v2").await.expect("put b");

    let mut seen = None;
    assert!(
        wait_until(WAIT, || {
            if let Ok(event) = events.try_recv() {
                seen = Some(event);
            }
            seen.is_some()
        })
        .await
    );
    let event = seen.expect("conflict event");
    assert_eq!(event.resolved, 0);
    assert_eq!(event.skipped, 1);
    assert_eq!(obs_b.conflict_count(), 0);

    // The merge pass submitted nothing for the key, so the committing
    // side's value survives the merge commit.
    let snapshot = page_a.snapshot(b"", None).await.expect("snapshot");
    assert_eq!(
        snapshot.get(b"z/k").await.expect("get").as_deref(),
        Some(b"v2".as_slice())
    );
}

#[tokio::test]
async fn dropping_the_last_client_closes_the_connection() {
    let store = MemoryPageStore::new();
    let conn = store.connect();
    let ledger = LedgerClient::new(conn.clone());

    let obs = RecordingObserver::merging_to(b"never");
    let client = PageClient::new(&ledger, "only", test_page_id(67), "", obs.clone())
        .await
        .expect("client");
    let old_page = client.page().clone();
    drop(client);

    // A later client gets a fresh connection, not the closed one.
    let replacement = PageClient::new(&ledger, "again", test_page_id(67), "", RecordingObserver::new())
        .await
        .expect("replacement");
    assert!(!Arc::ptr_eq(&old_page, replacement.page()));
    drop(replacement);

    // With every client gone the registration is cleared too: a conflicting
    // write now resolves last-one-wins and the old observer stays silent.
    let other = store.connect().page(test_page_id(67)).await.expect("other page");
    let mine = conn.page(test_page_id(67)).await.expect("my page");
    other.put(b"k", b"v1").await.expect("put other");
    mine.put(b"k", b"v2").await.expect("put mine");

    let snapshot = mine.snapshot(b"", None).await.expect("snapshot");
    assert_eq!(
        snapshot.get(b"k").await.expect("get").as_deref(),
        Some(b"v2".as_slice())
    );
    assert_eq!(obs.conflict_count(), 0);
}

#[tokio::test]
async fn queued_writes_are_visible_after_sync() {
    let store = MemoryPageStore::new();
    let ledger = LedgerClient::new(store.connect());
    let client = PageClient::new(&ledger, "counter", test_page_id(68), "", RecordingObserver::new())
        .await
        .expect("client");

    client.enqueue(WriteData::new(client.page().clone(), "w/1", 7u32, |_| {}));
    client.sync().await.expect("queue alive");

    let snapshot = client.page().snapshot(b"", None).await.expect("snapshot");
    assert_eq!(
        snapshot.get(b"w/1").await.expect("get").as_deref(),
        Some(b"7".as_slice())
    );
}
