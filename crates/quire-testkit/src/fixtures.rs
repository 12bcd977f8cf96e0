//! Small helpers shared by substrate tests.

use parking_lot::Mutex;
use quire_core::{Entry, PageId, PageWatcher};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Deterministic page id for test `n`.
///
/// Tests that share a store must use distinct values of `n` to stay off each
/// other's pages.
pub fn test_page_id(n: u8) -> PageId {
    PageId::from_bytes([n; 16])
}

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition held. Use this to wait for asynchronous
/// effects (watch deliveries, resolver passes) instead of fixed sleeps.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Install the fmt subscriber for a test run.
///
/// Safe to call from every test; only the first call wins. Filtering follows
/// `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Watcher that records every delivery for later assertions.
#[derive(Default)]
pub struct RecordingWatcher {
    changes: Mutex<Vec<Entry>>,
    deletes: Mutex<Vec<Vec<u8>>>,
}

impl RecordingWatcher {
    /// All change entries delivered so far.
    pub fn changes(&self) -> Vec<Entry> {
        self.changes.lock().clone()
    }

    /// All deleted keys delivered so far.
    pub fn deletes(&self) -> Vec<Vec<u8>> {
        self.deletes.lock().clone()
    }

    /// Whether a change for `key` with exactly `value` was delivered.
    pub fn saw_change(&self, key: &[u8], value: &[u8]) -> bool {
        self.changes
            .lock()
            .iter()
            .any(|entry| entry.key == key && entry.value == value)
    }

    /// Whether a delete for `key` was delivered.
    pub fn saw_delete(&self, key: &[u8]) -> bool {
        self.deletes.lock().iter().any(|k| k == key)
    }
}

impl PageWatcher for RecordingWatcher {
    fn on_change(&self, entries: Vec<Entry>) {
        self.changes.lock().extend(entries);
    }

    fn on_delete(&self, keys: Vec<Vec<u8>>) {
        self.deletes.lock().extend(keys);
    }
}
