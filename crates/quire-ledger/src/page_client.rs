//! Prefix-scoped page membership for one feature.
//!
//! A [`PageClient`] binds a feature to one key prefix of one page. It shares
//! the page connection with every other client of that page, owns the
//! operation queue the feature serializes its work on, and receives change,
//! delete, and conflict callbacks for keys under its prefix.
//!
//! The ledger layer never holds a client strongly. Watch deliveries and
//! conflict routing go through [`Weak`] references, so a callback that
//! arrives after the feature dropped its client upgrades to nothing and
//! becomes a no-op instead of touching freed state. The client owns its
//! watch adapter outright; the store keeps only a weak handle to it, so
//! dropping the client also ends the store-side registration.

use crate::client::LedgerClient;
use crate::error::LedgerError;
use quire_core::{Conflict, Entry, Page, PageId, PageSnapshot, PageWatcher};
use quire_tasks::{Operation, OperationQueue};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

fn next_client_id() -> u64 {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Feature-side receiver of page activity under one prefix.
///
/// All callbacks are synchronous and must not block; they run on the
/// delivery path of the store connection. A callback may drop the
/// [`PageClient`] it belongs to.
pub trait PageObserver: Send + Sync + 'static {
    /// A key under the prefix changed to `value`, committed by this device
    /// or another one.
    fn on_page_change(&self, key: &[u8], value: &[u8]) {
        let _ = (key, value);
    }

    /// A key under the prefix was deleted.
    fn on_page_delete(&self, key: &[u8]) {
        let _ = key;
    }

    /// A key under the prefix was written concurrently by two devices.
    ///
    /// The observer must record its decision on `conflict` before returning.
    /// The default merges to an empty value, which keeps the page converging
    /// even when the feature never overrides this.
    fn on_page_conflict(&self, conflict: &mut Conflict) {
        conflict.resolve_merge(Vec::new());
    }
}

/// Registry entry for one client, shared weakly with the ledger.
pub(crate) struct ClientShared {
    pub(crate) id: u64,
    pub(crate) context: String,
    pub(crate) page_id: PageId,
    pub(crate) prefix: Vec<u8>,
    pub(crate) observer: Arc<dyn PageObserver>,
}

/// Adapter from store watch deliveries to the observer.
struct WatchAdapter {
    client: Weak<ClientShared>,
}

impl PageWatcher for WatchAdapter {
    fn on_change(&self, entries: Vec<Entry>) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        debug!(context = %client.context, count = entries.len(), "dispatching page changes");
        for entry in entries {
            client.observer.on_page_change(&entry.key, &entry.value);
        }
    }

    fn on_delete(&self, keys: Vec<Vec<u8>>) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        debug!(context = %client.context, count = keys.len(), "dispatching page deletes");
        for key in keys {
            client.observer.on_page_delete(&key);
        }
    }
}

/// One feature's registered, prefix-scoped handle to a page.
///
/// Owned by the feature that created it. Dropping it deregisters the client
/// from the ledger; if it was the last client of its page, the shared
/// connection and the page's resolver registration go away with it.
pub struct PageClient {
    shared: Arc<ClientShared>,
    ledger: LedgerClient,
    page: Arc<dyn Page>,
    snapshot: Arc<dyn PageSnapshot>,
    // The store watches through a weak handle; this Arc is what keeps the
    // registration alive for the client's lifetime.
    _watch: Arc<dyn PageWatcher>,
    queue: OperationQueue,
}

impl PageClient {
    /// Register a client for `prefix` on the given page.
    ///
    /// Acquires the shared connection (opening it if this is the page's
    /// first client) and takes a prefix-scoped snapshot with a live watch;
    /// later commits under the prefix reach `observer`.
    pub async fn new(
        ledger: &LedgerClient,
        context: impl Into<String>,
        page_id: PageId,
        prefix: impl Into<Vec<u8>>,
        observer: Arc<dyn PageObserver>,
    ) -> Result<Self, LedgerError> {
        let shared = Arc::new(ClientShared {
            id: next_client_id(),
            context: context.into(),
            page_id,
            prefix: prefix.into(),
            observer,
        });
        let page = ledger.get_page(&shared).await?;

        let watcher: Arc<dyn PageWatcher> = Arc::new(WatchAdapter {
            client: Arc::downgrade(&shared),
        });
        let snapshot = match page.snapshot(&shared.prefix, Some(watcher.clone())).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                ledger.drop_page_client(shared.id);
                return Err(err.into());
            }
        };

        let queue = OperationQueue::new(format!("{}:{page_id}", shared.context));
        Ok(Self {
            shared,
            ledger: ledger.clone(),
            page,
            snapshot,
            _watch: watcher,
            queue,
        })
    }

    /// Context name this client registered under.
    pub fn context(&self) -> &str {
        &self.shared.context
    }

    /// Page this client is attached to.
    pub fn page_id(&self) -> PageId {
        self.shared.page_id
    }

    /// Key prefix this client observes.
    pub fn prefix(&self) -> &[u8] {
        &self.shared.prefix
    }

    /// Shared handle to the underlying page.
    pub fn page(&self) -> &Arc<dyn Page> {
        &self.page
    }

    /// The snapshot taken at registration time. For reads that must see
    /// later commits, take a fresh snapshot from [`page`](Self::page).
    pub fn snapshot(&self) -> &Arc<dyn PageSnapshot> {
        &self.snapshot
    }

    /// The queue this feature's operations run on.
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Enqueue an operation on this client's queue.
    pub fn enqueue(&self, op: impl Operation) {
        self.queue.enqueue(op);
    }

    /// Resolve once every operation enqueued so far has completed.
    ///
    /// This is the durability barrier: after `sync` returns, every write
    /// issued through this client's queue has been applied by the store.
    pub async fn sync(&self) -> Result<(), LedgerError> {
        self.queue.barrier().await?;
        Ok(())
    }
}

impl Drop for PageClient {
    fn drop(&mut self) {
        self.ledger.drop_page_client(self.shared.id);
    }
}
