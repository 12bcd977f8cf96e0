//! Pure interfaces of the remote page store.
//!
//! The substrate never talks to a concrete backend; it is written against
//! these traits. A backend connection is per device: registering a conflict
//! resolver factory affects only commits issued through that connection.
//!
//! Every async method is a suspension point for the calling operation. A
//! watcher, once registered through [`Page::snapshot`], keeps receiving
//! change and delete notifications scoped to its prefix for as long as the
//! caller keeps it alive; the backend holds it weakly.

use crate::conflict::{DiffEntry, MergePolicy, MergedValue};
use crate::error::StoreResult;
use crate::ids::PageId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One key/value pair of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes.
    pub value: Vec<u8>,
}

impl Entry {
    /// Create an entry.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Opaque continuation token for paginated reads.
///
/// Returned alongside a partial result; feeding it back yields the next
/// chunk. `None` in the result position means the stream is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken(pub u64);

/// Per-device connection to the store.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Open (or re-open) a handle to the page with the given id.
    ///
    /// Every call returns a fresh handle; sharing one handle between many
    /// logical clients is the job of the ledger client layer.
    async fn page(&self, id: PageId) -> StoreResult<Arc<dyn Page>>;

    /// Register the factory consulted when commits through this connection
    /// race with other writers. At most one factory per connection; a second
    /// registration replaces the first.
    fn register_resolver_factory(&self, factory: Arc<dyn ConflictResolverFactory>);
}

/// Handle to one page of the store.
#[async_trait]
pub trait Page: Send + Sync {
    /// Id of the page this handle points at.
    fn id(&self) -> PageId;

    /// Take a consistent snapshot scoped to `prefix`, optionally registering
    /// a live watcher that receives every later change under the prefix.
    ///
    /// The backend retains the watcher weakly; the caller owns it and keeps
    /// it alive for as long as it wants deliveries.
    async fn snapshot(
        &self,
        prefix: &[u8],
        watcher: Option<Arc<dyn PageWatcher>>,
    ) -> StoreResult<Arc<dyn PageSnapshot>>;

    /// Write a value. Outside a transaction this commits immediately.
    async fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Delete a key. Deleting an absent key succeeds.
    async fn delete(&self, key: &[u8]) -> StoreResult<()>;

    /// Start staging writes; they become visible atomically on [`commit`].
    ///
    /// [`commit`]: Page::commit
    async fn begin_transaction(&self) -> StoreResult<()>;

    /// Commit the staged writes as one version.
    async fn commit(&self) -> StoreResult<()>;
}

/// Consistent point-in-time read view of a page.
#[async_trait]
pub trait PageSnapshot: Send + Sync {
    /// Read one key. An absent key is `Ok(None)`, not an error.
    async fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Read entries under `prefix`, paginated. Pass the returned token back
    /// to continue; a `None` token means the listing is complete.
    async fn entries(
        &self,
        prefix: &[u8],
        token: Option<PageToken>,
    ) -> StoreResult<(Vec<Entry>, Option<PageToken>)>;
}

/// Receiver of live page mutations, scoped to the prefix the snapshot was
/// taken with. Callbacks are synchronous and must not block.
pub trait PageWatcher: Send + Sync {
    /// Keys under the prefix changed to the given values.
    fn on_change(&self, entries: Vec<Entry>);

    /// Keys under the prefix were deleted.
    fn on_delete(&self, keys: Vec<Vec<u8>>);
}

/// Factory the store consults when a commit conflicts.
///
/// Implemented by the ledger client layer; the store asks for the policy
/// first and only requests a resolver when the answer is
/// [`MergePolicy::AutomaticWithFallback`].
#[async_trait]
pub trait ConflictResolverFactory: Send + Sync {
    /// Policy for a page, answered from whoever is currently registered.
    async fn policy(&self, page_id: PageId) -> MergePolicy;

    /// Obtain the resolver endpoint for a page.
    fn new_resolver(&self, page_id: PageId) -> Arc<dyn ConflictResolver>;
}

/// Per-page resolver endpoint.
pub trait ConflictResolver: Send + Sync {
    /// Start a resolve pass over one conflict: `left` is this device's
    /// pending version, `right` the competing remote version, `ancestor`
    /// their last common version. Fire-and-forget; the implementation
    /// sequences passes internally and reports through `provider`.
    fn resolve(
        &self,
        left: Arc<dyn PageSnapshot>,
        right: Arc<dyn PageSnapshot>,
        ancestor: Arc<dyn PageSnapshot>,
        provider: Arc<dyn MergeResultProvider>,
    );
}

/// Store-side handle a resolve pass drives to completion.
#[async_trait]
pub trait MergeResultProvider: Send + Sync {
    /// Fetch the conflicting-entry diff, paginated like
    /// [`PageSnapshot::entries`].
    async fn conflicting_diff(
        &self,
        token: Option<PageToken>,
    ) -> StoreResult<(Vec<DiffEntry>, Option<PageToken>)>;

    /// Ask the store to auto-merge every key touched by only one side.
    async fn merge_non_conflicting(&self) -> StoreResult<()>;

    /// Submit one batch of per-key merge instructions.
    async fn merge(&self, values: Vec<MergedValue>) -> StoreResult<()>;

    /// Signal that this resolve pass is complete.
    async fn done(&self) -> StoreResult<()>;
}
