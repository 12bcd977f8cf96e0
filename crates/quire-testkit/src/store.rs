//! In-memory page store.
//!
//! A [`MemoryPageStore`] plays the remote replicated store for tests: pages
//! are chains of immutable full-state commits, connections are per "device",
//! and a commit whose base commit is no longer the head counts as a
//! concurrent write. Non-overlapping concurrent changes merge by union;
//! contested keys either go to the committing side (last one wins) or to the
//! conflict resolver of the committing connection, whichever the policy of
//! that connection's registered factory dictates.
//!
//! Watch deliveries run on one notifier task per store, so they are
//! asynchronous with respect to committers and arrive in commit order.

use async_trait::async_trait;
use parking_lot::Mutex;
use quire_core::{
    ConflictResolverFactory, DiffEntry, DiffSide, Entry, MergePolicy, MergeResultProvider,
    MergedValue, Page, PageId, PageSnapshot, PageStore, PageToken, PageWatcher, StoreError,
    StoreResult, ValueSource,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// Tuning knobs for the in-memory store.
///
/// The defaults keep result pages tiny so pagination loops in the code under
/// test actually iterate.
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Entries returned per [`PageSnapshot::entries`] call.
    pub entries_page_size: usize,
    /// Diff entries returned per conflicting-diff call.
    pub diff_page_size: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            entries_page_size: 2,
            diff_page_size: 2,
        }
    }
}

type State = Arc<BTreeMap<Vec<u8>, Vec<u8>>>;

/// Shared in-process store; one per test, shared by all simulated devices.
///
/// Must be created inside a tokio runtime: watch deliveries run on a spawned
/// notifier task that lives as long as the store.
pub struct MemoryPageStore {
    config: MemoryStoreConfig,
    pages: Mutex<HashMap<PageId, Arc<SharedPage>>>,
    notify_tx: mpsc::UnboundedSender<PageId>,
}

impl MemoryPageStore {
    /// Create a store with default tuning.
    pub fn new() -> Arc<Self> {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a store with explicit tuning.
    pub fn with_config(config: MemoryStoreConfig) -> Arc<Self> {
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let store = Arc::new(Self {
            config,
            pages: Mutex::new(HashMap::new()),
            notify_tx,
        });
        let weak: Weak<MemoryPageStore> = Arc::downgrade(&store);
        tokio::spawn(async move {
            while let Some(page_id) = notify_rx.recv().await {
                let Some(store) = weak.upgrade() else {
                    break;
                };
                store.deliver(page_id);
            }
        });
        store
    }

    /// Open a connection, as one device would.
    ///
    /// Each connection carries its own resolver-factory slot; the factory is
    /// consulted only for conflicting commits issued through that connection.
    pub fn connect(self: &Arc<Self>) -> Arc<dyn PageStore> {
        Arc::new(MemoryConnection {
            inner: Arc::new(ConnState {
                store: self.clone(),
                factory: Mutex::new(None),
            }),
        })
    }

    fn shared_page(&self, id: PageId) -> Arc<SharedPage> {
        self.pages
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(SharedPage::new(id)))
            .clone()
    }

    fn notify(&self, page_id: PageId) {
        let _ = self.notify_tx.send(page_id);
    }

    /// Bring every watcher of a page up to the current head.
    fn deliver(&self, page_id: PageId) {
        let Some(shared) = self.pages.lock().get(&page_id).cloned() else {
            return;
        };
        let mut deliveries = Vec::new();
        {
            let mut guard = shared.state.lock();
            let PageState { commits, watchers } = &mut *guard;
            let head_id = commits.len() - 1;
            let head = commits[head_id].clone();
            watchers.retain_mut(|reg| {
                let Some(watcher) = reg.watcher.upgrade() else {
                    return false;
                };
                if reg.last_seen == head_id {
                    return true;
                }
                let old = commits[reg.last_seen].clone();
                let (changes, deletes) = prefix_delta(&old, &head, &reg.prefix);
                reg.last_seen = head_id;
                if !(changes.is_empty() && deletes.is_empty()) {
                    deliveries.push((watcher, changes, deletes));
                }
                true
            });
        }
        // Callbacks run without any store lock; a watcher may re-enter the
        // client layer, including dropping its own registration.
        for (watcher, changes, deletes) in deliveries {
            if !changes.is_empty() {
                debug!(%page_id, count = changes.len(), "delivering page changes");
                watcher.on_change(changes);
            }
            if !deletes.is_empty() {
                debug!(%page_id, count = deletes.len(), "delivering page deletes");
                watcher.on_delete(deletes);
            }
        }
    }
}

struct ConnState {
    store: Arc<MemoryPageStore>,
    factory: Mutex<Option<Arc<dyn ConflictResolverFactory>>>,
}

struct MemoryConnection {
    inner: Arc<ConnState>,
}

#[async_trait]
impl PageStore for MemoryConnection {
    async fn page(&self, id: PageId) -> StoreResult<Arc<dyn Page>> {
        let shared = self.inner.store.shared_page(id);
        let base = shared.state.lock().commits.len() - 1;
        Ok(Arc::new(MemoryPage {
            conn: self.inner.clone(),
            shared,
            local: Mutex::new(HandleState { base, txn: None }),
        }))
    }

    fn register_resolver_factory(&self, factory: Arc<dyn ConflictResolverFactory>) {
        *self.inner.factory.lock() = Some(factory);
    }
}

/// One logical page, shared by every handle of every connection.
struct SharedPage {
    page_id: PageId,
    state: Mutex<PageState>,
}

impl SharedPage {
    fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            state: Mutex::new(PageState {
                commits: vec![Arc::new(BTreeMap::new())],
                watchers: Vec::new(),
            }),
        }
    }
}

/// Commit chain and watcher registrations. `commits` is never empty; index 0
/// is the empty root and the last element is the head.
struct PageState {
    commits: Vec<State>,
    watchers: Vec<RegisteredWatcher>,
}

/// Watch registration. The watcher is held weakly, so dropping the caller's
/// handle ends the registration; dead entries are pruned on delivery.
struct RegisteredWatcher {
    prefix: Vec<u8>,
    last_seen: usize,
    watcher: Weak<dyn PageWatcher>,
}

/// Writes accumulated before a commit.
#[derive(Default)]
struct Staged {
    puts: BTreeMap<Vec<u8>, Vec<u8>>,
    deletes: BTreeSet<Vec<u8>>,
}

impl Staged {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.deletes.remove(key);
        self.puts.insert(key.to_vec(), value.to_vec());
    }

    fn delete(&mut self, key: &[u8]) {
        self.puts.remove(key);
        self.deletes.insert(key.to_vec());
    }

    fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }

    fn apply_to(&self, state: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
        for (key, value) in &self.puts {
            state.insert(key.clone(), value.clone());
        }
        for key in &self.deletes {
            state.remove(key);
        }
    }

    fn touched_keys(&self) -> BTreeSet<&Vec<u8>> {
        self.puts.keys().chain(self.deletes.iter()).collect()
    }

    /// The subset of this batch whose end state differs from `before`.
    ///
    /// Rewriting a key to the value it already had is not a change; such
    /// keys must not overwrite a concurrent remote write during a union
    /// merge, mirroring how [`conflicting_entries`] ignores them.
    fn changes_since(&self, before: &BTreeMap<Vec<u8>, Vec<u8>>) -> Staged {
        let mut changed = Staged::default();
        for key in self.touched_keys() {
            let prior = before.get(key);
            match self.end_value(key, prior) {
                end if end == prior => {}
                Some(value) => changed.put(key, value),
                None => changed.delete(key),
            }
        }
        changed
    }

    /// What the key looks like after this batch, given its prior value.
    fn end_value<'a>(&'a self, key: &[u8], before: Option<&'a Vec<u8>>) -> Option<&'a Vec<u8>> {
        if self.deletes.contains(key) {
            return None;
        }
        if let Some(value) = self.puts.get(key) {
            return Some(value);
        }
        before
    }
}

struct HandleState {
    base: usize,
    txn: Option<Staged>,
}

struct ConflictInputs {
    head_id: usize,
    ancestor: State,
    right: State,
    conflicting: Vec<DiffEntry>,
}

/// One device's handle to a page. Tracks the last commit this handle has
/// built on, which is what makes stale-base commits detectable.
struct MemoryPage {
    conn: Arc<ConnState>,
    shared: Arc<SharedPage>,
    local: Mutex<HandleState>,
}

impl MemoryPage {
    async fn commit_staged(&self, staged: Staged, base: usize) -> StoreResult<usize> {
        if staged.is_empty() {
            return Ok(base);
        }
        loop {
            let inputs = {
                let mut guard = self.shared.state.lock();
                let state = &mut *guard;
                let head_id = state.commits.len() - 1;
                if base != head_id {
                    let ancestor = state.commits[base].clone();
                    let right = state.commits[head_id].clone();
                    let conflicting = conflicting_entries(&ancestor, &right, &staged);
                    if !conflicting.is_empty() {
                        ConflictInputs {
                            head_id,
                            ancestor,
                            right,
                            conflicting,
                        }
                    } else {
                        // Concurrent but compatible; merge by union. Only the
                        // keys this commit actually changed land on the head,
                        // so touched-but-unchanged keys defer to the remote
                        // side instead of reverting it.
                        let effective = staged.changes_since(&ancestor);
                        if effective.is_empty() {
                            return Ok(head_id);
                        }
                        let new_head = install(state, &effective);
                        drop(guard);
                        self.conn.store.notify(self.shared.page_id);
                        return Ok(new_head);
                    }
                } else {
                    let new_head = install(state, &staged);
                    drop(guard);
                    self.conn.store.notify(self.shared.page_id);
                    return Ok(new_head);
                }
            };

            // Policy lookup is async; it must happen outside the state lock.
            let factory = self.conn.factory.lock().clone();
            let policy = match &factory {
                Some(factory) => factory.policy(self.shared.page_id).await,
                None => MergePolicy::LastOneWins,
            };
            let Some(factory) =
                factory.filter(|_| policy == MergePolicy::AutomaticWithFallback)
            else {
                let mut guard = self.shared.state.lock();
                let state = &mut *guard;
                if state.commits.len() - 1 != inputs.head_id {
                    // The head moved while we were asking for the policy;
                    // redo the conflict computation against the new head.
                    continue;
                }
                debug!(
                    page_id = %self.shared.page_id,
                    keys = inputs.conflicting.len(),
                    "conflicting commit, last one wins"
                );
                let new_head = install(state, &staged);
                drop(guard);
                self.conn.store.notify(self.shared.page_id);
                return Ok(new_head);
            };

            debug!(
                page_id = %self.shared.page_id,
                keys = inputs.conflicting.len(),
                "conflicting commit, invoking resolver"
            );
            let mut left = (*inputs.ancestor).clone();
            staged.apply_to(&mut left);
            let left: State = Arc::new(left);

            let provider: Arc<dyn MergeResultProvider> = Arc::new(MemoryMergeProvider::new(
                self.shared.clone(),
                self.conn.store.clone(),
                inputs.head_id,
                &left,
                inputs.right.clone(),
                &inputs.ancestor,
                inputs.conflicting,
            ));
            let page_size = self.conn.store.config.entries_page_size;
            let resolver = factory.new_resolver(self.shared.page_id);
            resolver.resolve(
                Arc::new(MemorySnapshot::new(left, Vec::new(), page_size)),
                Arc::new(MemorySnapshot::new(inputs.right, Vec::new(), page_size)),
                Arc::new(MemorySnapshot::new(inputs.ancestor, Vec::new(), page_size)),
                provider,
            );
            // The commit is recorded as pending; the merge lands when the
            // resolver drives the provider to done.
            return Ok(inputs.head_id);
        }
    }
}

#[async_trait]
impl Page for MemoryPage {
    fn id(&self) -> PageId {
        self.shared.page_id
    }

    async fn snapshot(
        &self,
        prefix: &[u8],
        watcher: Option<Arc<dyn PageWatcher>>,
    ) -> StoreResult<Arc<dyn PageSnapshot>> {
        let mut state = self.shared.state.lock();
        let head_id = state.commits.len() - 1;
        let head = state.commits[head_id].clone();
        if let Some(watcher) = watcher {
            state.watchers.push(RegisteredWatcher {
                prefix: prefix.to_vec(),
                last_seen: head_id,
                watcher: Arc::downgrade(&watcher),
            });
        }
        Ok(Arc::new(MemorySnapshot::new(
            head,
            prefix.to_vec(),
            self.conn.store.config.entries_page_size,
        )))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let base = {
            let mut local = self.local.lock();
            if let Some(txn) = local.txn.as_mut() {
                txn.put(key, value);
                return Ok(());
            }
            local.base
        };
        let mut staged = Staged::default();
        staged.put(key, value);
        let new_base = self.commit_staged(staged, base).await?;
        self.local.lock().base = new_base;
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StoreResult<()> {
        let base = {
            let mut local = self.local.lock();
            if let Some(txn) = local.txn.as_mut() {
                txn.delete(key);
                return Ok(());
            }
            local.base
        };
        let mut staged = Staged::default();
        staged.delete(key);
        let new_base = self.commit_staged(staged, base).await?;
        self.local.lock().base = new_base;
        Ok(())
    }

    async fn begin_transaction(&self) -> StoreResult<()> {
        let mut local = self.local.lock();
        if local.txn.is_some() {
            return Err(StoreError::invalid_transaction(
                "transaction already in progress",
            ));
        }
        local.txn = Some(Staged::default());
        Ok(())
    }

    async fn commit(&self) -> StoreResult<()> {
        let (staged, base) = {
            let mut local = self.local.lock();
            let staged = local
                .txn
                .take()
                .ok_or_else(|| StoreError::invalid_transaction("commit without begin_transaction"))?;
            (staged, local.base)
        };
        let new_base = self.commit_staged(staged, base).await?;
        self.local.lock().base = new_base;
        Ok(())
    }
}

/// Frozen view of one commit, optionally restricted to a key prefix.
struct MemorySnapshot {
    state: State,
    prefix: Vec<u8>,
    page_size: usize,
}

impl MemorySnapshot {
    fn new(state: State, prefix: Vec<u8>, page_size: usize) -> Self {
        Self {
            state,
            prefix,
            page_size,
        }
    }
}

#[async_trait]
impl PageSnapshot for MemorySnapshot {
    async fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        if !key.starts_with(&self.prefix) {
            return Ok(None);
        }
        Ok(self.state.get(key).cloned())
    }

    async fn entries(
        &self,
        prefix: &[u8],
        token: Option<PageToken>,
    ) -> StoreResult<(Vec<Entry>, Option<PageToken>)> {
        let filtered: Vec<Entry> = self
            .state
            .iter()
            .filter(|(key, _)| key.starts_with(&self.prefix) && key.starts_with(prefix))
            .map(|(key, value)| Entry::new(key.clone(), value.clone()))
            .collect();
        Ok(page_slice(&filtered, token, self.page_size))
    }
}

/// Store-side state of one pending conflicted commit.
///
/// The working state starts as the left (committing) side, so keys the
/// resolve pass never touches keep the left value. `done` freezes the
/// working state into the next head commit, replaying it as a delta when
/// other commits landed mid-pass.
struct MemoryMergeProvider {
    shared: Arc<SharedPage>,
    store: Arc<MemoryPageStore>,
    /// Head commit the conflict was computed against.
    base: usize,
    merged: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    right: State,
    right_changes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
    diff: Vec<DiffEntry>,
    finished: AtomicBool,
}

impl MemoryMergeProvider {
    fn new(
        shared: Arc<SharedPage>,
        store: Arc<MemoryPageStore>,
        base: usize,
        left: &State,
        right: State,
        ancestor: &State,
        diff: Vec<DiffEntry>,
    ) -> Self {
        let contested: BTreeSet<Vec<u8>> = diff.iter().map(|entry| entry.key.clone()).collect();
        let mut right_changes = Vec::new();
        for key in changed_keys(ancestor, &right) {
            if contested.contains(&key) {
                continue;
            }
            let value = right.get(&key).cloned();
            right_changes.push((key, value));
        }
        Self {
            shared,
            store,
            base,
            merged: Mutex::new((**left).clone()),
            right,
            right_changes,
            diff,
            finished: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MergeResultProvider for MemoryMergeProvider {
    async fn conflicting_diff(
        &self,
        token: Option<PageToken>,
    ) -> StoreResult<(Vec<DiffEntry>, Option<PageToken>)> {
        Ok(page_slice(&self.diff, token, self.store.config.diff_page_size))
    }

    async fn merge_non_conflicting(&self) -> StoreResult<()> {
        let mut merged = self.merged.lock();
        for (key, value) in &self.right_changes {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(())
    }

    async fn merge(&self, values: Vec<MergedValue>) -> StoreResult<()> {
        let mut merged = self.merged.lock();
        for value in values {
            match value.source {
                ValueSource::Right => match self.right.get(&value.key) {
                    Some(bytes) => {
                        merged.insert(value.key, bytes.clone());
                    }
                    None => {
                        merged.remove(&value.key);
                    }
                },
                ValueSource::New => match value.new_value {
                    Some(bytes) => {
                        merged.insert(value.key, bytes);
                    }
                    None => {
                        return Err(StoreError::internal(
                            "merge instruction with source New carries no value",
                        ));
                    }
                },
                ValueSource::Delete => {
                    merged.remove(&value.key);
                }
            }
        }
        Ok(())
    }

    async fn done(&self) -> StoreResult<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let merged = self.merged.lock().clone();
        {
            let mut state = self.shared.state.lock();
            let head_id = state.commits.len() - 1;
            if head_id == self.base {
                state.commits.push(Arc::new(merged));
            } else {
                // Commits can land while the pass is in flight. Replay the
                // merge as a delta against the head it was computed from,
                // so the interleaved commits survive.
                let mut next = (*state.commits[head_id]).clone();
                for key in changed_keys(&state.commits[self.base], &merged) {
                    match merged.get(&key) {
                        Some(value) => {
                            next.insert(key, value.clone());
                        }
                        None => {
                            next.remove(&key);
                        }
                    }
                }
                state.commits.push(Arc::new(next));
            }
        }
        debug!(page_id = %self.shared.page_id, "merge commit installed");
        self.store.notify(self.shared.page_id);
        Ok(())
    }
}

/// Apply `staged` on top of the head and advance it.
fn install(state: &mut PageState, staged: &Staged) -> usize {
    let head = state.commits.len() - 1;
    let mut next = (*state.commits[head]).clone();
    staged.apply_to(&mut next);
    state.commits.push(Arc::new(next));
    state.commits.len() - 1
}

/// Keys whose value-or-absence differs between the two states.
fn changed_keys(old: &BTreeMap<Vec<u8>, Vec<u8>>, new: &BTreeMap<Vec<u8>, Vec<u8>>) -> BTreeSet<Vec<u8>> {
    let mut keys = BTreeSet::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            keys.insert(key.clone());
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            keys.insert(key.clone());
        }
    }
    keys
}

/// Changes and deletions from `old` to `new`, restricted to `prefix`.
fn prefix_delta(
    old: &BTreeMap<Vec<u8>, Vec<u8>>,
    new: &BTreeMap<Vec<u8>, Vec<u8>>,
    prefix: &[u8],
) -> (Vec<Entry>, Vec<Vec<u8>>) {
    let mut changes = Vec::new();
    let mut deletes = Vec::new();
    for (key, value) in new {
        if !key.starts_with(prefix) {
            continue;
        }
        if old.get(key) != Some(value) {
            changes.push(Entry::new(key.clone(), value.clone()));
        }
    }
    for key in old.keys() {
        if key.starts_with(prefix) && !new.contains_key(key) {
            deletes.push(key.clone());
        }
    }
    (changes, deletes)
}

/// Contested keys of a stale-base commit: changed on both sides since the
/// ancestor, with different end states. Both sides landing on the same value
/// is not a conflict.
fn conflicting_entries(
    ancestor: &BTreeMap<Vec<u8>, Vec<u8>>,
    right: &BTreeMap<Vec<u8>, Vec<u8>>,
    staged: &Staged,
) -> Vec<DiffEntry> {
    let right_changed = changed_keys(ancestor, right);
    let mut entries = Vec::new();
    for key in staged.touched_keys() {
        let before = ancestor.get(key);
        let left_end = staged.end_value(key, before);
        if left_end == before {
            continue;
        }
        if !right_changed.contains(key) {
            continue;
        }
        let right_end = right.get(key);
        if left_end == right_end {
            continue;
        }
        entries.push(DiffEntry {
            key: key.clone(),
            left: to_side(left_end),
            right: to_side(right_end),
        });
    }
    entries
}

fn to_side(end: Option<&Vec<u8>>) -> DiffSide {
    match end {
        Some(value) => DiffSide::wrote(value.clone()),
        None => DiffSide::removed(),
    }
}

fn page_slice<T: Clone>(
    items: &[T],
    token: Option<PageToken>,
    page_size: usize,
) -> (Vec<T>, Option<PageToken>) {
    let start = token.map_or(0, |t| t.0 as usize).min(items.len());
    let end = (start + page_size.max(1)).min(items.len());
    let chunk = items[start..end].to_vec();
    let next = (end < items.len()).then(|| PageToken(end as u64));
    (chunk, next)
}
