//! Connection multiplexing and conflict-resolver registration.
//!
//! [`LedgerClient`] is the per-process owner of page connections. Every
//! [`PageClient`](crate::PageClient) of a page shares one connection, created
//! lazily on first request and closed when the last client goes away. The
//! ledger client also answers the store's conflict questions: which merge
//! policy applies to a page, and which resolver handles its conflicts.

use crate::page_client::ClientShared;
use crate::resolver::{PageResolver, ResolverConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use quire_core::{
    ConflictResolver, ConflictResolverFactory, MergePolicy, MergeResultProvider, Page, PageId,
    PageSnapshot, PageStore, StoreResult,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const CONFLICT_EVENT_CAPACITY: usize = 64;

/// Notification that a conflict resolution pass for a page finished.
///
/// Carries counts only; per-key detail stays between the store and the
/// observers that resolved the keys.
#[derive(Debug, Clone)]
pub struct ConflictEvent {
    /// Page the pass ran for.
    pub page_id: PageId,
    /// Merge instructions submitted by this pass.
    pub resolved: usize,
    /// Conflicting keys left for a later pass.
    pub skipped: usize,
}

/// One shared connection to a page, with its observers in registration
/// order. At most one exists per page id per ledger client.
struct PageConnection {
    page_id: PageId,
    page: Arc<dyn Page>,
    clients: Vec<Weak<ClientShared>>,
}

pub(crate) struct LedgerInner {
    store: Arc<dyn PageStore>,
    config: ResolverConfig,
    connections: Mutex<Vec<PageConnection>>,
    resolvers: Mutex<HashMap<PageId, Arc<PageResolver>>>,
    conflict_events: broadcast::Sender<ConflictEvent>,
}

impl LedgerInner {
    async fn get_page(&self, client: &Arc<ClientShared>) -> StoreResult<Arc<dyn Page>> {
        if let Some(page) = self.join_existing(client) {
            return Ok(page);
        }

        let page = self.store.page(client.page_id).await?;

        // Another client may have opened the connection while we were
        // waiting on the store; the re-check and insert share one lock so
        // the one-connection-per-page invariant holds.
        let mut connections = self.connections.lock();
        if let Some(conn) = connections.iter_mut().find(|c| c.page_id == client.page_id) {
            conn.clients.push(Arc::downgrade(client));
            return Ok(conn.page.clone());
        }
        info!(page_id = %client.page_id, context = %client.context, "opening page connection");
        connections.push(PageConnection {
            page_id: client.page_id,
            page: page.clone(),
            clients: vec![Arc::downgrade(client)],
        });
        Ok(page)
    }

    fn join_existing(&self, client: &Arc<ClientShared>) -> Option<Arc<dyn Page>> {
        let mut connections = self.connections.lock();
        let conn = connections
            .iter_mut()
            .find(|c| c.page_id == client.page_id)?;
        debug!(page_id = %client.page_id, context = %client.context, "joining existing page connection");
        conn.clients.push(Arc::downgrade(client));
        Some(conn.page.clone())
    }

    fn drop_client(&self, client_id: u64) {
        let mut closed = Vec::new();
        {
            let mut connections = self.connections.lock();
            for conn in connections.iter_mut() {
                conn.clients
                    .retain(|weak| weak.upgrade().is_some_and(|shared| shared.id != client_id));
            }
            connections.retain(|conn| {
                if conn.clients.is_empty() {
                    closed.push(conn.page_id);
                    false
                } else {
                    true
                }
            });
        }
        if closed.is_empty() {
            return;
        }

        let mut resolvers = self.resolvers.lock();
        for page_id in closed {
            if resolvers.remove(&page_id).is_some() {
                info!(%page_id, "cleared conflict resolver registration");
            }
            info!(%page_id, "closed page connection");
        }
    }

    /// Live clients of a page, in registration order.
    pub(crate) fn clients_for(&self, page_id: PageId) -> Vec<Arc<ClientShared>> {
        let connections = self.connections.lock();
        connections
            .iter()
            .find(|c| c.page_id == page_id)
            .map(|c| c.clients.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    fn policy_for(&self, page_id: PageId) -> MergePolicy {
        let has_live_client = {
            let connections = self.connections.lock();
            connections
                .iter()
                .find(|c| c.page_id == page_id)
                .is_some_and(|c| c.clients.iter().any(|w| w.upgrade().is_some()))
        };
        if has_live_client {
            MergePolicy::AutomaticWithFallback
        } else {
            MergePolicy::LastOneWins
        }
    }

    pub(crate) fn resolver_for(self: &Arc<Self>, page_id: PageId) -> Arc<PageResolver> {
        let mut resolvers = self.resolvers.lock();
        resolvers
            .entry(page_id)
            .or_insert_with(|| {
                debug!(%page_id, "creating conflict resolver");
                Arc::new(PageResolver::new(
                    page_id,
                    Arc::downgrade(self),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    pub(crate) fn publish_conflict(&self, event: ConflictEvent) {
        debug!(
            page_id = %event.page_id,
            resolved = event.resolved,
            skipped = event.skipped,
            "conflict resolution pass finished"
        );
        let _ = self.conflict_events.send(event);
    }
}

/// Per-process owner of page connections and resolver registrations.
///
/// Cheap to clone; clones share the connection table. Construction registers
/// the ledger client as the store connection's conflict resolver factory, so
/// the merge policy of a page follows its client registrations: pages with
/// at least one live [`PageClient`](crate::PageClient) get custom resolution,
/// pages nobody listens to fall back to last-one-wins. A client registered
/// only after a page's first conflicting write misses that conflict; this
/// layer does not reorder time.
#[derive(Clone)]
pub struct LedgerClient {
    inner: Arc<LedgerInner>,
}

impl LedgerClient {
    /// Create a ledger client over a store connection.
    pub fn new(store: Arc<dyn PageStore>) -> Self {
        Self::with_config(store, ResolverConfig::default())
    }

    /// Create a ledger client with explicit resolver tuning.
    pub fn with_config(store: Arc<dyn PageStore>, config: ResolverConfig) -> Self {
        let (conflict_events, _) = broadcast::channel(CONFLICT_EVENT_CAPACITY);
        let inner = Arc::new(LedgerInner {
            store: store.clone(),
            config,
            connections: Mutex::new(Vec::new()),
            resolvers: Mutex::new(HashMap::new()),
            conflict_events,
        });
        store.register_resolver_factory(Arc::new(LedgerFactory {
            inner: Arc::downgrade(&inner),
        }));
        info!("ledger client registered as conflict resolver factory");
        Self { inner }
    }

    /// Subscribe to completed conflict resolution passes, across all pages
    /// this ledger client manages.
    pub fn watch_conflicts(&self) -> broadcast::Receiver<ConflictEvent> {
        self.inner.conflict_events.subscribe()
    }

    pub(crate) async fn get_page(&self, client: &Arc<ClientShared>) -> StoreResult<Arc<dyn Page>> {
        self.inner.get_page(client).await
    }

    pub(crate) fn drop_page_client(&self, client_id: u64) {
        self.inner.drop_client(client_id);
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<LedgerInner> {
        &self.inner
    }
}

/// Weak factory handed to the store; keeps the store from owning the ledger.
struct LedgerFactory {
    inner: Weak<LedgerInner>,
}

#[async_trait]
impl ConflictResolverFactory for LedgerFactory {
    async fn policy(&self, page_id: PageId) -> MergePolicy {
        match self.inner.upgrade() {
            Some(inner) => inner.policy_for(page_id),
            None => MergePolicy::LastOneWins,
        }
    }

    fn new_resolver(&self, page_id: PageId) -> Arc<dyn ConflictResolver> {
        match self.inner.upgrade() {
            Some(inner) => inner.resolver_for(page_id),
            None => {
                warn!(%page_id, "resolver requested after ledger client shutdown");
                Arc::new(DetachedResolver)
            }
        }
    }
}

/// Resolver handed out after the owning ledger client is gone; drives the
/// pass straight to done so the store is not left waiting on it.
struct DetachedResolver;

impl ConflictResolver for DetachedResolver {
    fn resolve(
        &self,
        _left: Arc<dyn PageSnapshot>,
        _right: Arc<dyn PageSnapshot>,
        _ancestor: Arc<dyn PageSnapshot>,
        provider: Arc<dyn MergeResultProvider>,
    ) {
        tokio::spawn(async move {
            if let Err(err) = provider.merge_non_conflicting().await {
                warn!(error = %err, "detached resolve pass failed to auto-merge");
            }
            if let Err(err) = provider.done().await {
                warn!(error = %err, "detached resolve pass failed to finish");
            }
        });
    }
}
