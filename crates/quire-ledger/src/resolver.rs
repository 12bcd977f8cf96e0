//! Per-page conflict resolution.
//!
//! The store reports a conflict as three snapshots (local, remote, common
//! ancestor) plus a result provider. The resolve pass never reads the
//! snapshots: the provider's conflicting diff already carries both sides of
//! every contested key. The pass fans the keys out to registered observers,
//! translates their decisions into merge instructions, and drives the
//! provider to done even when individual steps fail. Keys nobody claims are
//! left alone; the store surfaces them again on the next change.

use crate::client::{ConflictEvent, LedgerInner};
use async_trait::async_trait;
use quire_core::{
    Conflict, ConflictResolution, ConflictResolver, DiffEntry, MergeResultProvider, MergedValue,
    PageId, PageSnapshot, StoreResult,
};
use quire_tasks::{Operation, OperationQueue};
use std::sync::{Arc, Weak};
use tracing::warn;

/// Tuning for conflict resolution passes.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Maximum merge instructions submitted per store call.
    pub merge_batch_size: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            merge_batch_size: 16,
        }
    }
}

/// Conflict resolver for one page.
///
/// Owns an operation queue, so at most one resolve pass per page is active
/// at a time and passes run in the order the store reported them.
pub(crate) struct PageResolver {
    page_id: PageId,
    ledger: Weak<LedgerInner>,
    config: ResolverConfig,
    passes: OperationQueue,
}

impl PageResolver {
    pub(crate) fn new(page_id: PageId, ledger: Weak<LedgerInner>, config: ResolverConfig) -> Self {
        Self {
            page_id,
            ledger,
            config,
            passes: OperationQueue::new(format!("resolve:{page_id}")),
        }
    }
}

impl ConflictResolver for PageResolver {
    fn resolve(
        &self,
        _left: Arc<dyn PageSnapshot>,
        _right: Arc<dyn PageSnapshot>,
        _ancestor: Arc<dyn PageSnapshot>,
        provider: Arc<dyn MergeResultProvider>,
    ) {
        self.passes.enqueue(ResolvePass {
            page_id: self.page_id,
            ledger: self.ledger.clone(),
            provider,
            merge_batch_size: self.config.merge_batch_size.max(1),
        });
    }
}

/// One resolve pass over one reported conflict.
struct ResolvePass {
    page_id: PageId,
    ledger: Weak<LedgerInner>,
    provider: Arc<dyn MergeResultProvider>,
    merge_batch_size: usize,
}

#[async_trait]
impl Operation for ResolvePass {
    fn trace_name(&self) -> &str {
        "resolve_pass"
    }

    async fn run(&mut self) {
        // The conflicting diff and the auto-merge of keys touched by only
        // one side are independent store calls; issue both and wait for both.
        let (diff, auto) = futures::join!(
            accumulate_diff(self.provider.as_ref()),
            self.provider.merge_non_conflicting(),
        );
        if let Err(err) = auto {
            warn!(page_id = %self.page_id, error = %err, "auto-merge of non-conflicting keys failed");
        }
        let entries = match diff {
            Ok(entries) => entries,
            Err(err) => {
                warn!(page_id = %self.page_id, error = %err, "conflicting diff failed");
                Vec::new()
            }
        };

        // Snapshot the routing table before any callback runs; an observer
        // may drop its own client while handling a conflict.
        let clients = match self.ledger.upgrade() {
            Some(inner) => inner.clients_for(self.page_id),
            None => Vec::new(),
        };

        let mut instructions = Vec::new();
        let mut skipped = 0usize;
        for entry in &entries {
            // First registered prefix match wins, not the longest one.
            let matching = clients
                .iter()
                .find(|client| entry.key.starts_with(client.prefix.as_slice()));
            let Some(client) = matching else {
                warn!(page_id = %self.page_id, "conflicting key has no observer, leaving unresolved");
                skipped += 1;
                continue;
            };

            let mut conflict = Conflict::from_diff(entry);
            client.observer.on_page_conflict(&mut conflict);
            match conflict.resolution {
                ConflictResolution::Left => {}
                ConflictResolution::Right => {
                    instructions.push(MergedValue::take_right(conflict.key));
                }
                ConflictResolution::Merge if conflict.merged_is_deleted => {
                    instructions.push(MergedValue::delete(conflict.key));
                }
                ConflictResolution::Merge => match conflict.merged {
                    Some(value) => instructions.push(MergedValue::new_value(conflict.key, value)),
                    None => {
                        warn!(
                            page_id = %self.page_id,
                            context = %client.context,
                            "merge chosen without a merged value, skipping key"
                        );
                        skipped += 1;
                    }
                },
            }
        }

        let resolved = instructions.len();
        while !instructions.is_empty() {
            let take = self.merge_batch_size.min(instructions.len());
            let batch: Vec<MergedValue> = instructions.drain(..take).collect();
            if let Err(err) = self.provider.merge(batch).await {
                warn!(page_id = %self.page_id, error = %err, "merge submission failed");
            }
        }

        if let Err(err) = self.provider.done().await {
            warn!(page_id = %self.page_id, error = %err, "failed to finish resolve pass");
        }
        if let Some(inner) = self.ledger.upgrade() {
            inner.publish_conflict(ConflictEvent {
                page_id: self.page_id,
                resolved,
                skipped,
            });
        }
    }
}

/// Pull the conflicting diff until the store reports the stream exhausted.
async fn accumulate_diff(provider: &dyn MergeResultProvider) -> StoreResult<Vec<DiffEntry>> {
    let mut entries = Vec::new();
    let mut token = None;
    loop {
        let (chunk, next) = provider.conflicting_diff(token).await?;
        entries.extend(chunk);
        match next {
            Some(next) => token = Some(next),
            None => return Ok(entries),
        }
    }
}
