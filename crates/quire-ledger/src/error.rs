//! Ledger-layer errors.

use quire_core::StoreError;
use quire_tasks::QueueError;

/// Errors surfaced by the ledger client layer.
///
/// Most store failures never reach feature code as values: operations log
/// them and stop. This type covers the few entry points that do return
/// results, such as client construction and durability barriers.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A page store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The client's operation queue is shut down.
    #[error(transparent)]
    Queue(#[from] QueueError),
}
