//! Quire Ledger - page synchronization clients
//!
//! This crate is the client side of the quire substrate: it multiplexes many
//! prefix-scoped feature clients onto shared page connections and resolves
//! the conflicts that concurrent writers produce.
//!
//! - [`LedgerClient`] owns one connection per page and registers itself as
//!   the store's conflict resolver factory.
//! - [`PageClient`] binds one feature to one key prefix of one page: change
//!   and delete notifications, a conflict callback, and an operation queue
//!   for read-your-writes ordering.
//! - The resolver turns the store's three-way conflicts into observer
//!   decisions and merge instructions, one pass per page at a time.
//! - The typed operations in [`calls`] cover the common read/write shapes
//!   with `serde_json` encoding and exactly-once completion callbacks.
//!
//! Features own their clients. The ledger holds only weak references, so a
//! notification or conflict that arrives after a client was dropped is a
//! no-op rather than a use-after-free.

#![forbid(unsafe_code)]

/// Typed page access operations
pub mod calls;

/// Connection multiplexing and conflict-resolver registration
pub mod client;

/// Ledger-layer errors
pub mod error;

/// Prefix-scoped page clients and observers
pub mod page_client;

/// Per-page conflict resolution
pub mod resolver;

pub use calls::{DumpPage, ReadAllData, ReadData, WriteData};
pub use client::{ConflictEvent, LedgerClient};
pub use error::LedgerError;
pub use page_client::{PageClient, PageObserver};
pub use resolver::ResolverConfig;
