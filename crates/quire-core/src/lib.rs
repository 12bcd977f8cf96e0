//! Quire Core - shared types and the page store contract
//!
//! This crate defines the vocabulary of the quire substrate: page
//! identifiers, entry and conflict data types, the error taxonomy, and the
//! abstract contract of the remote page store. It contains no runtime logic;
//! connection handling lives in `quire-ledger` and backends (including the
//! in-memory store used by tests) implement the traits declared here.
//!
//! A **page** is a remote, versioned, replicated key→bytes mapping that many
//! devices write concurrently. Everything above this crate is written against
//! `Arc<dyn Page>` and friends, never against a concrete backend.

#![forbid(unsafe_code)]

/// Page and client identifiers
pub mod ids;

/// Unified error handling for store interactions
pub mod error;

/// Conflict descriptions and merge instructions
pub mod conflict;

/// Pure page store interfaces (no implementations)
pub mod store;

pub use conflict::{
    Conflict, ConflictResolution, DiffEntry, DiffSide, MergePolicy, MergedValue, ValueSource,
};
pub use error::{StoreError, StoreResult};
pub use ids::PageId;
pub use store::{
    ConflictResolver, ConflictResolverFactory, Entry, MergeResultProvider, Page, PageSnapshot,
    PageStore, PageToken, PageWatcher,
};
