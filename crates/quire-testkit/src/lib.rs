//! Quire Testkit - shared test infrastructure
//!
//! The centerpiece is [`MemoryPageStore`], an in-process stand-in for the
//! remote page store: one store per test, one connection per simulated
//! device, stale-base conflict detection, and watch deliveries on a
//! background task. [`fixtures`] holds the small helpers most tests want:
//! deterministic page ids, condition polling, and tracing setup.
//!
//! This crate is a dev-dependency only; it never ships.

#![forbid(unsafe_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

/// Deterministic ids, polling, and recording fixtures
pub mod fixtures;

/// In-memory page store backend
pub mod store;

pub use fixtures::{init_tracing, test_page_id, wait_until, RecordingWatcher};
pub use store::{MemoryPageStore, MemoryStoreConfig};
