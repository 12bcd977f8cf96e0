//! Quire Tasks - asynchronous operation containers
//!
//! Every feature built on the quire substrate performs its work as
//! short-lived [`Operation`]s: one unit of asynchronous work, run to
//! completion inside a container, then dropped. Two containers exist:
//!
//! - [`OperationQueue`] runs members strictly one at a time in FIFO order.
//!   Routing all reads and writes for one logical entity through one queue is
//!   what gives a feature read-your-writes consistency against its page.
//! - [`OperationCollection`] runs members concurrently with no ordering
//!   guarantee, for fan-out work nested inside a single operation.
//!
//! Lifetime and cancellation are ownership-driven. A container owns its
//! operations; dropping the container cancels the in-flight operation at its
//! next suspension point and discards the rest. There is no separate cancel
//! API. Work that must produce a result even on early-return paths stages it
//! in a [`FlowToken`], which fires its completion exactly once when the last
//! clone is dropped.

#![forbid(unsafe_code)]

/// The operation trait and adapters
pub mod operation;

/// Serialized FIFO container
pub mod queue;

/// Concurrent unordered container
pub mod collection;

/// Drop-fired completion guards
pub mod flow;

pub use collection::OperationCollection;
pub use flow::{FlowToken, FlowWaiter};
pub use operation::{FutureOperation, Operation};
pub use queue::{OperationQueue, QueueError};
