//! Unordered operation container.

use crate::operation::Operation;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Runs operations concurrently with no ordering between members.
///
/// Use this for independent work items where FIFO serialization would only
/// add latency. The collection owns its members' lifetime: dropping it aborts
/// every operation that has not yet finished.
pub struct OperationCollection {
    name: String,
    set: JoinSet<()>,
}

impl OperationCollection {
    /// Create an empty collection with the given trace name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            set: JoinSet::new(),
        }
    }

    /// Name used in scheduling logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add an operation. It starts running immediately on the runtime.
    pub fn add(&mut self, op: impl Operation) {
        self.add_boxed(Box::new(op));
    }

    /// Add an already-boxed operation.
    pub fn add_boxed(&mut self, mut op: Box<dyn Operation>) {
        debug!(collection = %self.name, op = op.trace_name(), "operation added");
        self.set.spawn(async move {
            op.run().await;
        });
    }

    /// Number of operations not yet known to have finished.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Whether no member is still running.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Wait for every current member to finish, returning how many ran to
    /// completion. Panicked members are logged and skipped.
    pub async fn join(&mut self) -> usize {
        let mut completed = 0;
        while let Some(outcome) = self.set.join_next().await {
            match outcome {
                Ok(()) => completed += 1,
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    warn!(collection = %self.name, error = %err, "operation panicked");
                }
            }
        }
        completed
    }
}
