//! Serialized FIFO operation container.

use crate::operation::Operation;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Errors surfaced by queue callers.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue's worker is gone; nothing enqueued will ever run.
    #[error("operation queue is shut down")]
    Closed,
}

enum QueueItem {
    Run(Box<dyn Operation>),
    Barrier(oneshot::Sender<()>),
}

/// Runs operations strictly one at a time, in enqueue order.
///
/// The next operation starts only after the current one's `run` future has
/// resolved, so members never overlap. All reads and writes for one logical
/// entity are expected to go through one queue; that is what makes a
/// feature's reads observe its own earlier writes.
///
/// Dropping the queue aborts the worker task: the in-flight operation is
/// cancelled at its next suspension point and queued operations never start.
pub struct OperationQueue {
    name: String,
    tx: mpsc::UnboundedSender<QueueItem>,
    worker: JoinHandle<()>,
}

impl OperationQueue {
    /// Create a queue and spawn its worker task.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(name.clone(), rx));
        Self { name, tx, worker }
    }

    /// Name used in scheduling logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue an operation. Execution order is enqueue order.
    pub fn enqueue(&self, op: impl Operation) {
        self.enqueue_boxed(Box::new(op));
    }

    /// Enqueue an already-boxed operation.
    pub fn enqueue_boxed(&self, op: Box<dyn Operation>) {
        let trace_name = op.trace_name().to_owned();
        if self.tx.send(QueueItem::Run(op)).is_err() {
            warn!(queue = %self.name, op = %trace_name, "enqueue after shutdown, dropping operation");
        }
    }

    /// A future that resolves once every operation enqueued before this call
    /// has completed. This is the durability barrier for features that need
    /// to know their prior writes were fully applied.
    pub fn barrier(&self) -> impl Future<Output = Result<(), QueueError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let enqueued = self.tx.send(QueueItem::Barrier(tx)).is_ok();
        async move {
            if !enqueued {
                return Err(QueueError::Closed);
            }
            rx.await.map_err(|_| QueueError::Closed)
        }
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(name: String, mut rx: mpsc::UnboundedReceiver<QueueItem>) {
    while let Some(item) = rx.recv().await {
        match item {
            QueueItem::Run(mut op) => {
                debug!(queue = %name, op = op.trace_name(), "operation start");
                op.run().await;
                debug!(queue = %name, op = op.trace_name(), "operation done");
            }
            QueueItem::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::FutureOperation;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn recording_op(
        label: usize,
        log: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    ) -> FutureOperation {
        FutureOperation::new(format!("op-{label}"), async move {
            log.lock().push(format!("start-{label}"));
            tokio::time::sleep(delay).await;
            log.lock().push(format!("end-{label}"));
        })
    }

    #[tokio::test]
    async fn executes_in_enqueue_order_without_overlap() {
        let queue = OperationQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        // Later operations sleep less, so any overlap would reorder the log.
        for (label, millis) in [(0, 30u64), (1, 20), (2, 10)] {
            queue.enqueue(recording_op(label, log.clone(), Duration::from_millis(millis)));
        }
        queue.barrier().await.expect("queue alive");

        let events = log.lock().clone();
        assert_eq!(
            events,
            vec!["start-0", "end-0", "start-1", "end-1", "start-2", "end-2"]
        );
    }

    #[tokio::test]
    async fn barrier_resolves_after_prior_operations() {
        let queue = OperationQueue::new("barrier");
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.enqueue(recording_op(0, log.clone(), Duration::from_millis(15)));

        queue.barrier().await.expect("queue alive");
        assert_eq!(log.lock().len(), 2, "operation finished before barrier");
    }

    #[tokio::test]
    async fn dropping_queue_fails_pending_barrier() {
        let queue = OperationQueue::new("dropped");
        queue.enqueue(FutureOperation::new("stall", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }));
        let barrier = queue.barrier();
        drop(queue);

        assert_matches!(barrier.await, Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn dropping_queue_cancels_in_flight_operation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = OperationQueue::new("cancel");
        queue.enqueue(recording_op(0, log.clone(), Duration::from_secs(60)));

        // Let the worker reach the operation's suspension point.
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(queue);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let events = log.lock().clone();
        assert_eq!(events, vec!["start-0"], "end never recorded after abort");
    }
}
