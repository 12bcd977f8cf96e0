//! The operation trait and adapters.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;

/// One unit of asynchronous work.
///
/// Implementations are constructed by feature code, handed to a container,
/// and dropped by the container as soon as [`run`] resolves. `run` resolving
/// is the operation's "done" point: a queue will not start the next member
/// before it, so an operation that fans out internal branches must join them
/// before returning (see [`FlowToken`](crate::FlowToken)).
///
/// A remote call that fails is logged and the operation returns early;
/// retries are the calling feature's business, never the container's.
#[async_trait]
pub trait Operation: Send + 'static {
    /// Short name used in scheduling logs.
    fn trace_name(&self) -> &str;

    /// Execute the operation to completion.
    async fn run(&mut self);
}

/// Adapter turning a plain future into an [`Operation`].
///
/// Useful for one-off work that does not deserve a named type. The future is
/// stored unpolled until the container schedules it.
pub struct FutureOperation {
    trace_name: String,
    fut: Option<BoxFuture<'static, ()>>,
}

impl FutureOperation {
    /// Wrap `fut` under the given trace name.
    pub fn new(trace_name: impl Into<String>, fut: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            trace_name: trace_name.into(),
            fut: Some(fut.boxed()),
        }
    }
}

#[async_trait]
impl Operation for FutureOperation {
    fn trace_name(&self) -> &str {
        &self.trace_name
    }

    async fn run(&mut self) {
        if let Some(fut) = self.fut.take() {
            fut.await;
        }
    }
}
