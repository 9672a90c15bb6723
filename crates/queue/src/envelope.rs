//! Task envelopes and completion handles.
//!
//! Every queue carries its work as an envelope: the operation plus a
//! single-use [`Completion`]. The submitter keeps the matching
//! [`TaskHandle`]. Because `Completion::resolve` consumes the completion,
//! a handle can never be resolved twice; a completion dropped without being
//! resolved surfaces to the handle as [`TaskError::Closed`], so a handle is
//! never left pending once its envelope is gone.

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::future::BoxFuture;
use proofbot_common::{AppError, AppResult};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::stats::QueueStats;

/// Type-erased task output. Queues are not generic over their results.
pub(crate) type TaskOutput = Box<dyn Any + Send>;

type Resolution = Result<TaskOutput, TaskError>;

/// Failure observed through a [`TaskHandle`].
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The operation ran and returned an error.
    #[error(transparent)]
    Failed(AppError),

    /// The operation panicked. The worker survived.
    #[error("Task panicked: {0}")]
    Panicked(String),

    /// The queue shut down before the task ran.
    #[error("Queue {queue} closed before the task ran")]
    Closed {
        /// Name of the queue.
        queue: &'static str,
    },
}

impl TaskError {
    /// Cooldown advised by the remote service, when the failure was a
    /// rate-limit rejection.
    #[must_use]
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Self::Failed(err) => err.retry_after_ms().map(std::time::Duration::from_millis),
            _ => None,
        }
    }

    /// Whether the task never ran because its queue was closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

impl From<TaskError> for AppError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Failed(inner) => inner,
            TaskError::Panicked(msg) => Self::Internal(format!("Task panicked: {msg}")),
            TaskError::Closed { queue } => Self::Queue(format!("Queue {queue} is closed")),
        }
    }
}

/// Worker-side half of a task: resolves the submitter's handle exactly once.
pub(crate) struct Completion {
    tx: oneshot::Sender<Resolution>,
    queue: &'static str,
}

impl Completion {
    /// Resolve the handle. A submitter that dropped its handle is ignored.
    pub(crate) fn resolve(self, result: Resolution) {
        let _ = self.tx.send(result);
    }

    /// Resolve the handle as closed without running the task.
    pub(crate) fn reject(self) {
        let queue = self.queue;
        self.resolve(Err(TaskError::Closed { queue }));
    }
}

/// Create a linked completion and handle.
pub(crate) fn completion<T>(queue: &'static str) -> (Completion, TaskHandle<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Completion { tx, queue },
        TaskHandle {
            rx,
            queue,
            _output: PhantomData,
        },
    )
}

/// Future resolving to the result of a submitted task.
///
/// Dropping the handle does not cancel the task; it still runs and its
/// result is discarded.
#[must_use = "a task runs even if its handle is dropped; await it to observe failures"]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Resolution>,
    queue: &'static str,
    _output: PhantomData<fn() -> T>,
}

impl<T> TaskHandle<T> {
    /// Name of the queue the task was submitted to.
    #[must_use]
    pub const fn queue(&self) -> &'static str {
        self.queue
    }
}

impl<T: 'static> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let queue = self.queue;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Closed { queue })),
            Poll::Ready(Ok(Err(err))) => Poll::Ready(Err(err)),
            Poll::Ready(Ok(Ok(output))) => Poll::Ready(
                output
                    .downcast::<T>()
                    .map(|value| *value)
                    .map_err(|_| {
                        TaskError::Failed(AppError::Internal(format!(
                            "Queue {queue} returned an unexpected output type"
                        )))
                    }),
            ),
        }
    }
}

type AsyncOp = Box<dyn FnOnce() -> BoxFuture<'static, AppResult<TaskOutput>> + Send>;

/// Envelope for queues whose operations are futures.
pub(crate) struct AsyncEnvelope {
    pub(crate) id: u64,
    pub(crate) key: Option<String>,
    op: AsyncOp,
    completion: Completion,
}

impl AsyncEnvelope {
    /// Wrap `op`. Nothing is executed until [`AsyncEnvelope::run`].
    pub(crate) fn new<T, F, Fut>(
        queue: &'static str,
        id: u64,
        key: Option<String>,
        op: F,
    ) -> (Self, TaskHandle<T>)
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let (completion, handle) = completion(queue);
        let op: AsyncOp =
            Box::new(move || async move { op().await.map(|v| Box::new(v) as TaskOutput) }.boxed());
        (
            Self {
                id,
                key,
                op,
                completion,
            },
            handle,
        )
    }

    /// Run the operation to completion and resolve the handle.
    ///
    /// Panics are caught and reported as [`TaskError::Panicked`]. The error
    /// (if any) is returned as well so the worker can log it.
    pub(crate) async fn run(self, stats: &QueueStats) -> Option<TaskError> {
        let Self { op, completion, .. } = self;
        stats.record_started();

        let resolution = match AssertUnwindSafe(async move { op().await })
            .catch_unwind()
            .await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(TaskError::Failed(err)),
            Err(payload) => Err(TaskError::Panicked(panic_message(payload.as_ref()))),
        };

        stats.record_finished(resolution.is_ok());
        let failure = resolution.as_ref().err().cloned();
        completion.resolve(resolution);
        failure
    }

    /// Resolve the handle as closed.
    pub(crate) fn reject(self, stats: &QueueStats) {
        stats.record_rejected();
        self.completion.reject();
    }
}

/// Render a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_value() {
        let (completion, handle) = completion::<u32>("test");
        completion.resolve(Ok(Box::new(7_u32)));
        assert_eq!(handle.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_dropped_completion_reads_as_closed() {
        let (completion, handle) = completion::<u32>("test");
        drop(completion);
        let err = handle.await.unwrap_err();
        assert!(matches!(err, TaskError::Closed { queue: "test" }));
    }

    #[tokio::test]
    async fn test_failure_is_passed_through() {
        let (completion, handle) = completion::<u32>("test");
        completion.resolve(Err(TaskError::Failed(AppError::RateLimited {
            retry_after_ms: 250,
        })));
        let err = handle.await.unwrap_err();
        assert_eq!(err.retry_after(), Some(std::time::Duration::from_millis(250)));
    }

    #[test]
    fn test_panic_message_formats() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
