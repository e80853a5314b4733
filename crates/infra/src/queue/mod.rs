//! Host job-queue access used by the throttled fetch.
//!
//! The fetch loop only needs four operations: a bounded blocking pop over
//! several queues (in priority order), pushes to either end of a queue, and
//! scheduling a payload for later.

use std::sync::Arc;
use std::time::Duration;

use throttlekit_core::QueueName;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_queue;

pub use in_memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use redis_queue::RedisQueue;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("queue lock poisoned")]
    Poisoned,
}

/// A raw job popped from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoppedJob {
    pub queue: QueueName,
    pub payload: String,
}

/// Job-queue operations the throttled fetch depends on.
pub trait QueueBackend: Send + Sync {
    /// Pop the next job from the first non-empty queue in `queues`, waiting up
    /// to `timeout`. `None` when nothing arrived in time.
    fn pop(&self, queues: &[QueueName], timeout: Duration) -> QueueResult<Option<PoppedJob>>;

    /// Append to the tail: the job runs after everything already queued.
    fn push_back(&self, queue: &QueueName, payload: &str) -> QueueResult<()>;

    /// Put at the head: the job is the next one popped.
    fn push_front(&self, queue: &QueueName, payload: &str) -> QueueResult<()>;

    /// Make the job available on `queue` at Unix time `at`.
    fn schedule(&self, queue: &QueueName, payload: &str, at: f64) -> QueueResult<()>;
}

impl<Q> QueueBackend for Arc<Q>
where
    Q: QueueBackend + ?Sized,
{
    fn pop(&self, queues: &[QueueName], timeout: Duration) -> QueueResult<Option<PoppedJob>> {
        (**self).pop(queues, timeout)
    }

    fn push_back(&self, queue: &QueueName, payload: &str) -> QueueResult<()> {
        (**self).push_back(queue, payload)
    }

    fn push_front(&self, queue: &QueueName, payload: &str) -> QueueResult<()> {
        (**self).push_front(queue, payload)
    }

    fn schedule(&self, queue: &QueueName, payload: &str, at: f64) -> QueueResult<()> {
        (**self).schedule(queue, payload, at)
    }
}
