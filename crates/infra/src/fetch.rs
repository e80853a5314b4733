//! Throttle-aware fetch: the piece the host's worker loop calls instead of
//! popping queues directly.
//!
//! Each call:
//! 1. drops cooling and paused queues from the configured list
//! 2. pops one job (bounded wait)
//! 3. asks the throttling service about it
//! 4. requeues throttled jobs and yields admitted ones

use std::sync::Arc;
use std::thread;

use throttlekit_core::message::retarget;
use throttlekit_core::{Message, QueueName, ThrottleError};
use tracing::{debug, error, warn};

use crate::queue::{PoppedJob, QueueBackend, QueueError};
use crate::throttling::Throttling;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Throttle(#[from] ThrottleError),
}

/// An admitted job handed to the host.
///
/// Exactly one of [`UnitOfWork::acknowledge`] (after running the job) or
/// [`UnitOfWork::requeue`] (abandoned on shutdown) should be called.
pub struct UnitOfWork {
    queue: QueueName,
    payload: String,
    message: Option<Message>,
    backend: Arc<dyn QueueBackend>,
    throttling: Arc<Throttling>,
}

impl UnitOfWork {
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Parsed job, `None` when the payload was unreadable.
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// The job ran (successfully or not): release its throttling slots.
    pub fn acknowledge(self) -> Result<(), FetchError> {
        if let Some(message) = &self.message {
            self.throttling.finalize(message)?;
        }
        Ok(())
    }

    /// Give the job back untouched, at the head of its queue.
    ///
    /// Slots are released too; a later acknowledge is harmless.
    pub fn requeue(self) -> Result<(), FetchError> {
        if let Some(message) = &self.message {
            if let Err(err) = self.throttling.finalize(message) {
                warn!(queue = %self.queue, error = %err, "failed to release slots of abandoned job");
            }
        }
        self.backend.push_front(&self.queue, &self.payload)?;
        debug!(queue = %self.queue, "abandoned job pushed back");
        Ok(())
    }
}

/// Fetch over a fixed, ordered list of queues.
pub struct ThrottledFetch {
    backend: Arc<dyn QueueBackend>,
    throttling: Arc<Throttling>,
    queues: Vec<QueueName>,
}

impl ThrottledFetch {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        throttling: Arc<Throttling>,
        queues: impl IntoIterator<Item = QueueName>,
    ) -> Self {
        Self {
            backend,
            throttling,
            queues: queues.into_iter().collect(),
        }
    }

    pub fn queues(&self) -> &[QueueName] {
        &self.queues
    }

    /// Configured queues minus cooling and paused ones, order kept.
    pub fn candidate_queues(&self) -> Result<Vec<QueueName>, FetchError> {
        let cooling = self
            .throttling
            .cooldown()
            .map(|c| c.queues())
            .unwrap_or_default();
        let paused = self.throttling.paused().paused_queues()?;

        Ok(self
            .queues
            .iter()
            .filter(|q| !cooling.contains(q) && !paused.contains(q))
            .cloned()
            .collect())
    }

    /// Next admitted job, or `None` when nothing runnable arrived this round.
    pub fn retrieve_work(&self) -> Result<Option<UnitOfWork>, FetchError> {
        let timeout = self.throttling.config().fetch_timeout;
        let candidates = self.candidate_queues()?;
        if candidates.is_empty() {
            debug!("no queue to poll; waiting");
            thread::sleep(timeout);
            return Ok(None);
        }

        let Some(PoppedJob { queue, payload }) = self.backend.pop(&candidates, timeout)? else {
            return Ok(None);
        };

        let message = match Message::parse(&payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(queue = %queue, error = %err, "unreadable job payload; not throttling");
                return Ok(Some(self.unit(queue, payload, None)));
            }
        };

        let throttled = match self.throttling.is_throttled(&message) {
            Ok(throttled) => throttled,
            Err(err) => {
                error!(queue = %queue, job_id = %message.job_id(), error = %err, "throttle check failed; returning job");
                self.backend.push_front(&queue, &payload)?;
                return Err(err.into());
            }
        };

        if throttled {
            if let Err(err) = self.requeue_throttled(&queue, &payload, &message) {
                error!(queue = %queue, job_id = %message.job_id(), error = %err, "requeue failed; returning job");
                self.backend.push_front(&queue, &payload)?;
                return Err(err);
            }
            if let Some(cooldown) = self.throttling.cooldown() {
                cooldown.notify_throttled(&queue);
            }
            return Ok(None);
        }

        if let Some(cooldown) = self.throttling.cooldown() {
            cooldown.notify_admitted(&queue);
        }
        Ok(Some(self.unit(queue, payload, Some(message))))
    }

    fn requeue_throttled(
        &self,
        origin: &QueueName,
        payload: &str,
        message: &Message,
    ) -> Result<(), FetchError> {
        let target = self.throttling.requeue_target(message)?;

        let payload = if &target.queue == origin {
            payload.to_string()
        } else {
            retarget(payload, &target.queue).map_err(ThrottleError::from)?
        };

        match target.at {
            Some(at) => self.backend.schedule(&target.queue, &payload, at)?,
            None => self.backend.push_back(&target.queue, &payload)?,
        }
        debug!(
            job_id = %message.job_id(),
            from = %origin,
            to = %target.queue,
            at = ?target.at,
            "throttled job requeued"
        );
        Ok(())
    }

    fn unit(&self, queue: QueueName, payload: String, message: Option<Message>) -> UnitOfWork {
        UnitOfWork {
            queue,
            payload,
            message,
            backend: Arc::clone(&self.backend),
            throttling: Arc::clone(&self.throttling),
        }
    }
}

impl core::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("queue", &self.queue)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl core::fmt::Debug for ThrottledFetch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThrottledFetch")
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}
