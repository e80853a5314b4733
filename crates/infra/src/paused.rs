//! Paused queues: skipped by the fetch loop until resumed.
//!
//! The set lives in the shared store so pausing affects every process. Each
//! process caches the list and re-reads it once the cache lapses, so a pause
//! takes effect elsewhere within one cache TTL.

use std::sync::Arc;
use std::time::Duration;

use throttlekit_core::{QueueName, ThrottleResult};
use throttlekit_limits::{Backend, ExpiringList};
use tracing::{debug, info};

const PAUSED_QUEUES_KEY: &str = "throttled:paused_queues";

#[derive(Debug)]
pub struct PausedQueues {
    backend: Backend,
    key: String,
    cache: ExpiringList<QueueName>,
}

impl PausedQueues {
    pub fn new(backend: Backend, cache_ttl: Duration) -> Self {
        Self {
            key: backend.key(PAUSED_QUEUES_KEY),
            cache: ExpiringList::new(cache_ttl, Arc::clone(backend.clock())),
            backend,
        }
    }

    pub fn pause(&self, queue: &QueueName) -> ThrottleResult<()> {
        self.backend.store().set_add(&self.key, queue.as_str())?;
        self.cache.clear();
        info!(queue = %queue, "queue paused");
        Ok(())
    }

    pub fn resume(&self, queue: &QueueName) -> ThrottleResult<()> {
        self.backend.store().set_remove(&self.key, queue.as_str())?;
        self.cache.clear();
        info!(queue = %queue, "queue resumed");
        Ok(())
    }

    /// Paused queues, from the cache when it is fresh.
    pub fn paused_queues(&self) -> ThrottleResult<Vec<QueueName>> {
        if self.cache.is_stale() {
            let members = self.backend.store().set_members(&self.key)?;
            debug!(count = members.len(), "refreshed paused queues");
            self.cache.replace(members.into_iter().map(QueueName::from));
        }
        Ok(self.cache.snapshot())
    }

    pub fn is_paused(&self, queue: &QueueName) -> ThrottleResult<bool> {
        Ok(self.paused_queues()?.contains(queue))
    }
}
