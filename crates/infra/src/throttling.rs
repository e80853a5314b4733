//! The throttling service: one explicitly constructed object per process.
//!
//! Owns the strategy registry, the queue cooldown and the paused-queue cache,
//! and answers the three questions the host asks about a job: may it run,
//! where does it go if not, and (after it ran) release its slots.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use throttlekit_core::{
    Clock, Message, QueueName, RequeueWith, SystemClock, ThrottleConfig, ThrottleResult,
};
use throttlekit_limits::{Backend, Cooldown, Registry};
use throttlekit_store::ThrottleStore;
use tracing::{debug, warn};

use crate::paused::PausedQueues;

/// Queue used when a job names none.
pub const DEFAULT_QUEUE: &str = "default";

/// Default upper bound of the random delay added to scheduled requeues, as a
/// fraction of the estimated wait.
pub const DEFAULT_MAX_JITTER: f64 = 0.1;

/// Where and when a throttled job reappears.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequeueTarget {
    pub queue: QueueName,
    /// `None`: push to the tail now. `Some(t)`: schedule for Unix time `t`.
    pub at: Option<f64>,
}

#[derive(Debug)]
pub struct Throttling {
    config: ThrottleConfig,
    backend: Backend,
    registry: Registry,
    cooldown: Option<Cooldown>,
    paused: PausedQueues,
    max_jitter: f64,
}

impl Throttling {
    pub fn new(
        store: Arc<dyn ThrottleStore>,
        clock: Arc<dyn Clock>,
        config: ThrottleConfig,
    ) -> ThrottleResult<Self> {
        config.validate()?;

        let backend = Backend::new(store, Arc::clone(&clock)).with_key_prefix(config.key_prefix());
        Ok(Self {
            registry: Registry::new(backend.clone(), config.inherit_strategies),
            cooldown: Cooldown::from_config(&config, clock),
            paused: PausedQueues::new(backend.clone(), config.paused_cache_ttl),
            backend,
            config,
            max_jitter: DEFAULT_MAX_JITTER,
        })
    }

    /// Bound the jitter of scheduled requeues to `fraction` of the wait.
    /// `0.0` schedules exactly at the estimate.
    pub fn with_max_jitter(mut self, fraction: f64) -> Self {
        self.max_jitter = fraction.max(0.0);
        self
    }

    /// Wall-clock service.
    pub fn system(store: Arc<dyn ThrottleStore>, config: ThrottleConfig) -> ThrottleResult<Self> {
        Self::new(store, Arc::new(SystemClock), config)
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cooldown(&self) -> Option<&Cooldown> {
        self.cooldown.as_ref()
    }

    pub fn paused(&self) -> &PausedQueues {
        &self.paused
    }

    /// Whether `message` must be deferred. Jobs without a rule always run.
    pub fn is_throttled(&self, message: &Message) -> ThrottleResult<bool> {
        let Some(rule) = self.registry.get(message.job_class()) else {
            return Ok(false);
        };

        let throttled = rule.throttled(message.job_id(), message.args())?;
        debug!(
            job_class = %message.job_class(),
            job_id = %message.job_id(),
            throttled,
            "throttle decision"
        );
        Ok(throttled)
    }

    /// Like [`Throttling::is_throttled`] on a raw payload. Unreadable payloads
    /// are never throttled.
    pub fn is_throttled_raw(&self, raw: &str) -> ThrottleResult<bool> {
        match Message::parse(raw) {
            Ok(message) => self.is_throttled(&message),
            Err(err) => {
                warn!(error = %err, "unreadable job payload; not throttling");
                Ok(false)
            }
        }
    }

    /// Release every slot `message` holds. Call after the job ran, whatever
    /// its outcome.
    pub fn finalize(&self, message: &Message) -> ThrottleResult<()> {
        match self.registry.get(message.job_class()) {
            Some(rule) => rule.finalize(message.job_id(), message.args()),
            None => Ok(()),
        }
    }

    /// Destination and timing for a throttled `message`.
    ///
    /// Queue: the rule's override, then the configured default, then the
    /// job's own queue. `schedule` mode delays by the rule's wait estimate
    /// plus up to `max_jitter` of it (10% unless configured).
    pub fn requeue_target(&self, message: &Message) -> ThrottleResult<RequeueTarget> {
        let rule = self.registry.get(message.job_class());
        let options = match rule.as_deref().and_then(|r| r.requeue_options()) {
            Some(own) => own.or(&self.config.default_requeue),
            None => self.config.default_requeue.clone(),
        };

        let queue = options
            .to
            .or_else(|| message.queue().cloned())
            .unwrap_or_else(|| QueueName::from(DEFAULT_QUEUE));

        let at = match (options.with.unwrap_or_default(), rule) {
            (RequeueWith::Schedule, Some(rule)) => {
                let wait = rule.retry_in(message.job_id(), message.args())?;
                Some(self.backend.now() + with_jitter(wait, self.max_jitter).as_secs_f64())
            }
            (RequeueWith::Schedule, None) => Some(self.backend.now()),
            (RequeueWith::Enqueue, _) => None,
        };

        Ok(RequeueTarget { queue, at })
    }
}

fn with_jitter(wait: Duration, max_jitter: f64) -> Duration {
    if max_jitter <= 0.0 {
        return wait;
    }
    let factor = 1.0 + rand::rng().random_range(0.0..=max_jitter);
    wait.mul_f64(factor)
}
