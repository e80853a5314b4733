//! A named throttling rule: optional concurrency plus optional threshold.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use throttlekit_core::{JobArgs, JobId, KeySuffix, RequeueOptions, ThrottleError, ThrottleResult};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::concurrency::{Concurrency, ConcurrencyOptions};
use crate::threshold::{Threshold, ThresholdOptions};

/// Which check throttled a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleKind {
    Concurrency,
    Threshold,
}

impl core::fmt::Display for ThrottleKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Concurrency => f.write_str("concurrency"),
            Self::Threshold => f.write_str("threshold"),
        }
    }
}

/// Callback invoked when a check throttles. Cannot change the verdict.
#[derive(Clone)]
pub struct Observer(Arc<dyn Fn(ThrottleKind, &JobArgs) + Send + Sync>);

impl Observer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(ThrottleKind, &JobArgs) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn notify(&self, kind: ThrottleKind, args: &JobArgs) {
        (self.0)(kind, args)
    }
}

impl core::fmt::Debug for Observer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Observer(<fn>)")
    }
}

/// Registration-time description of a strategy.
#[derive(Debug, Clone, Default)]
pub struct StrategyOptions {
    pub concurrency: Option<ConcurrencyOptions>,
    pub threshold: Option<ThresholdOptions>,
    pub observer: Option<Observer>,
    pub requeue: Option<RequeueOptions>,
}

impl StrategyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, options: ConcurrencyOptions) -> Self {
        self.concurrency = Some(options);
        self
    }

    pub fn threshold(mut self, options: ThresholdOptions) -> Self {
        self.threshold = Some(options);
        self
    }

    /// Apply `suffix` to every check that has none of its own.
    pub fn key_suffix(mut self, suffix: KeySuffix) -> Self {
        if let Some(c) = self.concurrency.as_mut() {
            c.key_suffix.get_or_insert_with(|| suffix.clone());
        }
        if let Some(t) = self.threshold.as_mut() {
            t.key_suffix.get_or_insert(suffix);
        }
        self
    }

    pub fn observer<F>(mut self, f: F) -> Self
    where
        F: Fn(ThrottleKind, &JobArgs) + Send + Sync + 'static,
    {
        self.observer = Some(Observer::new(f));
        self
    }

    pub fn requeue(mut self, requeue: RequeueOptions) -> Self {
        self.requeue = Some(requeue);
        self
    }
}

/// Concurrency and threshold checks sharing one name.
#[derive(Debug, Clone)]
pub struct Strategy {
    name: String,
    concurrency: Option<Concurrency>,
    threshold: Option<Threshold>,
    observer: Option<Observer>,
    requeue: Option<RequeueOptions>,
}

impl Strategy {
    /// Build a strategy. Fails when neither check is configured.
    pub fn new(backend: Backend, name: &str, options: StrategyOptions) -> ThrottleResult<Self> {
        if options.concurrency.is_none() && options.threshold.is_none() {
            return Err(ThrottleError::config(format!(
                "strategy `{name}` needs a concurrency or a threshold check"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            concurrency: options
                .concurrency
                .map(|c| Concurrency::new(backend.clone(), name, c)),
            threshold: options.threshold.map(|t| Threshold::new(backend, name, t)),
            observer: options.observer,
            requeue: options.requeue,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> Option<&Concurrency> {
        self.concurrency.as_ref()
    }

    pub fn threshold(&self) -> Option<&Threshold> {
        self.threshold.as_ref()
    }

    pub fn requeue_options(&self) -> Option<&RequeueOptions> {
        self.requeue.as_ref()
    }

    pub fn is_dynamic(&self) -> bool {
        self.concurrency.as_ref().is_some_and(Concurrency::is_dynamic)
            || self.threshold.as_ref().is_some_and(Threshold::is_dynamic)
    }

    /// Returns `true` when the job must not run now.
    ///
    /// A concurrency slot taken by this call is released again before a
    /// threshold verdict of "throttled" (or a threshold error) is returned.
    pub fn throttled(&self, job_id: &JobId, args: &JobArgs) -> ThrottleResult<bool> {
        if let Some(concurrency) = &self.concurrency {
            if concurrency.throttled(job_id, args)? {
                self.observe(ThrottleKind::Concurrency, args);
                return Ok(true);
            }
        }

        let Some(threshold) = &self.threshold else {
            return Ok(false);
        };

        match threshold.throttled(args) {
            Ok(false) => Ok(false),
            Ok(true) => {
                self.observe(ThrottleKind::Threshold, args);
                self.finalize(job_id, args)?;
                Ok(true)
            }
            Err(err) => {
                if let Err(rollback) = self.finalize(job_id, args) {
                    warn!(strategy = %self.name, job_id = %job_id, error = %rollback, "concurrency rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Release the concurrency slot held by `job_id`.
    pub fn finalize(&self, job_id: &JobId, args: &JobArgs) -> ThrottleResult<()> {
        match &self.concurrency {
            Some(concurrency) => concurrency.finalize(job_id, args),
            None => Ok(()),
        }
    }

    pub fn reset(&self, args: &JobArgs) -> ThrottleResult<()> {
        if let Some(concurrency) = &self.concurrency {
            concurrency.reset(args)?;
        }
        if let Some(threshold) = &self.threshold {
            threshold.reset(args)?;
        }
        Ok(())
    }

    /// Longest of the per-check wait estimates.
    pub fn retry_in(&self, job_id: &JobId, args: &JobArgs) -> ThrottleResult<Duration> {
        let concurrency = match &self.concurrency {
            Some(c) => c.retry_in(job_id, args)?,
            None => Duration::ZERO,
        };
        let threshold = match &self.threshold {
            Some(t) => t.retry_in(args)?,
            None => Duration::ZERO,
        };
        Ok(concurrency.max(threshold))
    }

    fn observe(&self, kind: ThrottleKind, args: &JobArgs) {
        debug!(strategy = %self.name, kind = %kind, "throttled");
        if let Some(observer) = &self.observer {
            observer.notify(kind, args);
        }
    }
}
