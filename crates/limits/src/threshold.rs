//! Threshold limiting: at most `limit` job starts per rolling `period`.

use std::time::Duration;

use throttlekit_core::{JobArgs, KeySuffix, Limit, Period, ThrottleError, ThrottleResult};
use tracing::debug;

use crate::backend::Backend;

/// Configuration of a threshold check.
#[derive(Debug, Clone)]
pub struct ThresholdOptions {
    pub limit: Limit,
    pub period: Period,
    pub key_suffix: Option<KeySuffix>,
}

impl ThresholdOptions {
    pub fn new(limit: impl Into<Limit>, period: impl Into<Period>) -> Self {
        Self {
            limit: limit.into(),
            period: period.into(),
            key_suffix: None,
        }
    }

    pub fn with_key_suffix(mut self, suffix: KeySuffix) -> Self {
        self.key_suffix = Some(suffix);
        self
    }
}

/// Threshold check bound to one strategy name.
#[derive(Debug, Clone)]
pub struct Threshold {
    name: String,
    base_key: String,
    options: ThresholdOptions,
    backend: Backend,
}

impl Threshold {
    pub fn new(backend: Backend, name: &str, options: ThresholdOptions) -> Self {
        Self {
            name: name.to_string(),
            base_key: backend.key(&format!("throttled:{name}:threshold")),
            options,
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ThresholdOptions {
        &self.options
    }

    pub fn is_dynamic(&self) -> bool {
        self.options.key_suffix.is_some()
    }

    pub fn key(&self, args: &JobArgs) -> ThrottleResult<String> {
        match &self.options.key_suffix {
            Some(suffix) => {
                let suffix = suffix
                    .suffix(args)
                    .map_err(|e| ThrottleError::key_function(&self.name, &e))?;
                Ok(format!("{}:{}", self.base_key, suffix))
            }
            None => Ok(self.base_key.clone()),
        }
    }

    pub fn limit(&self, args: &JobArgs) -> ThrottleResult<Option<u64>> {
        self.options
            .limit
            .resolve(args)
            .map_err(|e| ThrottleError::key_function(&self.name, &e))
    }

    pub fn period(&self, args: &JobArgs) -> ThrottleResult<Option<Duration>> {
        self.options
            .period
            .resolve(args)
            .map_err(|e| ThrottleError::key_function(&self.name, &e))
    }

    /// Limit and period, or `None` when either is unset for these arguments.
    fn window(&self, args: &JobArgs) -> ThrottleResult<Option<(u64, f64)>> {
        let Some(limit) = self.limit(args)? else {
            return Ok(None);
        };
        let Some(period) = self.period(args)? else {
            return Ok(None);
        };
        Ok(Some((limit, period.as_secs_f64())))
    }

    /// Record a start unless the window is full. Returns `true` when throttled;
    /// a throttled job does not consume a slot.
    pub fn throttled(&self, args: &JobArgs) -> ThrottleResult<bool> {
        let Some((limit, period)) = self.window(args)? else {
            return Ok(false);
        };
        let key = self.key(args)?;

        let throttled =
            self.backend
                .store()
                .threshold_acquire(&key, limit, period, self.backend.now())?;

        debug!(strategy = %self.name, key = %key, limit, period, throttled, "threshold check");
        Ok(throttled)
    }

    /// Starts recorded in the current window.
    pub fn count(&self, args: &JobArgs) -> ThrottleResult<u64> {
        let key = self.key(args)?;
        Ok(self
            .backend
            .store()
            .threshold_count(&key, self.backend.now())?)
    }

    pub fn reset(&self, args: &JobArgs) -> ThrottleResult<()> {
        let key = self.key(args)?;
        self.backend.store().delete(&key)?;
        Ok(())
    }

    /// Time until the oldest start leaves the window.
    pub fn retry_in(&self, args: &JobArgs) -> ThrottleResult<Duration> {
        let Some((limit, period)) = self.window(args)? else {
            return Ok(Duration::ZERO);
        };
        let key = self.key(args)?;
        let now = self.backend.now();

        if self.backend.store().threshold_count(&key, now)? < limit {
            return Ok(Duration::ZERO);
        }
        let Some(oldest) = self.backend.store().threshold_oldest(&key, now)? else {
            return Ok(Duration::ZERO);
        };

        let wait = period - (now - oldest);
        Ok(Duration::from_secs_f64(wait.max(0.0)))
    }
}
