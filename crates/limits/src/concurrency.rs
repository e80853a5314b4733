//! Concurrency limiting: at most `limit` jobs of a fingerprint in flight.
//!
//! The bucket is a set of job ids whose entries expire individually after
//! the lost-job threshold. A worker that dies without finalizing therefore
//! holds its slot only until the entry ages out.
//!
//! Jobs turned away wait in a per-bucket backlog (`<bucket>:backlog`) in the
//! order they were first rejected; their place there drives
//! [`Concurrency::retry_in`].

use std::time::Duration;

use throttlekit_core::{JobArgs, JobId, KeySuffix, Limit, ThrottleError, ThrottleResult};
use tracing::debug;

use crate::backend::Backend;

/// Default lost-job threshold (15 minutes).
pub const DEFAULT_LOST_JOB_THRESHOLD: Duration = Duration::from_secs(900);

/// Configuration of a concurrency check.
#[derive(Debug, Clone)]
pub struct ConcurrencyOptions {
    pub limit: Limit,
    pub key_suffix: Option<KeySuffix>,
    /// How long an unfinalized entry keeps its slot.
    pub lost_job_threshold: Duration,
}

impl ConcurrencyOptions {
    pub fn new(limit: impl Into<Limit>) -> Self {
        Self {
            limit: limit.into(),
            key_suffix: None,
            lost_job_threshold: DEFAULT_LOST_JOB_THRESHOLD,
        }
    }

    pub fn with_key_suffix(mut self, suffix: KeySuffix) -> Self {
        self.key_suffix = Some(suffix);
        self
    }

    pub fn with_lost_job_threshold(mut self, ttl: Duration) -> Self {
        self.lost_job_threshold = ttl;
        self
    }
}

/// Concurrency check bound to one strategy name.
#[derive(Debug, Clone)]
pub struct Concurrency {
    name: String,
    base_key: String,
    options: ConcurrencyOptions,
    backend: Backend,
}

impl Concurrency {
    pub fn new(backend: Backend, name: &str, options: ConcurrencyOptions) -> Self {
        Self {
            name: name.to_string(),
            base_key: backend.key(&format!("throttled:{name}:concurrency")),
            options,
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ConcurrencyOptions {
        &self.options
    }

    /// Whether the bucket key depends on job arguments.
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

    fn backlog_key(key: &str) -> String {
        format!("{key}:backlog")
    }

    /// Limit for these arguments; `None` means unlimited.
    pub fn limit(&self, args: &JobArgs) -> ThrottleResult<Option<u64>> {
        self.options
            .limit
            .resolve(args)
            .map_err(|e| ThrottleError::key_function(&self.name, &e))
    }

    pub fn lost_job_threshold(&self) -> Duration {
        self.options.lost_job_threshold
    }

    /// Try to check `job_id` out of the bucket. Returns `true` when throttled.
    ///
    /// An unlimited job never touches the store.
    pub fn throttled(&self, job_id: &JobId, args: &JobArgs) -> ThrottleResult<bool> {
        let Some(limit) = self.limit(args)? else {
            return Ok(false);
        };
        let key = self.key(args)?;
        let ttl = self.options.lost_job_threshold.as_secs_f64();

        let throttled = self.backend.store().concurrency_acquire(
            &key,
            &Self::backlog_key(&key),
            job_id.as_str(),
            limit,
            ttl,
            self.backend.now(),
        )?;

        debug!(strategy = %self.name, key = %key, job_id = %job_id, limit, throttled, "concurrency check");
        Ok(throttled)
    }

    /// Release the slot held by `job_id` (and its backlog place, if any).
    /// Safe to call for absent ids.
    pub fn finalize(&self, job_id: &JobId, args: &JobArgs) -> ThrottleResult<()> {
        let key = self.key(args)?;
        self.backend
            .store()
            .concurrency_release(&key, &Self::backlog_key(&key), job_id.as_str())?;
        Ok(())
    }

    /// Jobs currently checked out.
    pub fn count(&self, args: &JobArgs) -> ThrottleResult<u64> {
        let key = self.key(args)?;
        Ok(self
            .backend
            .store()
            .concurrency_count(&key, self.backend.now())?)
    }

    pub fn reset(&self, args: &JobArgs) -> ThrottleResult<()> {
        let key = self.key(args)?;
        let store = self.backend.store();
        store.delete(&key)?;
        store.delete(&Self::backlog_key(&key))?;
        Ok(())
    }

    /// Estimated wait before a slot frees up for this job.
    ///
    /// Assumes in-flight jobs complete uniformly: the time until the oldest
    /// entry would expire, scaled by this job's position in the backlog over
    /// the limit. A job not waiting yet is placed after everyone who is.
    /// Clamped to the lost-job threshold, so stale entries never produce an
    /// unbounded estimate.
    pub fn retry_in(&self, job_id: &JobId, args: &JobArgs) -> ThrottleResult<Duration> {
        let Some(limit) = self.limit(args)? else {
            return Ok(Duration::ZERO);
        };
        let key = self.key(args)?;
        let now = self.backend.now();
        let count = self.backend.store().concurrency_count(&key, now)?;
        if count < limit {
            return Ok(Duration::ZERO);
        }

        let horizon = self.options.lost_job_threshold.as_secs_f64();
        let Some(oldest_expiry) = self.backend.store().concurrency_oldest_expiry(&key, now)? else {
            return Ok(Duration::ZERO);
        };

        let position = self.backend.store().concurrency_backlog_position(
            &Self::backlog_key(&key),
            job_id.as_str(),
            now,
        )?;

        let until_free = (oldest_expiry - now).clamp(0.0, horizon);
        let estimate = until_free * position as f64 / limit.max(1) as f64;

        Ok(Duration::from_secs_f64(estimate.clamp(0.0, horizon)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::{Value, json};
    use throttlekit_core::ManualClock;
    use throttlekit_store::InMemoryStore;

    fn setup(options: ConcurrencyOptions) -> (Concurrency, ManualClock) {
        let clock = ManualClock::default();
        let backend = Backend::new(Arc::new(InMemoryStore::new()), Arc::new(clock.clone()));
        (Concurrency::new(backend, "reports", options), clock)
    }

    fn jid(id: &str) -> JobId {
        JobId::from(id)
    }

    #[test]
    fn limit_one_admits_then_throttles_until_finalized() {
        let (c, _) = setup(ConcurrencyOptions::new(1));

        let results = [
            c.throttled(&jid("a"), &[]).unwrap(),
            c.throttled(&jid("b"), &[]).unwrap(),
        ];
        assert_eq!(results, [false, true]);

        c.finalize(&jid("a"), &[]).unwrap();
        assert!(!c.throttled(&jid("b"), &[]).unwrap());
    }

    #[test]
    fn lost_jobs_free_their_slot_after_threshold() {
        let (c, clock) = setup(
            ConcurrencyOptions::new(1).with_lost_job_threshold(Duration::from_secs(30)),
        );

        assert!(!c.throttled(&jid("a"), &[]).unwrap());
        assert!(c.throttled(&jid("b"), &[]).unwrap());

        clock.advance(Duration::from_secs(31));
        assert!(!c.throttled(&jid("b"), &[]).unwrap());
    }

    #[test]
    fn finalize_twice_is_harmless() {
        let (c, _) = setup(ConcurrencyOptions::new(1));

        c.throttled(&jid("a"), &[]).unwrap();
        c.finalize(&jid("a"), &[]).unwrap();
        c.finalize(&jid("a"), &[]).unwrap();

        assert!(!c.throttled(&jid("b"), &[]).unwrap());
        assert_eq!(c.count(&[]).unwrap(), 1);
    }

    #[test]
    fn nil_dynamic_limit_never_throttles() {
        let (c, _) = setup(ConcurrencyOptions::new(Limit::dynamic(|_| Ok(None))));

        for i in 0..5 {
            assert!(!c.throttled(&jid(&i.to_string()), &[]).unwrap());
        }
        assert_eq!(c.count(&[]).unwrap(), 0);
    }

    #[test]
    fn dynamic_limit_and_suffix_follow_arguments() {
        let (c, _) = setup(
            ConcurrencyOptions::new(Limit::dynamic(|args| Ok(args[1].as_u64())))
                .with_key_suffix(KeySuffix::arg(0)),
        );
        let acme = [json!("acme"), json!(1)];
        let globex = [json!("globex"), json!(2)];

        assert_eq!(c.key(&acme).unwrap(), "throttled:reports:concurrency:acme");
        assert!(!c.throttled(&jid("a"), &acme).unwrap());
        assert!(c.throttled(&jid("b"), &acme).unwrap());
        assert!(!c.throttled(&jid("c"), &globex).unwrap());
        assert!(!c.throttled(&jid("d"), &globex).unwrap());
        assert!(c.is_dynamic());
    }

    #[test]
    fn failing_key_function_surfaces_error() {
        let (c, _) = setup(ConcurrencyOptions::new(1).with_key_suffix(KeySuffix::arg(3)));

        let err = c.throttled(&jid("a"), &[Value::Null]).unwrap_err();
        assert!(matches!(err, ThrottleError::KeyFunction { ref strategy, .. } if strategy == "reports"));
    }

    #[test]
    fn retry_in_scales_with_backlog_and_stays_within_horizon() {
        let (c, clock) = setup(
            ConcurrencyOptions::new(2).with_lost_job_threshold(Duration::from_secs(100)),
        );

        assert_eq!(c.retry_in(&jid("x"), &[]).unwrap(), Duration::ZERO);

        c.throttled(&jid("a"), &[]).unwrap();
        clock.advance(Duration::from_secs(20));
        c.throttled(&jid("b"), &[]).unwrap();

        // Oldest entry expires in 80s, backlog position 1 of limit 2.
        assert_eq!(c.retry_in(&jid("x"), &[]).unwrap(), Duration::from_secs(40));

        clock.advance(Duration::from_secs(200));
        assert_eq!(c.retry_in(&jid("x"), &[]).unwrap(), Duration::ZERO);
    }

    #[test]
    fn waiting_jobs_get_longer_estimates_in_rejection_order() {
        let (c, _) = setup(
            ConcurrencyOptions::new(2).with_lost_job_threshold(Duration::from_secs(100)),
        );

        c.throttled(&jid("a"), &[]).unwrap();
        c.throttled(&jid("b"), &[]).unwrap();
        let waiting = ["w1", "w2", "w3", "w4", "w5"];
        for id in waiting {
            assert!(c.throttled(&jid(id), &[]).unwrap());
        }

        let estimates: Vec<u64> = waiting
            .iter()
            .map(|id| c.retry_in(&jid(id), &[]).unwrap().as_secs())
            .collect();
        // 100s to expiry * position / 2, capped at the 100s horizon.
        assert_eq!(estimates, [50, 100, 100, 100, 100]);

        // Newcomers queue behind everyone already waiting.
        assert_eq!(c.retry_in(&jid("late"), &[]).unwrap(), Duration::from_secs(100));

        // An admitted job gives up its place.
        c.finalize(&jid("a"), &[]).unwrap();
        assert!(!c.throttled(&jid("w1"), &[]).unwrap());
        assert_eq!(c.retry_in(&jid("w2"), &[]).unwrap(), Duration::from_secs(50));
    }

    #[test]
    fn estimates_spread_below_the_horizon() {
        let (c, clock) = setup(
            ConcurrencyOptions::new(4).with_lost_job_threshold(Duration::from_secs(100)),
        );

        for id in ["a", "b", "c", "d"] {
            c.throttled(&jid(id), &[]).unwrap();
        }
        clock.advance(Duration::from_secs(60));
        for id in ["w1", "w2", "w3"] {
            c.throttled(&jid(id), &[]).unwrap();
        }

        let estimates: Vec<u64> = ["w1", "w2", "w3"]
            .iter()
            .map(|id| c.retry_in(&jid(id), &[]).unwrap().as_secs())
            .collect();
        // 40s to expiry * position / 4.
        assert_eq!(estimates, [10, 20, 30]);
    }

    #[test]
    fn reset_clears_bucket() {
        let (c, _) = setup(ConcurrencyOptions::new(1));

        c.throttled(&jid("a"), &[]).unwrap();
        c.reset(&[]).unwrap();

        assert_eq!(c.count(&[]).unwrap(), 0);
        assert!(!c.throttled(&jid("b"), &[]).unwrap());
    }
}
