//! Several strategies under one name, decided all-or-nothing.

use std::time::Duration;

use throttlekit_core::{JobArgs, JobId, RequeueOptions, ThrottleError, ThrottleResult};
use tracing::warn;

use crate::backend::Backend;
use crate::strategy::{Strategy, StrategyOptions};

/// Ordered strategies sharing a logical name.
///
/// With more than one member each gets the bucket name `<name>.<index>`.
#[derive(Debug, Clone)]
pub struct StrategyCollection {
    name: String,
    strategies: Vec<Strategy>,
}

impl StrategyCollection {
    pub fn new(
        backend: Backend,
        name: &str,
        members: Vec<StrategyOptions>,
    ) -> ThrottleResult<Self> {
        if members.is_empty() {
            return Err(ThrottleError::config(format!(
                "strategy collection `{name}` has no members"
            )));
        }

        let single = members.len() == 1;
        let strategies = members
            .into_iter()
            .enumerate()
            .map(|(idx, options)| {
                let member_name = if single {
                    name.to_string()
                } else {
                    format!("{name}.{idx}")
                };
                Strategy::new(backend.clone(), &member_name, options)
            })
            .collect::<ThrottleResult<Vec<_>>>()?;

        Ok(Self {
            name: name.to_string(),
            strategies,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    pub fn is_dynamic(&self) -> bool {
        self.strategies.iter().any(Strategy::is_dynamic)
    }

    /// First member override, if any.
    pub fn requeue_options(&self) -> Option<&RequeueOptions> {
        self.strategies.iter().find_map(Strategy::requeue_options)
    }

    /// Throttled when any member throttles. Members admitted earlier in the
    /// same call are finalized again before returning.
    pub fn throttled(&self, job_id: &JobId, args: &JobArgs) -> ThrottleResult<bool> {
        for (idx, strategy) in self.strategies.iter().enumerate() {
            let verdict = strategy.throttled(job_id, args);
            match verdict {
                Ok(false) => continue,
                Ok(true) => {
                    self.rollback(&self.strategies[..idx], job_id, args)?;
                    return Ok(true);
                }
                Err(err) => {
                    if let Err(rollback) = self.rollback(&self.strategies[..idx], job_id, args) {
                        warn!(strategy = %self.name, job_id = %job_id, error = %rollback, "collection rollback failed");
                    }
                    return Err(err);
                }
            }
        }
        Ok(false)
    }

    /// Finalize on every member.
    ///
    /// All members are attempted; the first error is returned.
    pub fn finalize(&self, job_id: &JobId, args: &JobArgs) -> ThrottleResult<()> {
        self.rollback(&self.strategies, job_id, args)
    }

    pub fn reset(&self, args: &JobArgs) -> ThrottleResult<()> {
        let mut first_err = None;
        for strategy in &self.strategies {
            if let Err(err) = strategy.reset(args) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn retry_in(&self, job_id: &JobId, args: &JobArgs) -> ThrottleResult<Duration> {
        let mut longest = Duration::ZERO;
        for strategy in &self.strategies {
            longest = longest.max(strategy.retry_in(job_id, args)?);
        }
        Ok(longest)
    }

    fn rollback(&self, members: &[Strategy], job_id: &JobId, args: &JobArgs) -> ThrottleResult<()> {
        let mut first_err = None;
        for strategy in members {
            if let Err(err) = strategy.finalize(job_id, args) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
