//! Administrative view over registered strategies.
//!
//! Only rules whose keys do not depend on job arguments are reported: for
//! the others there is no single bucket to read.

use serde::Serialize;
use throttlekit_core::{ThrottleError, ThrottleResult};
use throttlekit_limits::{Concurrency, Registry, Strategy, Threshold};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyStats {
    pub name: String,
    pub strategies: Vec<MemberStats>,
}

/// One strategy; a collection reports one per member.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberStats {
    pub name: String,
    pub concurrency: Option<ConcurrencyStats>,
    pub threshold: Option<ThresholdStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcurrencyStats {
    pub count: u64,
    /// `None` when the limit is computed per job.
    pub limit: Option<u64>,
    pub lost_job_threshold_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdStats {
    pub count: u64,
    pub limit: Option<u64>,
    pub period_secs: Option<f64>,
}

/// Current counts and limits of every static-key rule, sorted by name.
pub fn stats(registry: &Registry) -> ThrottleResult<Vec<StrategyStats>> {
    registry
        .each_with_static_keys()
        .into_iter()
        .map(|(name, rule)| {
            let strategies = rule
                .strategies()
                .iter()
                .map(member_stats)
                .collect::<ThrottleResult<Vec<_>>>()?;
            Ok(StrategyStats { name, strategies })
        })
        .collect()
}

/// Clear the buckets of the rule registered (or aliased) as `name`.
pub fn reset(registry: &Registry, name: &str) -> ThrottleResult<()> {
    let rule = registry
        .get(name)
        .ok_or_else(|| ThrottleError::UnknownStrategy(name.to_string()))?;
    rule.reset(&[])?;
    info!(strategy = %name, "throttle state reset");
    Ok(())
}

fn member_stats(strategy: &Strategy) -> ThrottleResult<MemberStats> {
    Ok(MemberStats {
        name: strategy.name().to_string(),
        concurrency: strategy.concurrency().map(concurrency_stats).transpose()?,
        threshold: strategy.threshold().map(threshold_stats).transpose()?,
    })
}

fn concurrency_stats(check: &Concurrency) -> ThrottleResult<ConcurrencyStats> {
    Ok(ConcurrencyStats {
        count: check.count(&[])?,
        limit: check.options().limit.as_static().copied(),
        lost_job_threshold_secs: check.lost_job_threshold().as_secs(),
    })
}

fn threshold_stats(check: &Threshold) -> ThrottleResult<ThresholdStats> {
    let options = check.options();
    Ok(ThresholdStats {
        count: check.count(&[])?,
        limit: options.limit.as_static().copied(),
        period_secs: options.period.as_static().map(|p| p.as_secs_f64()),
    })
}
