//! Throttling configuration.
//!
//! Values come from code (`with_*` builders) or from the environment via
//! [`ThrottleConfig::from_env`]:
//!
//! | variable                        | meaning                                   | default                   |
//! |---------------------------------|-------------------------------------------|---------------------------|
//! | `THROTTLE_COOLDOWN_PERIOD`      | seconds a saturated queue is skipped, `off` disables | `1.0`          |
//! | `THROTTLE_COOLDOWN_THRESHOLD`   | consecutive throttled pops before cooldown | `100`                    |
//! | `THROTTLE_REQUEUE_WITH`         | `enqueue` or `schedule`                   | `enqueue`                 |
//! | `THROTTLE_REQUEUE_TO`           | queue throttled jobs are moved to         | origin queue              |
//! | `THROTTLE_INHERIT_STRATEGIES`   | fall back to a declared parent's rule     | `false`                   |
//! | `THROTTLE_NAMESPACE`            | prefix for every store key                | none                      |
//! | `THROTTLE_FETCH_TIMEOUT`        | seconds a blocking pop waits              | `2.0`                     |
//! | `THROTTLE_PAUSED_CACHE_TTL`     | seconds the paused-queue list is cached   | `5.0`                     |
//! | `REDIS_URL`                     | shared store location                     | `redis://localhost:6379`  |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ThrottleError, ThrottleResult};
use crate::id::QueueName;

const DEFAULT_COOLDOWN_PERIOD: Duration = Duration::from_secs(1);
const DEFAULT_COOLDOWN_THRESHOLD: u32 = 100;
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_PAUSED_CACHE_TTL: Duration = Duration::from_secs(5);
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// How a throttled job is put back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeueWith {
    /// Push to the tail of the target queue right away.
    #[default]
    Enqueue,
    /// Schedule for when the strategy expects capacity, with jitter.
    Schedule,
}

impl FromStr for RequeueWith {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enqueue" => Ok(Self::Enqueue),
            "schedule" => Ok(Self::Schedule),
            other => Err(ThrottleError::config(format!(
                "unknown requeue mode `{other}` (expected `enqueue` or `schedule`)"
            ))),
        }
    }
}

/// Where and how throttled jobs are requeued.
///
/// Used both as the process default and as a per-strategy override, in which
/// case `None` fields fall back to the default.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequeueOptions {
    /// Target queue; `None` keeps the job's own queue.
    pub to: Option<QueueName>,
    pub with: Option<RequeueWith>,
}

impl RequeueOptions {
    pub fn enqueue() -> Self {
        Self {
            to: None,
            with: Some(RequeueWith::Enqueue),
        }
    }

    pub fn schedule() -> Self {
        Self {
            to: None,
            with: Some(RequeueWith::Schedule),
        }
    }

    pub fn to(mut self, queue: impl Into<QueueName>) -> Self {
        self.to = Some(queue.into());
        self
    }

    /// Fill unset fields from `fallback`.
    pub fn or(&self, fallback: &RequeueOptions) -> RequeueOptions {
        RequeueOptions {
            to: self.to.clone().or_else(|| fallback.to.clone()),
            with: self.with.or(fallback.with),
        }
    }
}

/// Process-wide throttling configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    /// `None` disables cooldown entirely.
    pub cooldown_period: Option<Duration>,
    pub cooldown_threshold: u32,
    pub default_requeue: RequeueOptions,
    pub inherit_strategies: bool,
    pub namespace: Option<String>,
    pub fetch_timeout: Duration,
    pub paused_cache_ttl: Duration,
    pub redis_url: String,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            cooldown_period: Some(DEFAULT_COOLDOWN_PERIOD),
            cooldown_threshold: DEFAULT_COOLDOWN_THRESHOLD,
            default_requeue: RequeueOptions::enqueue(),
            inherit_strategies: false,
            namespace: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            paused_cache_ttl: DEFAULT_PAUSED_CACHE_TTL,
            redis_url: DEFAULT_REDIS_URL.to_string(),
        }
    }
}

impl ThrottleConfig {
    /// Load configuration from `THROTTLE_*` variables and `REDIS_URL`.
    pub fn from_env() -> ThrottleResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ThrottleResult<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("THROTTLE_COOLDOWN_PERIOD") {
            config.cooldown_period = match raw.trim().to_ascii_lowercase().as_str() {
                "" | "off" | "none" | "disabled" => None,
                value => Some(parse_seconds("THROTTLE_COOLDOWN_PERIOD", value)?),
            };
        }
        if let Some(raw) = lookup("THROTTLE_COOLDOWN_THRESHOLD") {
            config.cooldown_threshold = raw.trim().parse().map_err(|e| {
                ThrottleError::config(format!("THROTTLE_COOLDOWN_THRESHOLD: {e}"))
            })?;
        }
        if let Some(raw) = lookup("THROTTLE_REQUEUE_WITH") {
            config.default_requeue.with = Some(raw.parse()?);
        }
        if let Some(raw) = lookup("THROTTLE_REQUEUE_TO") {
            let raw = raw.trim();
            config.default_requeue.to = (!raw.is_empty()).then(|| QueueName::new(raw));
        }
        if let Some(raw) = lookup("THROTTLE_INHERIT_STRATEGIES") {
            config.inherit_strategies = parse_bool("THROTTLE_INHERIT_STRATEGIES", &raw)?;
        }
        if let Some(raw) = lookup("THROTTLE_NAMESPACE") {
            let raw = raw.trim();
            config.namespace = (!raw.is_empty()).then(|| raw.to_string());
        }
        if let Some(raw) = lookup("THROTTLE_FETCH_TIMEOUT") {
            config.fetch_timeout = parse_seconds("THROTTLE_FETCH_TIMEOUT", raw.trim())?;
        }
        if let Some(raw) = lookup("THROTTLE_PAUSED_CACHE_TTL") {
            config.paused_cache_ttl = parse_seconds("THROTTLE_PAUSED_CACHE_TTL", raw.trim())?;
        }
        if let Some(raw) = lookup("REDIS_URL") {
            config.redis_url = raw;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ThrottleResult<()> {
        if self.cooldown_threshold == 0 {
            return Err(ThrottleError::config("cooldown_threshold must be at least 1"));
        }
        if self.cooldown_period == Some(Duration::ZERO) {
            return Err(ThrottleError::config(
                "cooldown_period must be positive (use None to disable cooldown)",
            ));
        }
        Ok(())
    }

    pub fn with_cooldown(mut self, period: Option<Duration>, threshold: u32) -> Self {
        self.cooldown_period = period;
        self.cooldown_threshold = threshold;
        self
    }

    pub fn with_default_requeue(mut self, requeue: RequeueOptions) -> Self {
        self.default_requeue = requeue;
        self
    }

    pub fn with_inherit_strategies(mut self, inherit: bool) -> Self {
        self.inherit_strategies = inherit;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_paused_cache_ttl(mut self, ttl: Duration) -> Self {
        self.paused_cache_ttl = ttl;
        self
    }

    /// Prefix every store key gets (`"<namespace>:"` or empty).
    pub fn key_prefix(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:"),
            None => String::new(),
        }
    }
}

fn parse_seconds(var: &str, raw: &str) -> ThrottleResult<Duration> {
    let secs: f64 = raw
        .parse()
        .map_err(|e| ThrottleError::config(format!("{var}: {e}")))?;
    Duration::try_from_secs_f64(secs).map_err(|e| ThrottleError::config(format!("{var}: {e}")))
}

fn parse_bool(var: &str, raw: &str) -> ThrottleResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ThrottleError::config(format!("{var}: `{other}` is not a boolean"))),
    }
}
