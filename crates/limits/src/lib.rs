//! `throttlekit-limits`: throttling rules and their evaluation.
//!
//! - [`Concurrency`]: bounds jobs in flight per fingerprint
//! - [`Threshold`]: bounds job starts per rolling window
//! - [`Strategy`] / [`StrategyCollection`]: compose checks with rollback
//! - [`Registry`]: resolves a job type to its rule
//! - [`Cooldown`]: skips saturated queues for a while
//!
//! All shared state goes through a [`throttlekit_store::ThrottleStore`]; the
//! in-process pieces (registry, cooldown) are rebuilt on restart.

pub mod backend;
pub mod collection;
pub mod concurrency;
pub mod cooldown;
pub mod expiring;
pub mod registry;
pub mod strategy;
pub mod threshold;

pub use backend::Backend;
pub use collection::StrategyCollection;
pub use concurrency::{Concurrency, ConcurrencyOptions, DEFAULT_LOST_JOB_THRESHOLD};
pub use cooldown::Cooldown;
pub use expiring::{ExpiringList, ExpiringSet};
pub use registry::{Registry, ThrottleRule};
pub use strategy::{Observer, Strategy, StrategyOptions, ThrottleKind};
pub use threshold::{Threshold, ThresholdOptions};
