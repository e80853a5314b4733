//! Infrastructure layer: Redis store, job queues and the throttled fetch.
//!
//! Everything here talks to the outside world. The decision logic itself
//! lives in `throttlekit-limits`; this crate wires it to a store, a clock and
//! the host's queues through [`Throttling`] and [`ThrottledFetch`].

pub mod admin;
pub mod fetch;
pub mod paused;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_store;
#[cfg(feature = "redis")]
pub mod script;
pub mod throttling;

mod integration_tests;

pub use admin::{ConcurrencyStats, MemberStats, StrategyStats, ThresholdStats};
pub use fetch::{FetchError, ThrottledFetch, UnitOfWork};
pub use paused::PausedQueues;
#[cfg(feature = "redis")]
pub use queue::RedisQueue;
pub use queue::{InMemoryQueue, PoppedJob, QueueBackend, QueueError, QueueResult};
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
#[cfg(feature = "redis")]
pub use script::ScriptExecutor;
pub use throttling::{DEFAULT_QUEUE, RequeueTarget, Throttling};
