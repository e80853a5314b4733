//! `throttlekit-core`: building blocks shared by every throttling layer.
//!
//! This crate contains **pure** primitives (no store or queue IO).

pub mod args;
pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod message;

pub use args::{ArgsValue, JobArgs, KeySuffix, Limit, Period};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RequeueOptions, RequeueWith, ThrottleConfig};
pub use error::{ParseError, StoreError, StoreResult, ThrottleError, ThrottleResult};
pub use id::{JobId, QueueName};
pub use message::Message;
