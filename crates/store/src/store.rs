//! Shared-store abstraction (mechanics only).
//!
//! Every cross-process piece of throttling state lives behind this trait:
//!
//! - **Concurrency buckets**: sets of job ids, each entry expiring on its own
//!   (the lost-job threshold) so crashed workers never leak a slot forever.
//! - **Concurrency backlogs**: job ids turned away by a full bucket, in order
//!   of their first rejection, each expiring after the lost-job threshold.
//! - **Threshold windows**: newest-first lists of start timestamps, trimmed to
//!   `limit` entries, the whole window expiring `period` after the last write.
//! - **Plain sets**: the paused-queue list.
//!
//! Each `*_acquire` call must be one indivisible operation: no concurrent
//! caller may observe a partially applied admission. Composite decisions
//! (strategies, collections) are built from several such calls plus
//! compensating releases.
//!
//! Timestamps are Unix seconds supplied by the caller's clock, so every
//! process evaluating a bucket agrees on what "expired" means.

use std::sync::Arc;

use throttlekit_core::StoreResult;

/// Atomic operations the throttling strategies need from the shared store.
///
/// The trait requires `Send + Sync`; one store is shared by every strategy and
/// every worker thread of a process.
pub trait ThrottleStore: Send + Sync {
    /// Admit `job_id` into the bucket unless it already holds `limit` live
    /// entries. A job already present is re-admitted with a fresh expiry.
    ///
    /// A throttled job joins `backlog_key` (keeping its place if it is
    /// already waiting); an admitted one leaves it.
    ///
    /// Returns `true` when the job is throttled.
    fn concurrency_acquire(
        &self,
        key: &str,
        backlog_key: &str,
        job_id: &str,
        limit: u64,
        ttl: f64,
        now: f64,
    ) -> StoreResult<bool>;

    /// Remove `job_id` from the bucket and the backlog. Removing an absent id
    /// is a no-op.
    fn concurrency_release(&self, key: &str, backlog_key: &str, job_id: &str) -> StoreResult<()>;

    /// 1-based place of `job_id` among live backlog entries, or the place it
    /// would take by joining now.
    fn concurrency_backlog_position(
        &self,
        backlog_key: &str,
        job_id: &str,
        now: f64,
    ) -> StoreResult<u64>;

    /// Number of live (non-expired) entries.
    fn concurrency_count(&self, key: &str, now: f64) -> StoreResult<u64>;

    /// Expiry timestamp of the entry that expires first, if any.
    fn concurrency_oldest_expiry(&self, key: &str, now: f64) -> StoreResult<Option<f64>>;

    /// Record a start at `now` unless the window already holds `limit`
    /// entries the oldest of which is younger than `period`.
    ///
    /// Returns `true` when the job is throttled; a throttled call leaves the
    /// window untouched.
    fn threshold_acquire(&self, key: &str, limit: u64, period: f64, now: f64) -> StoreResult<bool>;

    /// Number of timestamps in the window.
    fn threshold_count(&self, key: &str, now: f64) -> StoreResult<u64>;

    /// Oldest timestamp retained in the window.
    fn threshold_oldest(&self, key: &str, now: f64) -> StoreResult<Option<f64>>;

    /// Drop a key of any kind.
    fn delete(&self, key: &str) -> StoreResult<()>;

    fn set_add(&self, key: &str, member: &str) -> StoreResult<()>;

    fn set_remove(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Members in ascending order.
    fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;
}

impl<S> ThrottleStore for Arc<S>
where
    S: ThrottleStore + ?Sized,
{
    fn concurrency_acquire(
        &self,
        key: &str,
        backlog_key: &str,
        job_id: &str,
        limit: u64,
        ttl: f64,
        now: f64,
    ) -> StoreResult<bool> {
        (**self).concurrency_acquire(key, backlog_key, job_id, limit, ttl, now)
    }

    fn concurrency_release(&self, key: &str, backlog_key: &str, job_id: &str) -> StoreResult<()> {
        (**self).concurrency_release(key, backlog_key, job_id)
    }

    fn concurrency_backlog_position(
        &self,
        backlog_key: &str,
        job_id: &str,
        now: f64,
    ) -> StoreResult<u64> {
        (**self).concurrency_backlog_position(backlog_key, job_id, now)
    }

    fn concurrency_count(&self, key: &str, now: f64) -> StoreResult<u64> {
        (**self).concurrency_count(key, now)
    }

    fn concurrency_oldest_expiry(&self, key: &str, now: f64) -> StoreResult<Option<f64>> {
        (**self).concurrency_oldest_expiry(key, now)
    }

    fn threshold_acquire(&self, key: &str, limit: u64, period: f64, now: f64) -> StoreResult<bool> {
        (**self).threshold_acquire(key, limit, period, now)
    }

    fn threshold_count(&self, key: &str, now: f64) -> StoreResult<u64> {
        (**self).threshold_count(key, now)
    }

    fn threshold_oldest(&self, key: &str, now: f64) -> StoreResult<Option<f64>> {
        (**self).threshold_oldest(key, now)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        (**self).delete(key)
    }

    fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        (**self).set_add(key, member)
    }

    fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        (**self).set_remove(key, member)
    }

    fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        (**self).set_members(key)
    }
}
