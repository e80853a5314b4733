//! In-memory store for tests/dev.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use throttlekit_core::{StoreError, StoreResult};

use crate::store::ThrottleStore;

/// In-memory throttle store.
///
/// - No IO
/// - One mutex over all state, so every operation is atomic like a store
///   script
/// - Expiry is evaluated against the `now` each caller passes in, which lets
///   tests drive time with a manual clock
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    /// key -> (job id -> expiry timestamp), for buckets and backlogs alike
    buckets: HashMap<String, HashMap<String, f64>>,
    windows: HashMap<String, Window>,
    sets: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug)]
struct Window {
    /// Newest first.
    stamps: VecDeque<f64>,
    expires_at: f64,
}

impl State {
    fn live_bucket(&mut self, key: &str, now: f64) -> Option<&mut HashMap<String, f64>> {
        let bucket = self.buckets.get_mut(key)?;
        bucket.retain(|_, expires_at| *expires_at >= now);
        Some(bucket)
    }

    fn remove_member(&mut self, key: &str, member: &str) {
        if let Some(bucket) = self.buckets.get_mut(key) {
            bucket.remove(member);
            if bucket.is_empty() {
                self.buckets.remove(key);
            }
        }
    }

    fn live_window(&mut self, key: &str, now: f64) -> Option<&Window> {
        if self.windows.get(key).is_some_and(|w| w.expires_at <= now) {
            self.windows.remove(key);
        }
        self.windows.get(key)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl ThrottleStore for InMemoryStore {
    fn concurrency_acquire(
        &self,
        key: &str,
        backlog_key: &str,
        job_id: &str,
        limit: u64,
        ttl: f64,
        now: f64,
    ) -> StoreResult<bool> {
        let mut state = self.lock()?;
        state.live_bucket(key, now);
        state.live_bucket(backlog_key, now);
        let bucket = state.buckets.entry(key.to_string()).or_default();

        if bucket.len() as u64 >= limit && !bucket.contains_key(job_id) {
            state
                .buckets
                .entry(backlog_key.to_string())
                .or_default()
                .entry(job_id.to_string())
                .or_insert(now + ttl);
            return Ok(true);
        }

        bucket.insert(job_id.to_string(), now + ttl);
        state.remove_member(backlog_key, job_id);
        Ok(false)
    }

    fn concurrency_release(&self, key: &str, backlog_key: &str, job_id: &str) -> StoreResult<()> {
        let mut state = self.lock()?;
        state.remove_member(key, job_id);
        state.remove_member(backlog_key, job_id);
        Ok(())
    }

    fn concurrency_backlog_position(
        &self,
        backlog_key: &str,
        job_id: &str,
        now: f64,
    ) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let Some(backlog) = state.live_bucket(backlog_key, now) else {
            return Ok(1);
        };

        let Some(&joined) = backlog.get(job_id) else {
            return Ok(backlog.len() as u64 + 1);
        };
        let ahead = backlog
            .iter()
            .filter(|(id, expires_at)| (**expires_at, id.as_str()) < (joined, job_id))
            .count();
        Ok(ahead as u64 + 1)
    }

    fn concurrency_count(&self, key: &str, now: f64) -> StoreResult<u64> {
        let mut state = self.lock()?;
        Ok(state.live_bucket(key, now).map_or(0, |b| b.len() as u64))
    }

    fn concurrency_oldest_expiry(&self, key: &str, now: f64) -> StoreResult<Option<f64>> {
        let mut state = self.lock()?;
        Ok(state
            .live_bucket(key, now)
            .and_then(|b| b.values().copied().reduce(f64::min)))
    }

    fn threshold_acquire(&self, key: &str, limit: u64, period: f64, now: f64) -> StoreResult<bool> {
        if limit == 0 {
            return Ok(true);
        }

        let mut state = self.lock()?;

        if let Some(window) = state.live_window(key, now) {
            let full = window.stamps.len() as u64 >= limit;
            let oldest_is_young = window.stamps.back().is_some_and(|oldest| now - oldest < period);
            if full && oldest_is_young {
                return Ok(true);
            }
        }

        let window = state.windows.entry(key.to_string()).or_insert_with(|| Window {
            stamps: VecDeque::new(),
            expires_at: now + period,
        });
        window.stamps.push_front(now);
        window.stamps.truncate(limit as usize);
        window.expires_at = now + period;
        Ok(false)
    }

    fn threshold_count(&self, key: &str, now: f64) -> StoreResult<u64> {
        let mut state = self.lock()?;
        Ok(state.live_window(key, now).map_or(0, |w| w.stamps.len() as u64))
    }

    fn threshold_oldest(&self, key: &str, now: f64) -> StoreResult<Option<f64>> {
        let mut state = self.lock()?;
        Ok(state
            .live_window(key, now)
            .and_then(|w| w.stamps.back().copied()))
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let mut state = self.lock()?;
        state.buckets.remove(key);
        state.windows.remove(key);
        state.sets.remove(key);
        Ok(())
    }

    fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut state = self.lock()?;
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut state = self.lock()?;
        if let Some(set) = state.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let state = self.lock()?;
        Ok(state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
