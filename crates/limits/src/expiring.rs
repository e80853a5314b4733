//! Small in-process collections whose entries lapse after a TTL.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use throttlekit_core::Clock;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Set where every member expires `ttl` after it was last added.
#[derive(Debug)]
pub struct ExpiringSet<T> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<BTreeMap<T, f64>>,
}

impl<T: Ord + Clone> ExpiringSet<T> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Add `item`, refreshing its expiry when already present.
    pub fn add(&self, item: T) {
        let expires_at = self.clock.now() + self.ttl.as_secs_f64();
        lock(&self.entries).insert(item, expires_at);
    }

    pub fn contains(&self, item: &T) -> bool {
        self.live().contains_key(item)
    }

    /// Live members in order.
    pub fn snapshot(&self) -> Vec<T> {
        self.live().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    fn live(&self) -> MutexGuard<'_, BTreeMap<T, f64>> {
        let now = self.clock.now();
        let mut entries = lock(&self.entries);
        entries.retain(|_, expires_at| *expires_at > now);
        entries
    }
}

#[derive(Debug)]
struct ListState<T> {
    entries: Vec<(T, f64)>,
    refreshed_at: Option<f64>,
}

/// Insertion-ordered list with per-entry expiry.
///
/// Used as a read-through cache: [`ExpiringList::replace`] installs a fresh
/// copy and [`ExpiringList::is_stale`] says when to fetch again.
#[derive(Debug)]
pub struct ExpiringList<T> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<ListState<T>>,
}

impl<T: Clone> ExpiringList<T> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            state: Mutex::new(ListState {
                entries: Vec::new(),
                refreshed_at: None,
            }),
        }
    }

    pub fn push(&self, item: T) {
        let expires_at = self.clock.now() + self.ttl.as_secs_f64();
        lock(&self.state).entries.push((item, expires_at));
    }

    /// Swap in `items`, all valid for one TTL from now.
    pub fn replace(&self, items: impl IntoIterator<Item = T>) {
        let now = self.clock.now();
        let expires_at = now + self.ttl.as_secs_f64();
        let mut state = lock(&self.state);
        state.entries = items.into_iter().map(|item| (item, expires_at)).collect();
        state.refreshed_at = Some(now);
    }

    pub fn snapshot(&self) -> Vec<T> {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        state.entries.retain(|(_, expires_at)| *expires_at > now);
        state.entries.iter().map(|(item, _)| item.clone()).collect()
    }

    /// Never replaced, or the last replacement has lapsed.
    pub fn is_stale(&self) -> bool {
        let now = self.clock.now();
        match lock(&self.state).refreshed_at {
            Some(at) => at + self.ttl.as_secs_f64() <= now,
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and mark the list stale.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        state.refreshed_at = None;
    }
}
