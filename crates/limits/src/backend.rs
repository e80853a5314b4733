//! Store handle shared by every strategy of a process.

use std::sync::Arc;

use throttlekit_core::{Clock, SystemClock};
use throttlekit_store::ThrottleStore;

/// Store, clock and key namespace bundled together.
///
/// Cheap to clone; all clones talk to the same store.
#[derive(Clone)]
pub struct Backend {
    store: Arc<dyn ThrottleStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl Backend {
    pub fn new(store: Arc<dyn ThrottleStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            key_prefix: String::new(),
        }
    }

    /// Wall-clock backend.
    pub fn system(store: Arc<dyn ThrottleStore>) -> Self {
        Self::new(store, Arc::new(SystemClock))
    }

    /// Prefix every key with `"<prefix>"` (usually `"<namespace>:"`).
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn store(&self) -> &dyn ThrottleStore {
        self.store.as_ref()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// Fully qualified store key.
    pub fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

impl core::fmt::Debug for Backend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Backend")
            .field("store", &"<dyn ThrottleStore>")
            .field("clock", &self.clock)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}
