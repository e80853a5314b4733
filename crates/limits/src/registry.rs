//! Name → rule lookup.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use throttlekit_core::{JobArgs, JobId, RequeueOptions, ThrottleError, ThrottleResult};
use tracing::{info, warn};

use crate::backend::Backend;
use crate::collection::StrategyCollection;
use crate::strategy::{Strategy, StrategyOptions};

/// A registered rule: one strategy or a collection.
#[derive(Debug, Clone)]
pub enum ThrottleRule {
    Single(Strategy),
    Collection(StrategyCollection),
}

impl ThrottleRule {
    pub fn name(&self) -> &str {
        match self {
            Self::Single(s) => s.name(),
            Self::Collection(c) => c.name(),
        }
    }

    pub fn strategies(&self) -> &[Strategy] {
        match self {
            Self::Single(s) => std::slice::from_ref(s),
            Self::Collection(c) => c.strategies(),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        match self {
            Self::Single(s) => s.is_dynamic(),
            Self::Collection(c) => c.is_dynamic(),
        }
    }

    pub fn requeue_options(&self) -> Option<&RequeueOptions> {
        match self {
            Self::Single(s) => s.requeue_options(),
            Self::Collection(c) => c.requeue_options(),
        }
    }

    pub fn throttled(&self, job_id: &JobId, args: &JobArgs) -> ThrottleResult<bool> {
        match self {
            Self::Single(s) => s.throttled(job_id, args),
            Self::Collection(c) => c.throttled(job_id, args),
        }
    }

    pub fn finalize(&self, job_id: &JobId, args: &JobArgs) -> ThrottleResult<()> {
        match self {
            Self::Single(s) => s.finalize(job_id, args),
            Self::Collection(c) => c.finalize(job_id, args),
        }
    }

    pub fn reset(&self, args: &JobArgs) -> ThrottleResult<()> {
        match self {
            Self::Single(s) => s.reset(args),
            Self::Collection(c) => c.reset(args),
        }
    }

    pub fn retry_in(&self, job_id: &JobId, args: &JobArgs) -> ThrottleResult<Duration> {
        match self {
            Self::Single(s) => s.retry_in(job_id, args),
            Self::Collection(c) => c.retry_in(job_id, args),
        }
    }
}

#[derive(Debug, Default)]
struct Entries {
    rules: HashMap<String, Arc<ThrottleRule>>,
    aliases: HashMap<String, Arc<ThrottleRule>>,
    /// child -> parent
    parents: HashMap<String, String>,
}

/// Rules by job type name, with aliases and declared parents.
///
/// Populated at startup; lookups take a read lock only.
#[derive(Debug)]
pub struct Registry {
    backend: Backend,
    inherit: bool,
    entries: RwLock<Entries>,
}

impl Registry {
    pub fn new(backend: Backend, inherit: bool) -> Self {
        Self {
            backend,
            inherit,
            entries: RwLock::new(Entries::default()),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Register a strategy under `name`. A second registration replaces the first.
    pub fn add(&self, name: &str, options: StrategyOptions) -> ThrottleResult<Arc<ThrottleRule>> {
        let strategy = Strategy::new(self.backend.clone(), name, options)?;
        Ok(self.insert(name, ThrottleRule::Single(strategy)))
    }

    pub fn add_collection(
        &self,
        name: &str,
        members: Vec<StrategyOptions>,
    ) -> ThrottleResult<Arc<ThrottleRule>> {
        let collection = StrategyCollection::new(self.backend.clone(), name, members)?;
        Ok(self.insert(name, ThrottleRule::Collection(collection)))
    }

    /// Make `new_name` resolve to the rule registered as `old_name`.
    pub fn add_alias(&self, new_name: &str, old_name: &str) -> ThrottleResult<Arc<ThrottleRule>> {
        let mut entries = self.write();
        let target = entries
            .rules
            .get(old_name)
            .or_else(|| entries.aliases.get(old_name))
            .cloned()
            .ok_or_else(|| ThrottleError::UnknownStrategy(old_name.to_string()))?;

        if entries
            .aliases
            .insert(new_name.to_string(), Arc::clone(&target))
            .is_some()
        {
            warn!(alias = %new_name, "duplicate throttling alias; replacing");
        }
        Ok(target)
    }

    /// Declare that jobs of type `child` inherit `parent`'s rule.
    ///
    /// Only consulted when inheritance is enabled.
    pub fn declare_parent(&self, child: &str, parent: &str) {
        self.write()
            .parents
            .insert(child.to_string(), parent.to_string());
    }

    /// Exact name, then alias, then the declared parent chain.
    pub fn get(&self, name: &str) -> Option<Arc<ThrottleRule>> {
        let entries = self.read();
        if let Some(rule) = Self::lookup(&entries, name) {
            return Some(rule);
        }
        if !self.inherit {
            return None;
        }

        let mut seen = HashSet::from([name]);
        let mut current = name;
        while let Some(parent) = entries.parents.get(current) {
            if !seen.insert(parent.as_str()) {
                warn!(job_class = %name, parent = %parent, "cycle in declared parents");
                return None;
            }
            if let Some(rule) = Self::lookup(&entries, parent) {
                return Some(rule);
            }
            current = parent.as_str();
        }
        None
    }

    /// Registered rules (aliases excluded), sorted by name.
    pub fn each(&self) -> Vec<(String, Arc<ThrottleRule>)> {
        let entries = self.read();
        let mut rules: Vec<_> = entries
            .rules
            .iter()
            .map(|(name, rule)| (name.clone(), Arc::clone(rule)))
            .collect();
        rules.sort_by(|a, b| a.0.cmp(&b.0));
        rules
    }

    /// Like [`Registry::each`], without rules whose keys depend on arguments.
    pub fn each_with_static_keys(&self) -> Vec<(String, Arc<ThrottleRule>)> {
        self.each()
            .into_iter()
            .filter(|(_, rule)| !rule.is_dynamic())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, name: &str, rule: ThrottleRule) -> Arc<ThrottleRule> {
        let rule = Arc::new(rule);
        let replaced = self
            .write()
            .rules
            .insert(name.to_string(), Arc::clone(&rule))
            .is_some();
        if replaced {
            warn!(strategy = %name, "duplicate throttling strategy; replacing");
        } else {
            info!(strategy = %name, dynamic = rule.is_dynamic(), "throttling strategy registered");
        }
        rule
    }

    fn lookup(entries: &Entries, name: &str) -> Option<Arc<ThrottleRule>> {
        entries
            .rules
            .get(name)
            .or_else(|| entries.aliases.get(name))
            .cloned()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}
