//! Per-run cache shared between dimensions.
//!
//! Late dimensions reuse expensive lookups computed by earlier ones through
//! this cache. It is owned by exactly one run and dropped with it; entries are
//! never evicted before that.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Computed = Arc<dyn Any + Send + Sync>;

/// Run-scoped result and memoization cache.
#[derive(Default)]
pub struct PipelineContext {
    results: Mutex<HashMap<String, serde_json::Value>>,
    computed: Mutex<HashMap<String, Computed>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn result_key(dimension_id: &str, sub_topic: &str) -> String {
    format!("{dimension_id}:{sub_topic}")
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a dimension's result for a sub-topic. Last write wins.
    pub fn cache_result(&self, dimension_id: &str, sub_topic: &str, data: serde_json::Value) {
        lock(&self.results).insert(result_key(dimension_id, sub_topic), data);
    }

    pub fn get_cached_result(&self, dimension_id: &str, sub_topic: &str) -> Option<serde_json::Value> {
        lock(&self.results)
            .get(&result_key(dimension_id, sub_topic))
            .cloned()
    }

    pub fn has_cached_result(&self, dimension_id: &str, sub_topic: &str) -> bool {
        lock(&self.results).contains_key(&result_key(dimension_id, sub_topic))
    }

    /// Store an arbitrary computed value under `key`, replacing any previous one.
    pub fn set_computed<T: Any + Send + Sync>(&self, key: &str, value: T) {
        lock(&self.computed).insert(key.to_string(), Arc::new(value));
    }

    /// Fetch a computed value. Returns `None` if absent or stored with another type.
    pub fn get_computed<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let entry = lock(&self.computed).get(key).cloned()?;
        entry.downcast::<T>().ok()
    }

    /// Return the value for `key`, computing it with `f` on first use.
    ///
    /// `f` runs at most once per key for the lifetime of the context. It runs
    /// without the lock held, so it may itself read the context.
    pub fn get_or_compute<T, F>(&self, key: &str, f: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get_computed::<T>(key) {
            return existing;
        }

        let value: Arc<T> = Arc::new(f());
        let mut computed = lock(&self.computed);
        let entry = computed
            .entry(key.to_string())
            .or_insert_with(|| value.clone() as Computed)
            .clone();
        drop(computed);
        entry.downcast::<T>().unwrap_or(value)
    }

    /// Number of cached dimension results.
    pub fn cached_result_count(&self) -> usize {
        lock(&self.results).len()
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        lock(&self.results).clear();
        lock(&self.computed).clear();
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("results", &lock(&self.results).len())
            .field("computed", &lock(&self.computed).len())
            .finish()
    }
}
