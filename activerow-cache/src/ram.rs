//! Process-local field cache.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use activerow_core::Value;

use super::traits::{CacheCounters, CacheLayer, CacheStats};

/// Field values plus the set of fields written locally. Shared by the RAM
/// layer and by the shadowed layer's overlay.
#[derive(Debug, Default)]
pub(crate) struct RamState {
    values: HashMap<String, Value>,
    dirty: HashSet<String>,
}

impl RamState {
    pub(crate) fn contains(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    pub(crate) fn get(&self, field: &str) -> Option<Value> {
        self.values.get(field).cloned()
    }

    pub(crate) fn put(&mut self, field: &str, value: Value) {
        self.values.insert(field.to_string(), value);
        self.dirty.insert(field.to_string());
    }

    pub(crate) fn fill(&mut self, field: &str, value: Value) {
        if !self.dirty.contains(field) {
            self.values.insert(field.to_string(), value);
        }
    }

    pub(crate) fn remove(&mut self, field: &str) {
        self.values.remove(field);
        self.dirty.remove(field);
    }

    pub(crate) fn dirty_contains(&self, field: &str) -> bool {
        self.dirty.contains(field)
    }

    pub(crate) fn dirty_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self.dirty.iter().cloned().collect();
        fields.sort();
        fields
    }

    /// Whether `field` is dirty and still holds `saved`.
    pub(crate) fn holds_dirty(&self, field: &str, saved: &Value) -> bool {
        self.dirty.contains(field) && self.values.get(field).is_some_and(|v| v.same_as(saved))
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    pub(crate) fn clear(&mut self) {
        self.values.clear();
        self.dirty.clear();
    }
}

/// Baseline in-memory layer. Writes are visible immediately; `clear_dirty`
/// keeps every value and only forgets which ones were written locally.
#[derive(Debug, Default)]
pub struct RamCacheLayer {
    state: Mutex<RamState>,
    counters: CacheCounters,
}

impl RamCacheLayer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheLayer for RamCacheLayer {
    fn contains(&self, field: &str) -> bool {
        self.state().contains(field)
    }

    fn get(&self, field: &str) -> Option<Value> {
        let value = self.state().get(field);
        self.counters.record(value)
    }

    fn put(&self, field: &str, value: Value) {
        self.state().put(field, value);
    }

    fn fill(&self, field: &str, value: Value) {
        self.state().fill(field, value);
    }

    fn remove(&self, field: &str) {
        self.state().remove(field);
    }

    fn dirty_contains(&self, field: &str) -> bool {
        self.state().dirty_contains(field)
    }

    fn dirty_fields(&self) -> Vec<String> {
        self.state().dirty_fields()
    }

    fn clear_dirty(&self) {
        self.state().clear_dirty();
    }

    fn mark_clean(&self, field: &str, saved: &Value) -> bool {
        let mut state = self.state();
        if !state.holds_dirty(field, saved) {
            return false;
        }
        state.dirty.remove(field);
        true
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}
