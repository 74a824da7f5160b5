//! Cache layer trait and statistics.
//!
//! A cache layer is owned by exactly one entity and maps that entity's field
//! names to their last known values. Each field is in one of three states:
//!
//! ```text
//!   absent ── put ──→ dirty ── clear_dirty ──→ clean (or absent, per layer)
//!     │                 ↑                        │
//!     └──── fill ──→ clean ──────── put ─────────┘
//! ```
//!
//! `remove` returns any state to absent.

use std::sync::atomic::{AtomicU64, Ordering};

use activerow_core::Value;

/// Per-entity field cache.
///
/// Implementations synchronize internally; every method takes `&self` and may
/// be called from several threads at once.
pub trait CacheLayer: Send + Sync {
    /// Whether a value for `field` can be served without touching storage.
    fn contains(&self, field: &str) -> bool;

    /// The cached value, or `None` on a miss.
    fn get(&self, field: &str) -> Option<Value>;

    /// Record a local write. The field becomes dirty.
    fn put(&self, field: &str, value: Value);

    /// Cache a value read from storage. The field stays clean, and a dirty
    /// local value is never overwritten.
    fn fill(&self, field: &str, value: Value);

    /// Forget the field entirely, dirty or not.
    fn remove(&self, field: &str);

    fn dirty_contains(&self, field: &str) -> bool;

    /// Names of all dirty fields, sorted.
    fn dirty_fields(&self) -> Vec<String>;

    /// Mark every dirty field as flushed.
    fn clear_dirty(&self);

    /// Mark one field flushed after `saved` was written to storage. Does
    /// nothing and returns `false` if the field is no longer dirty with that
    /// value, so a write made after the save was prepared stays dirty.
    fn mark_clean(&self, field: &str, saved: &Value) -> bool;

    fn stats(&self) -> CacheStats;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Remote calls that failed and were treated as misses.
    pub remote_errors: u64,
    /// Writes not published because the value could not be serialized.
    pub skipped_writes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Lock-free counters backing [`CacheStats`].
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    remote_errors: AtomicU64,
    skipped_writes: AtomicU64,
}

impl CacheCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn remote_error(&self) {
        self.remote_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn skipped_write(&self) {
        self.skipped_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a lookup outcome and pass it through.
    pub(crate) fn record(&self, value: Option<Value>) -> Option<Value> {
        if value.is_some() {
            self.hit();
        } else {
            self.miss();
        }
        value
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            skipped_writes: self.skipped_writes.load(Ordering::Relaxed),
        }
    }
}
