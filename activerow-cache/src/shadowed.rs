//! Local dirty overlay in front of a shared remote cache.
//!
//! Reads of a field written locally are served by the overlay and never
//! reach the remote cache until `clear_dirty`. Everything else is read from
//! the remote cache under `"{prefix}{field}"`. A field is published remotely
//! once, on its first write or fill, with add semantics; later writes to the
//! same dirty field stay local.
//!
//! Remote failures degrade to misses. The overlay lock is held across remote
//! calls so a field's first write publishes exactly once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use activerow_core::{CacheError, Value};

use super::ram::RamState;
use super::remote::RemoteCache;
use super::traits::{CacheCounters, CacheLayer, CacheStats};

pub struct ShadowedCacheLayer {
    remote: Arc<dyn RemoteCache>,
    prefix: String,
    expiry: Duration,
    overlay: Mutex<RamState>,
    counters: CacheCounters,
}

impl std::fmt::Debug for ShadowedCacheLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowedCacheLayer")
            .field("prefix", &self.prefix)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl ShadowedCacheLayer {
    pub fn new(remote: Arc<dyn RemoteCache>, prefix: impl Into<String>, expiry: Duration) -> Self {
        Self {
            remote,
            prefix: prefix.into(),
            expiry,
            overlay: Mutex::new(RamState::default()),
            counters: CacheCounters::default(),
        }
    }

    /// Remote key prefix, e.g. `activerow.person.1.`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn overlay(&self) -> MutexGuard<'_, RamState> {
        self.overlay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remote_key(&self, field: &str) -> String {
        format!("{}{}", self.prefix, field)
    }

    fn degraded(&self, op: &'static str, key: &str, error: &CacheError) {
        self.counters.remote_error();
        tracing::warn!(op, key, error = %error, "remote cache call failed, treating as miss");
    }

    /// Add `value` remotely unless it cannot be encoded. Returns whether the
    /// value was encodable.
    fn publish(&self, field: &str, value: &Value) -> bool {
        let key = self.remote_key(field);
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.counters.skipped_write();
                tracing::trace!(key = %key, reason = %e, "value not serializable, skipping remote write");
                return false;
            }
        };
        match self.remote.add(&key, self.expiry, bytes) {
            Ok(stored) => tracing::trace!(key = %key, stored, "remote add"),
            Err(e) => self.degraded("add", &key, &e),
        }
        true
    }

    fn remote_contains(&self, field: &str) -> bool {
        let key = self.remote_key(field);
        match self.remote.find_keys(&key) {
            Ok(keys) => keys.contains(&key),
            Err(e) => {
                self.degraded("find_keys", &key, &e);
                false
            }
        }
    }

    fn remote_get(&self, field: &str) -> Option<Value> {
        let key = self.remote_key(field);
        let bytes = match self.remote.get(&key) {
            Ok(bytes) => bytes?,
            Err(e) => {
                self.degraded("get", &key, &e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                let error = CacheError::Serialization {
                    key: key.clone(),
                    reason: e.to_string(),
                };
                self.degraded("decode", &key, &error);
                None
            }
        }
    }
}

impl CacheLayer for ShadowedCacheLayer {
    fn contains(&self, field: &str) -> bool {
        let overlay = self.overlay();
        if overlay.dirty_contains(field) && overlay.contains(field) {
            return true;
        }
        self.remote_contains(field)
    }

    fn get(&self, field: &str) -> Option<Value> {
        let overlay = self.overlay();
        let value = if overlay.dirty_contains(field) {
            overlay.get(field)
        } else {
            self.remote_get(field)
        };
        self.counters.record(value)
    }

    fn put(&self, field: &str, value: Value) {
        let mut overlay = self.overlay();
        if !overlay.dirty_contains(field) {
            self.publish(field, &value);
        }
        overlay.put(field, value);
    }

    fn fill(&self, field: &str, value: Value) {
        let overlay = self.overlay();
        if !overlay.dirty_contains(field) {
            self.publish(field, &value);
        }
    }

    fn remove(&self, field: &str) {
        let mut overlay = self.overlay();
        let was_dirty = overlay.dirty_contains(field);
        overlay.remove(field);
        if !was_dirty {
            let key = self.remote_key(field);
            if let Err(e) = self.remote.delete(&key) {
                self.degraded("delete", &key, &e);
            }
        }
    }

    fn dirty_contains(&self, field: &str) -> bool {
        self.overlay().dirty_contains(field)
    }

    fn dirty_fields(&self) -> Vec<String> {
        self.overlay().dirty_fields()
    }

    fn mark_clean(&self, field: &str, saved: &Value) -> bool {
        let mut overlay = self.overlay();
        if !overlay.holds_dirty(field, saved) {
            return false;
        }
        overlay.remove(field);
        // Replace whatever the field's first write published.
        let key = self.remote_key(field);
        if let Err(e) = self.remote.delete(&key) {
            self.degraded("delete", &key, &e);
        }
        self.publish(field, saved);
        true
    }

    /// Drops the overlay outright. Values written since the last remote
    /// publish are not pushed to the remote cache first.
    fn clear_dirty(&self) {
        self.overlay().clear();
    }

    fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemoteCache;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOUR: Duration = Duration::from_secs(3600);

    /// Counts remote calls and optionally fails all of them.
    #[derive(Default)]
    struct CountingRemote {
        inner: InMemoryRemoteCache,
        calls: AtomicUsize,
        adds: AtomicUsize,
        failing: bool,
    }

    impl CountingRemote {
        fn failing() -> Self {
            Self {
                failing: true,
                ..Default::default()
            }
        }

        fn enter(&self) -> Result<(), CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing {
                Err(CacheError::Unavailable {
                    reason: "connection refused".to_string(),
                })
            } else {
                Ok(())
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RemoteCache for CountingRemote {
        fn add(&self, key: &str, ttl: Duration, value: Vec<u8>) -> Result<bool, CacheError> {
            self.enter()?;
            self.adds.fetch_add(1, Ordering::SeqCst);
            self.inner.add(key, ttl, value)
        }

        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            self.enter()?;
            self.inner.get(key)
        }

        fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.enter()?;
            self.inner.delete(key)
        }

        fn find_keys(&self, pattern: &str) -> Result<HashSet<String>, CacheError> {
            self.enter()?;
            self.inner.find_keys(pattern)
        }
    }

    fn layer(remote: &Arc<CountingRemote>) -> ShadowedCacheLayer {
        ShadowedCacheLayer::new(remote.clone(), "activerow.person.1.", HOUR)
    }

    #[test]
    fn test_first_put_publishes_and_stays_dirty() {
        let remote = Arc::new(CountingRemote::default());
        let layer = layer(&remote);

        layer.put("name", Value::from("Alice"));
        assert!(layer.dirty_contains("name"));
        assert_eq!(remote.adds.load(Ordering::SeqCst), 1);
        assert!(remote
            .inner
            .find_keys("activerow.person.1.name")
            .unwrap()
            .contains("activerow.person.1.name"));
    }

    #[test]
    fn test_dirty_field_never_consults_remote() {
        let remote = Arc::new(CountingRemote::default());
        let layer = layer(&remote);

        layer.put("name", Value::from("Alice"));
        let after_put = remote.calls();
        layer.put("name", Value::from("Alicia"));
        assert_eq!(layer.get("name"), Some(Value::from("Alicia")));
        assert!(layer.contains("name"));
        assert_eq!(remote.calls(), after_put);
    }

    #[test]
    fn test_clean_reads_come_from_remote() {
        let remote = Arc::new(CountingRemote::default());
        let layer = layer(&remote);

        layer.fill("age", Value::Int(30));
        assert!(!layer.dirty_contains("age"));
        assert!(layer.contains("age"));
        assert_eq!(layer.get("age"), Some(Value::Int(30)));
        assert_eq!(layer.get("missing"), None);
        assert_eq!(layer.stats().hits, 1);
        assert_eq!(layer.stats().misses, 1);
    }

    #[test]
    fn test_clear_dirty_discards_overlay_values() {
        let remote = Arc::new(CountingRemote::default());
        let layer = layer(&remote);

        layer.put("name", Value::from("Alice"));
        layer.put("name", Value::from("Alicia"));
        layer.clear_dirty();

        assert!(!layer.dirty_contains("name"));
        // The remote still holds the first published value.
        assert_eq!(layer.get("name"), Some(Value::from("Alice")));
    }

    #[test]
    fn test_remove_deletes_remotely_only_when_clean() {
        let remote = Arc::new(CountingRemote::default());
        let layer = layer(&remote);

        layer.fill("age", Value::Int(30));
        layer.remove("age");
        assert!(!layer.contains("age"));

        layer.put("name", Value::from("Alice"));
        layer.remove("name");
        assert!(!layer.dirty_contains("name"));
        // Dirty removal leaves the published entry alone.
        assert!(layer.contains("name"));
    }

    #[test]
    fn test_opaque_values_stay_local() {
        let remote = Arc::new(CountingRemote::default());
        let layer = layer(&remote);

        let handle = Value::opaque(42u8);
        layer.put("blob", handle.clone());
        assert_eq!(layer.get("blob"), Some(handle));
        assert_eq!(remote.adds.load(Ordering::SeqCst), 0);
        assert_eq!(layer.stats().skipped_writes, 1);

        layer.clear_dirty();
        assert_eq!(layer.get("blob"), None);
    }

    #[test]
    fn test_mark_clean_republishes_saved_value() {
        let remote = Arc::new(CountingRemote::default());
        let layer = layer(&remote);

        layer.put("name", Value::from("Alice"));
        layer.put("name", Value::from("Alicia"));
        assert!(layer.mark_clean("name", &Value::from("Alicia")));
        assert!(!layer.dirty_contains("name"));
        assert_eq!(layer.get("name"), Some(Value::from("Alicia")));
    }

    #[test]
    fn test_mark_clean_keeps_newer_write_dirty() {
        let remote = Arc::new(CountingRemote::default());
        let layer = layer(&remote);

        layer.put("name", Value::from("Alicia"));
        layer.put("name", Value::from("Newest"));
        let before = remote.calls();
        assert!(!layer.mark_clean("name", &Value::from("Alicia")));
        assert_eq!(remote.calls(), before);
        assert!(layer.dirty_contains("name"));
        assert_eq!(layer.get("name"), Some(Value::from("Newest")));
    }

    #[test]
    fn test_non_finite_float_is_served_from_remote() {
        let remote = Arc::new(CountingRemote::default());
        let layer = layer(&remote);

        layer.fill("ratio", Value::Float(f64::NAN));
        assert!(layer.contains("ratio"));
        let value = layer.get("ratio").unwrap();
        assert!(value.same_as(&Value::Float(f64::NAN)));
        assert_eq!(layer.stats().remote_errors, 0);
    }

    #[test]
    fn test_remote_failures_are_misses() {
        let remote = Arc::new(CountingRemote::failing());
        let layer = layer(&remote);

        layer.fill("age", Value::Int(30));
        assert!(!layer.contains("age"));
        assert_eq!(layer.get("age"), None);
        layer.remove("age");

        layer.put("name", Value::from("Alice"));
        assert_eq!(layer.get("name"), Some(Value::from("Alice")));
        assert_eq!(layer.stats().remote_errors, 5);
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        fn scalar() -> impl Strategy<Value = Value> {
            prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Bool),
                any::<i64>().prop_map(Value::Int),
                "[a-z]{0,8}".prop_map(Value::Text),
            ]
        }

        proptest! {
            /// However many times a field is rewritten, the remote cache is
            /// written once and the last value is what reads return.
            #[test]
            fn prop_rewrites_publish_once(values in prop::collection::vec(scalar(), 1..8)) {
                let remote = Arc::new(CountingRemote::default());
                let layer = layer(&remote);

                for value in &values {
                    layer.put("field", value.clone());
                }

                prop_assert_eq!(remote.adds.load(Ordering::SeqCst), 1);
                prop_assert!(layer.dirty_contains("field"));
                prop_assert_eq!(layer.get("field"), values.last().cloned());
            }
        }
    }
}
