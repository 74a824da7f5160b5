//! Remote (shared, out-of-process) cache client abstraction.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

use activerow_core::CacheError;
use chrono::{DateTime, Utc};

/// Client for a distributed key/value cache such as memcached.
///
/// Values are opaque bytes; the caller chooses the encoding.
pub trait RemoteCache: Send + Sync {
    /// Store `value` under `key` unless the key already exists. Returns
    /// whether the value was stored.
    fn add(&self, key: &str, ttl: Duration, value: Vec<u8>) -> Result<bool, CacheError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Keys matching `pattern`: either an exact key or a prefix ending in `*`.
    fn find_keys(&self, pattern: &str) -> Result<HashSet<String>, CacheError>;
}

fn poisoned() -> CacheError {
    CacheError::Unavailable {
        reason: "cache lock poisoned".to_string(),
    }
}

/// In-process stand-in for a shared cache, with add-once semantics and
/// per-entry expiry.
#[derive(Debug, Default)]
pub struct InMemoryRemoteCache {
    entries: RwLock<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
}

impl InMemoryRemoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .read()
            .map(|entries| entries.values().filter(|(_, expires)| *expires > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RemoteCache for InMemoryRemoteCache {
    fn add(&self, key: &str, ttl: Duration, value: Vec<u8>) -> Result<bool, CacheError> {
        let now = Utc::now();
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        if let Some((_, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        entries.insert(key.to_string(), (value, expires));
        Ok(true)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Utc::now();
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        match entries.get(key) {
            Some((value, expires)) if *expires > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }

    fn find_keys(&self, pattern: &str) -> Result<HashSet<String>, CacheError> {
        let now = Utc::now();
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let live = entries
            .iter()
            .filter(|(_, (_, expires))| *expires > now)
            .map(|(key, _)| key);
        Ok(match pattern.strip_suffix('*') {
            Some(prefix) => live.filter(|key| key.starts_with(prefix)).cloned().collect(),
            None => live.filter(|key| key.as_str() == pattern).cloned().collect(),
        })
    }
}
