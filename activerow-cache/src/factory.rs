//! Per-entity cache layer construction.

use std::sync::Arc;
use std::time::Duration;

use activerow_core::{ActiveRowResult, CacheConfig, CacheMode, ConfigError, EntityType, Key};

use super::ram::RamCacheLayer;
use super::remote::RemoteCache;
use super::shadowed::ShadowedCacheLayer;
use super::traits::CacheLayer;

/// Builds one fresh cache layer for each live entity.
pub trait CacheLayerFactory: Send + Sync {
    fn layer_for(&self, entity_type: &EntityType, table: &str, key: &Key) -> Box<dyn CacheLayer>;
}

/// Process-local layers only.
#[derive(Debug, Clone, Copy, Default)]
pub struct RamCache;

impl CacheLayerFactory for RamCache {
    fn layer_for(&self, _entity_type: &EntityType, _table: &str, _key: &Key) -> Box<dyn CacheLayer> {
        Box::new(RamCacheLayer::new())
    }
}

/// Shadowed layers sharing one remote cache client.
#[derive(Clone)]
pub struct ShadowedCache {
    remote: Arc<dyn RemoteCache>,
    namespace: String,
    expiry: Duration,
}

impl ShadowedCache {
    pub fn new(remote: Arc<dyn RemoteCache>, namespace: impl Into<String>, expiry: Duration) -> Self {
        Self {
            remote,
            namespace: namespace.into(),
            expiry,
        }
    }

    pub fn from_config(remote: Arc<dyn RemoteCache>, config: &CacheConfig) -> Self {
        Self::new(remote, config.namespace.clone(), config.expiry)
    }

    /// Remote key prefix for one entity: `"{namespace}{table}.{key}."`.
    pub fn prefix_for(&self, table: &str, key: &Key) -> String {
        format!("{}{}.{}.", self.namespace, table, key)
    }
}

impl std::fmt::Debug for ShadowedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowedCache")
            .field("namespace", &self.namespace)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl CacheLayerFactory for ShadowedCache {
    fn layer_for(&self, _entity_type: &EntityType, table: &str, key: &Key) -> Box<dyn CacheLayer> {
        Box::new(ShadowedCacheLayer::new(
            self.remote.clone(),
            self.prefix_for(table, key),
            self.expiry,
        ))
    }
}

/// Pick the factory `config.mode` asks for. Shadowed mode needs a remote
/// client.
pub fn factory_from_config(
    config: &CacheConfig,
    remote: Option<Arc<dyn RemoteCache>>,
) -> ActiveRowResult<Arc<dyn CacheLayerFactory>> {
    match (config.mode, remote) {
        (CacheMode::Ram, _) => Ok(Arc::new(RamCache)),
        (CacheMode::Shadowed, Some(remote)) => Ok(Arc::new(ShadowedCache::from_config(remote, config))),
        (CacheMode::Shadowed, None) => Err(ConfigError::InvalidValue {
            field: "cache.mode".to_string(),
            value: "shadowed".to_string(),
            reason: "no remote cache client supplied".to_string(),
        }
        .into()),
    }
}
