//! ActiveRow Cache - Per-Entity Field Caches
//!
//! Every live entity owns one [`CacheLayer`]. The layer decides whether a
//! field read can be answered without storage and remembers which fields were
//! written locally and not yet saved.
//!
//! Two layers ship here:
//!
//! - [`RamCacheLayer`]: values kept in process memory.
//! - [`ShadowedCacheLayer`]: a local dirty overlay in front of a shared
//!   [`RemoteCache`], so entities loaded by several processes can share
//!   clean field values.
//!
//! Layers never fail. Remote errors are logged and counted in
//! [`CacheStats`] and otherwise behave like misses.

pub mod factory;
pub mod ram;
pub mod remote;
pub mod shadowed;
pub mod traits;

pub use factory::{factory_from_config, CacheLayerFactory, RamCache, ShadowedCache};
pub use ram::RamCacheLayer;
pub use remote::{InMemoryRemoteCache, RemoteCache};
pub use shadowed::ShadowedCacheLayer;
pub use traits::{CacheLayer, CacheStats};
