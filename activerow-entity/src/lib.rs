//! ActiveRow Entity - Identity-Mapped Live Entities
//!
//! An [`EntityManager`] hands out [`EntityHandle`]s: one per
//! `(entity type, primary key)` for as long as any handle is alive. Calls on
//! a handle are dispatched by method name through its [`EntityProxy`], which
//! serves fields from a per-entity cache layer and reads the entity's row
//! only on a miss.
//!
//! ```no_run
//! use std::sync::Arc;
//! use activerow_core::{DbParam, EntityType, FieldType, MethodSignature};
//! use activerow_entity::EntityManager;
//! use activerow_storage::MockStorage;
//!
//! # fn main() -> activerow_core::ActiveRowResult<()> {
//! let manager = EntityManager::new(Arc::new(MockStorage::new()));
//! let person = manager.declare(
//!     EntityType::builder("Person")
//!         .method(MethodSignature::accessor("getID", FieldType::Int))
//!         .method(MethodSignature::accessor("getName", FieldType::Text)),
//! )?;
//!
//! let alice = manager.create(&person, vec![DbParam::new("name", "Alice")])?;
//! assert_eq!(alice.get("getName")?.into_scalar(), Some("Alice".into()));
//! # Ok(())
//! # }
//! ```

pub mod handle;
pub mod manager;
pub mod proxy;
pub mod telemetry;

pub use handle::{EntityHandle, FieldValue};
pub use manager::{EntityManager, EntityManagerBuilder, ManagerStats, PRIME_ALIAS};
pub use proxy::EntityProxy;
pub use telemetry::{init_tracing, TelemetryConfig};
