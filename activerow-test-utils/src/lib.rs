//! ActiveRow Test Utilities
//!
//! Centralized test infrastructure for the ActiveRow workspace:
//! - Fixture entity types and ready-wired managers
//! - A remote cache that records calls and can be made to fail
//! - Proptest generators for keys and values
//! - Custom assertions for ActiveRow error variants

// Re-export mock storage from its source crate
pub use activerow_storage::{MockStorage, Row};

// Re-export core types for convenience
pub use activerow_core::{
    ActiveRowError, ActiveRowResult, Annotation, CacheError, ConfigError, DbParam, EntityType,
    EntityTypeBuilder, FieldType, Key, KeyKind, MethodSignature, StorageError, Value,
};
pub use activerow_cache::{InMemoryRemoteCache, RemoteCache, ShadowedCache};
pub use activerow_entity::{EntityHandle, EntityManager, FieldValue};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// RECORDING REMOTE CACHE
// ============================================================================

/// Remote cache wrapper that counts every call by operation and can be
/// switched into a failing mode.
#[derive(Debug, Default)]
pub struct RecordingRemoteCache {
    inner: InMemoryRemoteCache,
    calls: Mutex<HashMap<&'static str, usize>>,
    failing: AtomicBool,
}

impl RecordingRemoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`CacheError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Calls made to one operation: `add`, `get`, `delete` or `find_keys`.
    pub fn calls(&self, op: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().map(|calls| calls.values().sum()).unwrap_or(0)
    }

    /// The underlying store, for inspecting what was published.
    pub fn store(&self) -> &InMemoryRemoteCache {
        &self.inner
    }

    fn enter(&self, op: &'static str) -> Result<(), CacheError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(op).or_insert(0) += 1;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable {
                reason: format!("{} refused", op),
            });
        }
        Ok(())
    }
}

impl RemoteCache for RecordingRemoteCache {
    fn add(&self, key: &str, ttl: Duration, value: Vec<u8>) -> Result<bool, CacheError> {
        self.enter("add")?;
        self.inner.add(key, ttl, value)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.enter("get")?;
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.enter("delete")?;
        self.inner.delete(key)
    }

    fn find_keys(&self, pattern: &str) -> Result<HashSet<String>, CacheError> {
        self.enter("find_keys")?;
        self.inner.find_keys(pattern)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for ActiveRow values.

    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use uuid::Uuid;

    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    pub fn arb_key() -> impl Strategy<Value = Key> {
        prop_oneof![
            (1i64..1_000_000).prop_map(Key::Int),
            "[a-z]{1,12}".prop_map(Key::Text),
            arb_uuid().prop_map(Key::Uuid),
        ]
    }

    pub fn arb_int_key() -> impl Strategy<Value = Key> {
        (1i64..1_000_000).prop_map(Key::Int)
    }

    pub fn arb_timestamp() -> impl Strategy<Value = Value> {
        (0i64..4_102_444_800).prop_map(|secs| {
            Utc.timestamp_opt(secs, 0)
                .single()
                .map(Value::Timestamp)
                .unwrap_or(Value::Null)
        })
    }

    /// Any value that survives a trip through a remote cache.
    pub fn arb_scalar_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            // Quarters parse back exactly from their shortest decimal form.
            (-4_000_000i64..4_000_000).prop_map(|q| Value::Float(q as f64 / 4.0)),
            prop_oneof![Just(f64::NAN), Just(f64::INFINITY), Just(f64::NEG_INFINITY)].prop_map(Value::Float),
            ".{0,24}".prop_map(Value::Text),
            arb_uuid().prop_map(Value::Uuid),
            arb_timestamp(),
            prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        ]
    }

    /// camelCase field names as the naming conventions derive them.
    pub fn arb_field_name() -> impl Strategy<Value = String> {
        "[a-z][a-zA-Z0-9]{0,15}"
    }

    pub fn arb_person_name() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{1,10}"
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Entity types and managers shared by the integration tests.
    //!
    //! ```text
    //! Person  --companyID-->  Company
    //! Pet     --ownerID---->  Person        (Person.getPets, one-to-many)
    //! Membership --personID/clubID--> Person, Club (Person.getClubs, many-to-many)
    //! ```

    use super::*;

    pub fn person() -> EntityTypeBuilder {
        EntityType::builder("Person")
            .method(MethodSignature::accessor("getID", FieldType::Int))
            .method(MethodSignature::mutator("setID", FieldType::Int))
            .method(MethodSignature::accessor("getName", FieldType::Text))
            .method(MethodSignature::mutator("setName", FieldType::Text))
            .method(MethodSignature::accessor("getAge", FieldType::Int))
            .method(MethodSignature::mutator("setAge", FieldType::Int))
            .method(MethodSignature::accessor("isActive", FieldType::Bool))
            .method(MethodSignature::mutator("setActive", FieldType::Bool))
            .method(MethodSignature::accessor("getCompany", FieldType::Entity("Company".into())))
            .method(MethodSignature::mutator("setCompany", FieldType::Entity("Company".into())))
            .method(
                MethodSignature::accessor("getPets", FieldType::Entities("Pet".into()))
                    .annotated(Annotation::OneToMany),
            )
            .method(
                MethodSignature::accessor("getClubs", FieldType::Entities("Club".into()))
                    .annotated(Annotation::ManyToMany {
                        through: "Membership".into(),
                    }),
            )
    }

    pub fn company() -> EntityTypeBuilder {
        EntityType::builder("Company")
            .method(MethodSignature::accessor("getID", FieldType::Int))
            .method(MethodSignature::accessor("getName", FieldType::Text))
            .method(MethodSignature::mutator("setName", FieldType::Text))
            .method(MethodSignature::accessor("getEmployees", FieldType::Entities("Person".into())))
    }

    pub fn pet() -> EntityTypeBuilder {
        EntityType::builder("Pet")
            .method(MethodSignature::accessor("getID", FieldType::Int))
            .method(MethodSignature::accessor("getName", FieldType::Text))
            .method(MethodSignature::mutator("setName", FieldType::Text))
            .method(MethodSignature::accessor("getOwner", FieldType::Entity("Person".into())))
            .method(MethodSignature::mutator("setOwner", FieldType::Entity("Person".into())))
    }

    pub fn club() -> EntityTypeBuilder {
        EntityType::builder("Club")
            .method(MethodSignature::accessor("getID", FieldType::Int))
            .method(MethodSignature::accessor("getName", FieldType::Text))
    }

    pub fn membership() -> EntityTypeBuilder {
        EntityType::builder("Membership")
            .method(MethodSignature::accessor("getID", FieldType::Int))
            .method(MethodSignature::accessor("getPerson", FieldType::Entity("Person".into())))
            .method(MethodSignature::accessor("getClub", FieldType::Entity("Club".into())))
    }

    /// The fixture types as registered with one manager.
    #[derive(Debug, Clone)]
    pub struct Schema {
        pub person: Arc<EntityType>,
        pub company: Arc<EntityType>,
        pub pet: Arc<EntityType>,
        pub club: Arc<EntityType>,
        pub membership: Arc<EntityType>,
    }

    impl Schema {
        pub fn declare(manager: &EntityManager) -> ActiveRowResult<Self> {
            Ok(Self {
                person: manager.declare(person())?,
                company: manager.declare(company())?,
                pet: manager.declare(pet())?,
                club: manager.declare(club())?,
                membership: manager.declare(membership())?,
            })
        }
    }

    /// A manager over fresh mock storage with RAM caches.
    pub fn ram_manager() -> (EntityManager, MockStorage, Schema) {
        let storage = MockStorage::new();
        let manager = EntityManager::new(Arc::new(storage.clone()));
        let schema = Schema::declare(&manager).expect("fixture types are valid");
        (manager, storage, schema)
    }

    /// A manager whose entities shadow `remote` with namespace `test.`.
    pub fn shadowed_manager(remote: Arc<dyn RemoteCache>) -> (EntityManager, MockStorage, Schema) {
        let storage = MockStorage::new();
        let manager = EntityManager::builder(Arc::new(storage.clone()))
            .cache_factory(Arc::new(ShadowedCache::new(
                remote,
                "test.",
                Duration::from_secs(3600),
            )))
            .build();
        let schema = Schema::declare(&manager).expect("fixture types are valid");
        (manager, storage, schema)
    }

    /// Seed one person row and return its key.
    pub fn seed_person(storage: &MockStorage, name: &str, age: i64) -> Key {
        let key = storage
            .insert_row("person", Row::new().with("name", name).with("age", age))
            .expect("mock insert");
        Key::Int(key.as_i64().expect("generated int key"))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for ActiveRow error variants.

    use super::*;

    /// Assert that a result is a NotFound storage error for `entity_type`.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &ActiveRowResult<T>, entity_type: &str) {
        match result {
            Err(ActiveRowError::Storage(StorageError::NotFound { entity_type: et, .. })) => {
                assert_eq!(et, entity_type, "Wrong entity type in NotFound error");
            }
            other => panic!("Expected NotFound error for {}, got: {:?}", entity_type, other),
        }
    }

    /// Assert that a result is an Unconfigured error for `method`.
    #[track_caller]
    pub fn assert_unconfigured<T: std::fmt::Debug>(result: &ActiveRowResult<T>, method: &str) {
        match result {
            Err(ActiveRowError::Config(ConfigError::Unconfigured { method: m, .. })) => {
                assert_eq!(m, method, "Wrong method in Unconfigured error");
            }
            other => panic!("Expected Unconfigured error for {}, got: {:?}", method, other),
        }
    }

    /// Assert that a result is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &ActiveRowResult<T>) {
        match result {
            Err(ActiveRowError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a field accessor returned the given scalar.
    #[track_caller]
    pub fn assert_scalar(actual: ActiveRowResult<FieldValue>, expected: impl Into<Value>) {
        match actual {
            Ok(FieldValue::Scalar(value)) => assert_eq!(value, expected.into()),
            other => panic!("Expected scalar, got: {:?}", other),
        }
    }
}
