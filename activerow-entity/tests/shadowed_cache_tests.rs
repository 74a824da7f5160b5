//! Entities whose caches shadow a shared remote cache.

use std::sync::Arc;
use std::time::Duration;

use activerow_test_utils::assertions::assert_scalar;
use activerow_test_utils::{
    fixtures, ActiveRowError, ConfigError, EntityManager, MockStorage, RecordingRemoteCache,
    RemoteCache, ShadowedCache,
};
use activerow_core::{ActiveRowConfig, CacheMode};

/// A second manager over the same storage and remote cache, standing in for
/// another process.
fn peer(storage: &MockStorage, remote: Arc<dyn RemoteCache>) -> (EntityManager, fixtures::Schema) {
    let manager = EntityManager::builder(Arc::new(storage.clone()))
        .cache_factory(Arc::new(ShadowedCache::new(remote, "test.", Duration::from_secs(3600))))
        .build();
    let schema = fixtures::Schema::declare(&manager).unwrap();
    (manager, schema)
}

#[test]
fn test_loaded_fields_are_published_and_shared() {
    let remote = Arc::new(RecordingRemoteCache::new());
    let (manager, storage, schema) = fixtures::shadowed_manager(remote.clone());
    let key = fixtures::seed_person(&storage, "Alice", 30);

    let alice = manager.get_one(&schema.person, key.clone()).unwrap();
    assert_scalar(alice.get("getName"), "Alice");
    assert_scalar(alice.get("getAge"), 30i64);
    assert_eq!(manager.stats().row_fetches, 1);
    assert!(remote.store().get("test.person.1.name").unwrap().is_some());

    let (other, other_schema) = peer(&storage, remote.clone());
    let same = other.get_one(&other_schema.person, key).unwrap();
    assert_scalar(same.get("getName"), "Alice");
    assert_eq!(other.stats().row_fetches, 0);
    assert_eq!(storage.row_fetches(), 1);
}

#[test]
fn test_rewrites_of_a_dirty_field_stay_local() {
    let remote = Arc::new(RecordingRemoteCache::new());
    let (manager, storage, schema) = fixtures::shadowed_manager(remote.clone());
    let key = fixtures::seed_person(&storage, "Alice", 30);
    let alice = manager.get_one(&schema.person, key).unwrap();

    alice.set("setName", "Alicia").unwrap();
    assert_eq!(remote.calls("add"), 1);

    let before = remote.total_calls();
    alice.set("setName", "Ali").unwrap();
    assert_scalar(alice.get("getName"), "Ali");
    assert_eq!(remote.total_calls(), before);
    assert_eq!(storage.row_fetches(), 0);
}

#[test]
fn test_save_republishes_saved_values() {
    let remote = Arc::new(RecordingRemoteCache::new());
    let (manager, storage, schema) = fixtures::shadowed_manager(remote.clone());
    let key = fixtures::seed_person(&storage, "Alice", 30);

    let alice = manager.get_one(&schema.person, key.clone()).unwrap();
    assert_scalar(alice.get("getName"), "Alice");
    alice.set("setName", "Alicia").unwrap();
    alice.save().unwrap();
    assert!(alice.dirty_fields().is_empty());

    let (other, other_schema) = peer(&storage, remote.clone());
    let same = other.get_one(&other_schema.person, key).unwrap();
    assert_scalar(same.get("getName"), "Alicia");
    assert_scalar(alice.get("getName"), "Alicia");
}

#[test]
fn test_unavailable_remote_degrades_to_storage() {
    let remote = Arc::new(RecordingRemoteCache::new());
    remote.set_failing(true);
    let (manager, storage, schema) = fixtures::shadowed_manager(remote.clone());
    let key = fixtures::seed_person(&storage, "Alice", 30);
    let alice = manager.get_one(&schema.person, key).unwrap();

    assert_scalar(alice.get("getName"), "Alice");
    assert_scalar(alice.get("getName"), "Alice");
    assert_eq!(storage.row_fetches(), 2);
    assert!(alice.cache_stats().remote_errors > 0);

    // Local writes still read back.
    alice.set("setAge", 31i64).unwrap();
    assert_scalar(alice.get("getAge"), 31i64);
}

#[test]
fn test_manager_from_config() {
    let storage = MockStorage::new();
    let config = ActiveRowConfig::from_toml_str(
        r#"
        [cache]
        mode = "shadowed"
        namespace = "app."
        expiry = 60
        "#,
    )
    .unwrap();
    assert_eq!(config.cache.mode, CacheMode::Shadowed);

    let err = EntityManager::from_config(Arc::new(storage.clone()), &config, None).unwrap_err();
    assert!(matches!(err, ActiveRowError::Config(ConfigError::InvalidValue { .. })));

    let remote = Arc::new(RecordingRemoteCache::new());
    let manager = EntityManager::from_config(Arc::new(storage.clone()), &config, Some(remote.clone())).unwrap();
    let schema = fixtures::Schema::declare(&manager).unwrap();
    let key = fixtures::seed_person(&storage, "Alice", 30);

    let alice = manager.get_one(&schema.person, key).unwrap();
    assert_scalar(alice.get("getName"), "Alice");
    assert!(remote.store().get("app.person.1.name").unwrap().is_some());
}
