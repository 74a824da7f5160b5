//! Entity behaviour over mock storage with RAM caches: lazy loading, the
//! create/read round trip, relations, saving and flushing.

use std::sync::{Arc, Mutex};

use activerow_storage::{Connection, Statement, StorageProvider};
use activerow_test_utils::assertions::{assert_config_error, assert_not_found, assert_scalar, assert_unconfigured};
use activerow_test_utils::{
    fixtures, ActiveRowError, ActiveRowResult, ConfigError, DbParam, EntityHandle, EntityManager,
    FieldValue, Key, MockStorage, Row, StorageError, Value,
};

type Hook = Box<dyn FnOnce() + Send>;

/// Mock storage that runs a callback just before the next `UPDATE` is
/// prepared, while the caller is still inside `save`.
struct InterleavingStorage {
    inner: MockStorage,
    on_update: Arc<Mutex<Option<Hook>>>,
}

impl InterleavingStorage {
    fn new(inner: MockStorage) -> Self {
        Self {
            inner,
            on_update: Arc::new(Mutex::new(None)),
        }
    }

    fn before_next_update(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_update.lock().unwrap() = Some(Box::new(hook));
    }
}

impl StorageProvider for InterleavingStorage {
    fn acquire(&self) -> ActiveRowResult<Box<dyn Connection>> {
        Ok(Box::new(InterleavingConnection {
            inner: self.inner.acquire()?,
            on_update: self.on_update.clone(),
        }))
    }

    fn release(&self, connection: Box<dyn Connection>) {
        self.inner.release(connection);
    }
}

struct InterleavingConnection {
    inner: Box<dyn Connection>,
    on_update: Arc<Mutex<Option<Hook>>>,
}

impl Connection for InterleavingConnection {
    fn prepare(&mut self, sql: &str) -> ActiveRowResult<Box<dyn Statement + '_>> {
        if sql.starts_with("UPDATE") {
            let hook = self.on_update.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        self.inner.prepare(sql)
    }
}

// ============================================================================
// LAZY LOADING
// ============================================================================

#[test]
fn test_first_accessor_fetches_row_once() {
    let (manager, storage, schema) = fixtures::ram_manager();
    let key = fixtures::seed_person(&storage, "Alice", 30);

    let alice = manager.get_one(&schema.person, key).unwrap();
    assert_eq!(storage.row_fetches(), 0);

    assert_scalar(alice.get("getName"), "Alice");
    assert_scalar(alice.get("getAge"), 30i64);
    assert_scalar(alice.get("isActive"), Value::Null);
    assert_eq!(storage.row_fetches(), 1);
    assert_eq!(manager.stats().row_fetches, 1);
}

#[test]
fn test_primary_key_accessor_never_fetches() {
    let (manager, storage, schema) = fixtures::ram_manager();

    let ghost = manager.get_one(&schema.person, 42i64).unwrap();
    assert_scalar(ghost.get("getID"), 42i64);
    ghost.set("setID", 42i64).unwrap();
    assert!(storage.executed().is_empty());
}

#[test]
fn test_primary_key_cannot_be_reassigned() {
    let (manager, _storage, schema) = fixtures::ram_manager();
    let person = manager.get_one(&schema.person, 1i64).unwrap();

    let err = person.set("setID", 2i64).unwrap_err();
    assert!(matches!(
        err,
        ActiveRowError::Config(ConfigError::PrimaryKeyReassignment { .. })
    ));
    assert_eq!(person.key(), &Key::Int(1));
}

#[test]
fn test_concurrent_misses_load_once() {
    let (manager, storage, schema) = fixtures::ram_manager();
    let key = fixtures::seed_person(&storage, "Alice", 30);
    let alice = manager.get_one(&schema.person, key).unwrap();

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| assert_scalar(alice.get("getName"), "Alice"));
        }
    });
    assert_eq!(storage.row_fetches(), 1);
}

#[test]
fn test_missing_row_is_not_found() {
    let (manager, storage, schema) = fixtures::ram_manager();

    let ghost = manager.get_one(&schema.person, 99i64).unwrap();
    assert_not_found(&ghost.get("getName"), "Person");

    let key = fixtures::seed_person(&storage, "Bob", 40);
    let bob = manager.get_one(&schema.person, key.clone()).unwrap();
    storage.delete_row("person", &key.to_value()).unwrap();
    assert_not_found(&bob.get("getName"), "Person");
}

#[test]
fn test_unknown_method_fails_fast() {
    let (manager, storage, schema) = fixtures::ram_manager();
    let person = manager.get_one(&schema.person, 1i64).unwrap();

    assert_unconfigured(&person.get("frobnicate"), "frobnicate");
    assert_config_error(&person.invoke("getName", vec![FieldValue::from(1i64)]));
    assert!(storage.executed().is_empty());
}

// ============================================================================
// ROUND TRIP AND WRITES
// ============================================================================

#[test]
fn test_person_company_scenario() {
    let (manager, storage, schema) = fixtures::ram_manager();

    let p = manager
        .create(&schema.person, vec![DbParam::new("name", "Alice")])
        .unwrap();
    assert_scalar(p.get("getName"), "Alice");
    let fetches = storage.row_fetches();
    assert_scalar(p.get("getName"), "Alice");
    assert_eq!(storage.row_fetches(), fetches);

    let id = p.get("getID").unwrap().into_scalar().unwrap();
    let key = schema.person.key_kind().key_from_value(&id).unwrap();
    let same = manager.get_one(&schema.person, key).unwrap();
    assert!(EntityHandle::ptr_eq(&p, &same));

    let acme = manager
        .create(&schema.company, vec![DbParam::new("name", "Acme")])
        .unwrap();
    p.set("setCompany", &acme).unwrap();
    assert_eq!(p.dirty_fields(), vec!["companyID".to_string()]);
    let company = p.get("getCompany").unwrap().into_entity().unwrap();
    assert!(EntityHandle::ptr_eq(&company, &acme));
}

#[test]
fn test_mutator_is_local_until_save() {
    let (manager, storage, schema) = fixtures::ram_manager();
    let key = fixtures::seed_person(&storage, "Alice", 30);
    let alice = manager.get_one(&schema.person, key.clone()).unwrap();

    alice.set("setName", "Alicia").unwrap();
    alice.set("setAge", 31i64).unwrap();
    assert_scalar(alice.get("getName"), "Alicia");
    assert_eq!(storage.row_fetches(), 0);

    let stored = storage.row("person", &key.to_value()).unwrap().unwrap();
    assert_eq!(stored.get("name"), Some(&Value::from("Alice")));

    alice.save().unwrap();
    let update = storage.last_executed().unwrap();
    assert_eq!(update.sql, "UPDATE person SET age = ?, name = ? WHERE id = ?");
    assert_eq!(update.params, vec![Value::Int(31), Value::from("Alicia"), key.to_value()]);
    assert!(alice.dirty_fields().is_empty());

    let stored = storage.row("person", &key.to_value()).unwrap().unwrap();
    assert_eq!(stored.get("name"), Some(&Value::from("Alicia")));
    assert_scalar(alice.get("getName"), "Alicia");
}

#[test]
fn test_write_during_save_stays_dirty() {
    let storage = MockStorage::new();
    let interleaving = Arc::new(InterleavingStorage::new(storage.clone()));
    let manager = EntityManager::new(interleaving.clone());
    let schema = fixtures::Schema::declare(&manager).unwrap();
    let key = fixtures::seed_person(&storage, "Alice", 30);
    let alice = manager.get_one(&schema.person, key.clone()).unwrap();

    alice.set("setName", "Alicia").unwrap();
    let writer = alice.clone();
    interleaving.before_next_update(move || writer.set("setName", "Newest").unwrap());
    alice.save().unwrap();

    // Storage has the snapshot; the later write is still pending.
    let stored = storage.row("person", &key.to_value()).unwrap().unwrap();
    assert_eq!(stored.get("name"), Some(&Value::from("Alicia")));
    assert_scalar(alice.get("getName"), "Newest");
    assert_eq!(alice.dirty_fields(), vec!["name".to_string()]);

    alice.save().unwrap();
    let stored = storage.row("person", &key.to_value()).unwrap().unwrap();
    assert_eq!(stored.get("name"), Some(&Value::from("Newest")));
    assert!(alice.dirty_fields().is_empty());
    assert_scalar(alice.get("getName"), "Newest");
    assert_eq!(storage.open_connections(), 0);
}

#[test]
fn test_save_without_changes_is_silent() {
    let (manager, storage, schema) = fixtures::ram_manager();
    let person = manager.get_one(&schema.person, 1i64).unwrap();

    person.save().unwrap();
    assert!(storage.executed().is_empty());
}

#[test]
fn test_flush_discards_unsaved_writes() {
    let (manager, storage, schema) = fixtures::ram_manager();
    let key = fixtures::seed_person(&storage, "Alice", 30);
    let alice = manager.get_one(&schema.person, key).unwrap();

    alice.set("setName", "Zed").unwrap();
    manager.flush(&alice).unwrap();
    assert!(alice.dirty_fields().is_empty());
    assert_scalar(alice.get("getName"), "Alice");
    assert_eq!(storage.row_fetches(), 1);

    manager.flush_all().unwrap();
    assert_scalar(alice.get("getName"), "Alice");
    assert_eq!(storage.row_fetches(), 2);
}

// ============================================================================
// QUERIES
// ============================================================================

#[test]
fn test_find_binds_entity_keys() {
    let (manager, storage, schema) = fixtures::ram_manager();
    let acme = manager
        .create(&schema.company, vec![DbParam::new("name", "Acme")])
        .unwrap();
    let globex = manager
        .create(&schema.company, vec![DbParam::new("name", "Globex")])
        .unwrap();
    let alice = manager
        .create(&schema.person, vec![DbParam::new("name", "Alice"), DbParam::new("companyID", &acme)])
        .unwrap();
    manager
        .create(&schema.person, vec![DbParam::new("name", "Bob"), DbParam::new("companyID", &globex)])
        .unwrap();

    let found = manager
        .find(&schema.person, "prime.companyID = ?", &[FieldValue::from(&acme)])
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(EntityHandle::ptr_eq(&found[0], &alice));

    let query = storage.last_executed().unwrap();
    assert_eq!(query.sql, "SELECT prime.id FROM person prime WHERE prime.companyID = ?");
    assert_eq!(query.params, vec![acme.key().to_value()]);
}

#[test]
fn test_find_with_join_and_raw_sql() {
    let (manager, storage, schema) = fixtures::ram_manager();

    let joined = "SELECT prime.id FROM person prime JOIN company c ON prime.companyID = c.id WHERE c.name = ?";
    storage.script(joined, vec![Row::new().with("id", 2i64)]).unwrap();
    let found = manager
        .find_with_join(
            &schema.person,
            "JOIN company c ON prime.companyID = c.id",
            Some("c.name = ?"),
            &["Acme".into()],
        )
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].key(), &Key::Int(2));

    let raw = "SELECT p.id AS pid, p.name FROM person p ORDER BY p.name";
    storage
        .script(raw, vec![Row::new().with("pid", 2i64).with("name", "A"), Row::new().with("pid", 5i64).with("name", "B")])
        .unwrap();
    let found = manager.find_with_sql(&schema.person, "pid", raw, &[]).unwrap();
    let keys: Vec<&Key> = found.iter().map(EntityHandle::key).collect();
    assert_eq!(keys, vec![&Key::Int(2), &Key::Int(5)]);

    let err = manager.find_with_sql(&schema.person, "missing", raw, &[]).unwrap_err();
    assert!(matches!(err, ActiveRowError::Storage(StorageError::MissingColumn { .. })));
}

#[test]
fn test_storage_failures_propagate_and_release_connections() {
    let (manager, storage, schema) = fixtures::ram_manager();

    storage.fail_next_statement(StorageError::ConnectionFailed {
        reason: "reset by peer".to_string(),
    });
    let err = manager
        .create(&schema.person, vec![DbParam::new("name", "Alice")])
        .unwrap_err();
    assert!(matches!(err, ActiveRowError::Storage(StorageError::ConnectionFailed { .. })));

    storage.fail_next_statement(StorageError::QueryFailed {
        sql: "SELECT".to_string(),
        reason: "syntax".to_string(),
    });
    assert!(manager.find_all(&schema.person).is_err());

    let person = manager.get_one(&schema.person, 1i64).unwrap();
    storage.fail_next_statement(StorageError::ConnectionFailed {
        reason: "timeout".to_string(),
    });
    assert!(person.get("getName").is_err());

    assert_eq!(storage.open_connections(), 0);
    assert_eq!(storage.connections_acquired(), 3);
}

// ============================================================================
// RELATIONS
// ============================================================================

#[test]
fn test_one_to_many_relations_are_requeried() {
    let (manager, storage, schema) = fixtures::ram_manager();
    let alice = manager
        .create(&schema.person, vec![DbParam::new("name", "Alice")])
        .unwrap();
    let rex = manager
        .create(&schema.pet, vec![DbParam::new("name", "Rex"), DbParam::new("ownerID", &alice)])
        .unwrap();

    let pets = alice.get("getPets").unwrap().into_entities().unwrap();
    assert_eq!(pets.len(), 1);
    assert!(EntityHandle::ptr_eq(&pets[0], &rex));
    assert_eq!(
        storage.last_executed().unwrap().sql,
        "SELECT prime.id FROM pet prime WHERE prime.ownerID = ?"
    );

    manager
        .create(&schema.pet, vec![DbParam::new("name", "Tom"), DbParam::new("ownerID", &alice)])
        .unwrap();
    let pets = alice.get("getPets").unwrap().into_entities().unwrap();
    assert_eq!(pets.len(), 2);

    let owner = rex.get("getOwner").unwrap().into_entity().unwrap();
    assert!(EntityHandle::ptr_eq(&owner, &alice));
}

#[test]
fn test_to_many_without_annotation() {
    let (manager, _storage, schema) = fixtures::ram_manager();
    let acme = manager
        .create(&schema.company, vec![DbParam::new("name", "Acme")])
        .unwrap();
    for name in ["Alice", "Bob"] {
        manager
            .create(&schema.person, vec![DbParam::new("name", name), DbParam::new("companyID", &acme)])
            .unwrap();
    }

    let employees = acme.get("getEmployees").unwrap().into_entities().unwrap();
    assert_eq!(employees.len(), 2);
}

#[test]
fn test_many_to_many_through_link_type() {
    let (manager, storage, schema) = fixtures::ram_manager();
    let alice = manager
        .create(&schema.person, vec![DbParam::new("name", "Alice")])
        .unwrap();
    let chess = manager
        .create(&schema.club, vec![DbParam::new("name", "Chess")])
        .unwrap();
    let rowing = manager
        .create(&schema.club, vec![DbParam::new("name", "Rowing")])
        .unwrap();
    for club in [&chess, &rowing] {
        manager
            .create(
                &schema.membership,
                vec![DbParam::new("personID", &alice), DbParam::new("clubID", club)],
            )
            .unwrap();
    }

    let clubs = alice.get("getClubs").unwrap().into_entities().unwrap();
    assert_eq!(clubs, vec![chess.clone(), rowing.clone()]);
    assert!(EntityHandle::ptr_eq(&clubs[0], &chess));
    assert_eq!(
        storage.last_executed().unwrap().sql,
        "SELECT prime.clubID FROM membership prime WHERE prime.personID = ?"
    );
}

#[test]
fn test_null_foreign_key_is_no_entity() {
    let (manager, storage, schema) = fixtures::ram_manager();
    let key = fixtures::seed_person(&storage, "Alice", 30);
    let alice = manager.get_one(&schema.person, key).unwrap();

    assert_eq!(alice.get("getCompany").unwrap(), FieldValue::Entity(None));
    alice.set("setCompany", None::<EntityHandle>).unwrap();
    assert!(alice.get("getCompany").unwrap().into_entity().is_none());
}
