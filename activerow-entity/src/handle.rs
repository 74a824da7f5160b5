//! Entity handles and the values passed through them.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError};

use activerow_core::{
    ActiveRowResult, CacheKey, ConfigError, EntityType, Key, Timestamp, Value,
};
use activerow_cache::CacheStats;

use crate::proxy::EntityProxy;

// ============================================================================
// FIELD VALUES
// ============================================================================

/// Argument or result of a dispatched entity method.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Result of a mutator.
    Unit,
    Scalar(Value),
    /// A to-one relation; `None` when the foreign key is null.
    Entity(Option<EntityHandle>),
    Entities(Vec<EntityHandle>),
}

impl FieldValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            FieldValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_scalar(self) -> Option<Value> {
        match self {
            FieldValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// The related entity of a to-one accessor. A null relation and a
    /// non-entity value both give `None`.
    pub fn into_entity(self) -> Option<EntityHandle> {
        match self {
            FieldValue::Entity(handle) => handle,
            _ => None,
        }
    }

    pub fn into_entities(self) -> Option<Vec<EntityHandle>> {
        match self {
            FieldValue::Entities(handles) => Some(handles),
            _ => None,
        }
    }

    /// The value bound to a storage parameter or cached for a field. Entity
    /// handles are replaced by their primary keys.
    pub fn to_param(&self, context: &str) -> ActiveRowResult<Value> {
        match self {
            FieldValue::Scalar(value) => Ok(value.clone()),
            FieldValue::Entity(Some(handle)) => Ok(handle.key().to_value()),
            FieldValue::Entity(None) => Ok(Value::Null),
            FieldValue::Unit => Err(mismatch(context, "unit")),
            FieldValue::Entities(_) => Err(mismatch(context, "an entity collection")),
        }
    }
}

fn mismatch(context: &str, got: &str) -> activerow_core::ActiveRowError {
    ConfigError::ArgumentMismatch {
        method: context.to_string(),
        expected: "a scalar value or entity".to_string(),
        got: got.to_string(),
    }
    .into()
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Scalar(value)
    }
}

impl From<Key> for FieldValue {
    fn from(key: Key) -> Self {
        FieldValue::Scalar(key.to_value())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Scalar(Value::from(value))
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Scalar(Value::from(value))
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Scalar(Value::Int(value))
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Scalar(Value::from(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Scalar(Value::Bool(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Scalar(Value::Float(value))
    }
}

impl From<Timestamp> for FieldValue {
    fn from(value: Timestamp) -> Self {
        FieldValue::Scalar(Value::Timestamp(value))
    }
}

impl From<EntityHandle> for FieldValue {
    fn from(handle: EntityHandle) -> Self {
        FieldValue::Entity(Some(handle))
    }
}

impl From<&EntityHandle> for FieldValue {
    fn from(handle: &EntityHandle) -> Self {
        FieldValue::Entity(Some(handle.clone()))
    }
}

impl From<Option<EntityHandle>> for FieldValue {
    fn from(handle: Option<EntityHandle>) -> Self {
        FieldValue::Entity(handle)
    }
}

impl From<Vec<EntityHandle>> for FieldValue {
    fn from(handles: Vec<EntityHandle>) -> Self {
        FieldValue::Entities(handles)
    }
}

/// Binding a handle as a column value binds its primary key.
impl From<&EntityHandle> for Value {
    fn from(handle: &EntityHandle) -> Self {
        handle.key().to_value()
    }
}

// ============================================================================
// HANDLES
// ============================================================================

/// Shared state behind every clone of one handle. Dropping the last clone
/// unregisters the entity from its manager.
pub(crate) struct EntityCell {
    pub(crate) id: u64,
    pub(crate) proxy: Arc<EntityProxy>,
}

impl Drop for EntityCell {
    fn drop(&mut self) {
        let manager = self.proxy.manager();
        let cache_key = CacheKey::new(self.proxy.key().clone(), self.proxy.entity_type().name());

        let mut identity = manager.identity.lock().unwrap_or_else(PoisonError::into_inner);
        // A fresh cell may already have replaced this one under the same key.
        if identity
            .get(&cache_key)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            identity.remove(&cache_key);
        }
        let mut proxies = manager.proxies.lock().unwrap_or_else(PoisonError::into_inner);
        proxies.remove(&self.id);
    }
}

/// A live entity: the canonical object for one `(type, primary key)` pair.
///
/// Cloning is cheap and every clone is the same entity. Equality, hashing and
/// display use the type name and key, though two handles for the same pair
/// from the same manager are also [`EntityHandle::ptr_eq`].
#[derive(Clone)]
pub struct EntityHandle {
    pub(crate) cell: Arc<EntityCell>,
}

impl EntityHandle {
    pub(crate) fn new(cell: Arc<EntityCell>) -> Self {
        Self { cell }
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        self.cell.proxy.entity_type()
    }

    pub fn type_name(&self) -> &str {
        self.entity_type().name()
    }

    pub fn key(&self) -> &Key {
        self.cell.proxy.key()
    }

    /// Table backing this entity.
    pub fn table(&self) -> &str {
        self.cell.proxy.table()
    }

    /// Whether both handles share one underlying entity object.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.cell, &b.cell)
    }

    /// Dispatch a declared method by name.
    pub fn invoke(&self, method: &str, args: Vec<FieldValue>) -> ActiveRowResult<FieldValue> {
        self.cell.proxy.invoke(method, args)
    }

    /// Call a zero-argument method (accessor or relation).
    pub fn get(&self, method: &str) -> ActiveRowResult<FieldValue> {
        self.invoke(method, Vec::new())
    }

    /// Call a one-argument mutator.
    pub fn set(&self, method: &str, value: impl Into<FieldValue>) -> ActiveRowResult<()> {
        self.invoke(method, vec![value.into()]).map(|_| ())
    }

    /// Write every dirty field to storage in one statement.
    pub fn save(&self) -> ActiveRowResult<()> {
        self.cell.proxy.save()
    }

    /// Fields written locally since the last save or flush, sorted.
    pub fn dirty_fields(&self) -> Vec<String> {
        self.cell.proxy.dirty_fields()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cell.proxy.cache_stats()
    }
}

impl PartialEq for EntityHandle {
    fn eq(&self, other: &Self) -> bool {
        self.type_name() == other.type_name() && self.key() == other.key()
    }
}

impl Eq for EntityHandle {}

impl Hash for EntityHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_name().hash(state);
        self.key().hash(state);
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{ {} = {} }}", self.type_name(), self.entity_type().primary_key_field(), self.key())
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandle")
            .field("type", &self.type_name())
            .field("key", self.key())
            .finish()
    }
}
