//! Field values, primary keys and the small value objects built from them.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

// ============================================================================
// VALUE
// ============================================================================

/// A single column value as it travels between storage, cache layers and
/// entity handles.
///
/// `Opaque` carries an in-process value that has no storage or wire
/// representation. It serializes to an error, which is what makes a value
/// "not serializable" for remote caches.
#[derive(Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    Text(String),
    Uuid(Uuid),
    Timestamp(Timestamp),
    Bytes(Vec<u8>),
    #[serde(skip_deserializing, serialize_with = "reject_opaque")]
    Opaque(Arc<dyn Any + Send + Sync>),
}

/// Floats as JSON numbers, with NaN and the infinities spelled out as
/// strings so they survive a remote cache round trip.
mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Named(String),
    }

    pub(super) fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(f) => Ok(f),
            Repr::Named(name) => match name.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!("not a float: {}", other))),
            },
        }
    }
}

fn reject_opaque<S>(_value: &Arc<dyn Any + Send + Sync>, _serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    Err(serde::ser::Error::custom("opaque values cannot be serialized"))
}

impl Value {
    /// Wrap an arbitrary in-process value.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Value::Opaque(Arc::new(value))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    /// Equality that also matches a float against its own bit pattern, so a
    /// NaN compares equal to the NaN it was copied from.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits() || a == b,
            _ => self == other,
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Uuid(_) => "uuid",
            Value::Timestamp(_) => "timestamp",
            Value::Bytes(_) => "bytes",
            Value::Opaque(_) => "opaque",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Text(s) => write!(f, "Text({:?})", s),
            Value::Uuid(u) => write!(f, "Uuid({})", u),
            Value::Timestamp(t) => write!(f, "Timestamp({})", t),
            Value::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Value::Opaque(_) => write!(f, "Opaque(..)"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Opaque(_) => write!(f, "<opaque>"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Uuid> for Value {
    fn from(u: Uuid) -> Self {
        Value::Uuid(u)
    }
}

impl From<Timestamp> for Value {
    fn from(t: Timestamp) -> Self {
        Value::Timestamp(t)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// ============================================================================
// PRIMARY KEYS
// ============================================================================

/// A primary key value. Keys are hashable and ordered so they can index the
/// identity map; floating point and opaque values can never be keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    Int(i64),
    Text(String),
    Uuid(Uuid),
}

impl Key {
    pub fn kind(&self) -> KeyKind {
        match self {
            Key::Int(_) => KeyKind::Int,
            Key::Text(_) => KeyKind::Text,
            Key::Uuid(_) => KeyKind::Uuid,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::from(self.clone())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Text(s) => write!(f, "{}", s),
            Key::Uuid(u) => write!(f, "{}", u),
        }
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Int(i) => Value::Int(i),
            Key::Text(s) => Value::Text(s),
            Key::Uuid(u) => Value::Uuid(u),
        }
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Int(i64::from(i))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

impl From<Uuid> for Key {
    fn from(u: Uuid) -> Self {
        Key::Uuid(u)
    }
}

/// Declared primary key type of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KeyKind {
    #[default]
    Int,
    Text,
    Uuid,
}

impl KeyKind {
    /// Interpret a value returned by storage (a generated key or a selected
    /// id column) as a key of this kind.
    pub fn key_from_value(&self, value: &Value) -> Option<Key> {
        match (self, value) {
            (KeyKind::Int, Value::Int(i)) => Some(Key::Int(*i)),
            (KeyKind::Int, Value::Text(s)) => s.trim().parse().ok().map(Key::Int),
            (KeyKind::Text, Value::Text(s)) => Some(Key::Text(s.clone())),
            (KeyKind::Text, Value::Int(i)) => Some(Key::Text(i.to_string())),
            (KeyKind::Uuid, Value::Uuid(u)) => Some(Key::Uuid(*u)),
            (KeyKind::Uuid, Value::Text(s)) => Uuid::parse_str(s).ok().map(Key::Uuid),
            _ => None,
        }
    }

    /// The key of this kind that `key` denotes, or `None` if it cannot be
    /// converted.
    pub fn coerce(&self, key: &Key) -> Option<Key> {
        if key.kind() == *self {
            return Some(key.clone());
        }
        self.key_from_value(&key.to_value())
    }
}

// ============================================================================
// VALUE OBJECTS
// ============================================================================

/// Identity map key: structural pair of primary key and entity type name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key: Key,
    entity_type: String,
}

impl CacheKey {
    pub fn new(key: Key, entity_type: impl Into<String>) -> Self {
        Self {
            key,
            entity_type: entity_type.into(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }
}

/// A (field, value) pair describing one column of a pending insert.
#[derive(Debug, Clone, PartialEq)]
pub struct DbParam {
    field: String,
    value: Value,
}

impl DbParam {
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_parts(self) -> (String, Value) {
        (self.field, self.value)
    }
}
