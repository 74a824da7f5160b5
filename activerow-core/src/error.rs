//! Error types for ActiveRow operations

use crate::Key;
use thiserror::Error;

/// Storage layer errors.
///
/// Everything except `NotFound` originates in a `StorageProvider` and is
/// passed through to callers unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type} with key {key}")]
    NotFound { entity_type: String, key: Key },

    #[error("Insert into {table} failed: {reason}")]
    InsertFailed { table: String, reason: String },

    #[error("Insert into {table} returned no generated key")]
    NoGeneratedKey { table: String },

    #[error("Query failed ({sql}): {reason}")]
    QueryFailed { sql: String, reason: String },

    #[error("Column {column} missing from result row")]
    MissingColumn { column: String },

    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration and declaration errors. These are programming errors and
/// surface immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Method {method} on {entity_type} matches no accessor, mutator or relation")]
    Unconfigured { entity_type: String, method: String },

    #[error("Cannot derive a field name from method {method}")]
    InvalidMethodName { method: String },

    #[error("Unknown entity type: {name}")]
    UnknownEntityType { name: String },

    #[error("Method {method} expects {expected}, got {got}")]
    ArgumentMismatch {
        method: String,
        expected: String,
        got: String,
    },

    #[error("Primary key of {entity_type} {current} cannot be reassigned to {requested}")]
    PrimaryKeyReassignment {
        entity_type: String,
        current: Key,
        requested: String,
    },

    #[error("Invalid name pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },

    #[error("Entity manager has been shut down")]
    ManagerShutDown,
}

/// Remote cache errors. Cache layers absorb these and degrade to a miss.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Remote cache unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Cache value serialization failed for {key}: {reason}")]
    Serialization { key: String, reason: String },
}

/// Master error type for all ActiveRow errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActiveRowError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl ActiveRowError {
    /// True when a storage read found no row for the requested entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ActiveRowError::Storage(StorageError::NotFound { .. }))
    }

    /// True for declaration mistakes such as an unrecognised method.
    pub fn is_unconfigured(&self) -> bool {
        matches!(self, ActiveRowError::Config(ConfigError::Unconfigured { .. }))
    }
}

/// Result type alias for ActiveRow operations.
pub type ActiveRowResult<T> = Result<T, ActiveRowError>;

// =============================================================================
// TESTS
// =============================================================================
