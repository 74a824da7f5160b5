//! ActiveRow Storage - Provider Traits and Mock Implementation
//!
//! Defines the storage abstraction the entity manager talks to. SQL
//! dialects, pooling and retries belong to implementations of
//! [`StorageProvider`]; this crate only fixes the call shape and guarantees
//! that every acquired connection is handed back.

pub mod mock;

pub use mock::{ExecutedStatement, MockStorage};

use std::ops::{Deref, DerefMut};

use activerow_core::{ActiveRowResult, Value};

// ============================================================================
// ROWS
// ============================================================================

/// One result row with named, ordered columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column append.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(column, value);
        self
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.columns.push((column.into(), value.into()));
    }

    /// Look a column up by name. A table alias on either side is ignored, and
    /// the comparison is case-insensitive, so `prime.id` finds `ID`.
    pub fn get(&self, column: &str) -> Option<&Value> {
        if let Some((_, value)) = self.columns.iter().find(|(name, _)| name == column) {
            return Some(value);
        }
        let wanted = unqualified(column);
        self.columns
            .iter()
            .find(|(name, _)| unqualified(name).eq_ignore_ascii_case(wanted))
            .map(|(_, value)| value)
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.columns.get(index).map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

fn unqualified(column: &str) -> &str {
    column.rsplit('.').next().unwrap_or(column)
}

/// Result of an insert/update/delete statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub rows_affected: u64,
    /// Keys assigned by storage, in insertion order.
    pub generated_keys: Vec<Value>,
}

// ============================================================================
// PROVIDER TRAITS
// ============================================================================

/// A prepared statement bound to one connection.
pub trait Statement {
    fn execute_update(&mut self, params: &[Value]) -> ActiveRowResult<UpdateOutcome>;

    fn execute_query(&mut self, params: &[Value]) -> ActiveRowResult<Vec<Row>>;
}

/// A live storage connection.
pub trait Connection: Send {
    fn prepare(&mut self, sql: &str) -> ActiveRowResult<Box<dyn Statement + '_>>;
}

/// Source of connections. Implementations own pooling, retries and
/// timeouts; callers acquire one connection per operation and always
/// release it.
pub trait StorageProvider: Send + Sync {
    fn acquire(&self) -> ActiveRowResult<Box<dyn Connection>>;

    fn release(&self, connection: Box<dyn Connection>);
}

// ============================================================================
// SCOPED ACQUISITION
// ============================================================================

/// A connection that returns itself to its provider when dropped, on every
/// exit path including early `?` returns and panics.
pub struct ConnectionGuard<'a> {
    provider: &'a dyn StorageProvider,
    connection: Option<Box<dyn Connection>>,
}

impl<'a> ConnectionGuard<'a> {
    pub fn acquire(provider: &'a dyn StorageProvider) -> ActiveRowResult<Self> {
        let connection = provider.acquire()?;
        Ok(Self {
            provider,
            connection: Some(connection),
        })
    }

    /// Prepare and run a statement that modifies rows.
    pub fn execute_update(&mut self, sql: &str, params: &[Value]) -> ActiveRowResult<UpdateOutcome> {
        let mut statement = self.prepare(sql)?;
        statement.execute_update(params)
    }

    /// Prepare and run a statement that returns rows.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> ActiveRowResult<Vec<Row>> {
        let mut statement = self.prepare(sql)?;
        statement.execute_query(params)
    }
}

impl Deref for ConnectionGuard<'_> {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        // Only `Drop` takes the connection out.
        match self.connection.as_deref() {
            Some(connection) => connection,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl DerefMut for ConnectionGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.connection.as_deref_mut() {
            Some(connection) => connection,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.provider.release(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use activerow_core::{ActiveRowError, StorageError};

    #[test]
    fn test_row_lookup_ignores_alias_and_case() {
        let row = Row::new().with("ID", 3i64).with("name", "Alice");
        assert_eq!(row.get("prime.id"), Some(&Value::Int(3)));
        assert_eq!(row.get("name"), Some(&Value::Text("Alice".into())));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.get_index(1), Some(&Value::Text("Alice".into())));
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn test_guard_releases_on_error_path() {
        let storage = MockStorage::new();
        storage.fail_next_statement(StorageError::ConnectionFailed {
            reason: "reset by peer".to_string(),
        });

        let result = (|| -> ActiveRowResult<Vec<Row>> {
            let mut guard = ConnectionGuard::acquire(&storage)?;
            guard.query("SELECT * FROM person WHERE id = ?", &[Value::Int(1)])
        })();

        assert!(matches!(
            result,
            Err(ActiveRowError::Storage(StorageError::ConnectionFailed { .. }))
        ));
        assert_eq!(storage.open_connections(), 0);
        assert_eq!(storage.connections_acquired(), 1);
    }
}
