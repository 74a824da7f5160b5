//! In-memory storage for tests.
//!
//! Understands exactly the statement shapes the entity manager emits:
//!
//! - `INSERT INTO t (a,b) VALUES (?,?)` with a generated integer key
//! - `SELECT * FROM t WHERE pk = ?`
//! - `SELECT alias.col FROM t alias [WHERE [alias.]a = ? AND|OR ...]`
//! - `UPDATE t SET a = ?, b = ? WHERE pk = ?`
//!
//! Anything else (joins, hand-written SQL) must be scripted with
//! [`MockStorage::script`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use activerow_core::{ActiveRowResult, StorageError, Value};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{Connection, Row, Statement, StorageProvider, UpdateOutcome};

static INSERT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^INSERT INTO (\w+) \(([^)]*)\) VALUES \(([^)]*)\)$").expect("static regex")
});
static SELECT_ROW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^SELECT \* FROM (\w+) WHERE (\w+) = \?$").expect("static regex"));
static SELECT_COLUMN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^SELECT (\w+)\.(\w+) FROM (\w+) (\w+)(?: WHERE (.+))?$").expect("static regex")
});
static UPDATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^UPDATE (\w+) SET (.+) WHERE (\w+) = \?$").expect("static regex")
});
static CLAUSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:(\w+)\.)?(\w+) = \?$").expect("static regex"));

type StoredRow = BTreeMap<String, Value>;

/// A statement the mock executed, with its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Default)]
struct MockTable {
    next_id: i64,
    rows: Vec<StoredRow>,
}

#[derive(Debug, Default)]
struct MockState {
    tables: RwLock<HashMap<String, MockTable>>,
    primary_keys: RwLock<HashMap<String, String>>,
    scripted: RwLock<HashMap<String, Vec<Row>>>,
    log: RwLock<Vec<ExecutedStatement>>,
    fail_next: RwLock<Option<StorageError>>,
    row_fetches: AtomicU64,
    connections_acquired: AtomicU64,
    open_connections: AtomicI64,
}

/// In-memory mock storage for testing. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MockStorage {
    state: Arc<MockState>,
}

impl MockStorage {
    /// Create a new mock storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `column` instead of `id` as the primary key of `table`.
    pub fn with_primary_key(self, table: &str, column: &str) -> Self {
        if let Ok(mut keys) = self.state.primary_keys.write() {
            keys.insert(table.to_string(), column.to_string());
        }
        self
    }

    /// Return `rows` whenever exactly `sql` is queried.
    pub fn script(&self, sql: &str, rows: Vec<Row>) -> ActiveRowResult<()> {
        let mut scripted = self.state.scripted.write().map_err(|_| StorageError::LockPoisoned)?;
        scripted.insert(sql.to_string(), rows);
        Ok(())
    }

    /// Make the next executed statement fail with `error`.
    pub fn fail_next_statement(&self, error: StorageError) {
        if let Ok(mut slot) = self.state.fail_next.write() {
            *slot = Some(error);
        }
    }

    /// Seed a row directly, bypassing SQL. Returns the row's key.
    pub fn insert_row(&self, table: &str, row: Row) -> ActiveRowResult<Value> {
        let pk = self.primary_key_of(table)?;
        let mut tables = self.state.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let stored = row
            .columns()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        Ok(insert_into(tables.entry(table.to_string()).or_default(), &pk, stored))
    }

    /// Delete the row whose primary key equals `key`. Returns whether a row
    /// was removed.
    pub fn delete_row(&self, table: &str, key: &Value) -> ActiveRowResult<bool> {
        let pk = self.primary_key_of(table)?;
        let mut tables = self.state.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let Some(table) = tables.get_mut(table) else {
            return Ok(false);
        };
        let before = table.rows.len();
        table.rows.retain(|row| row.get(&pk) != Some(key));
        Ok(table.rows.len() != before)
    }

    /// Current contents of one row.
    pub fn row(&self, table: &str, key: &Value) -> ActiveRowResult<Option<Row>> {
        let pk = self.primary_key_of(table)?;
        let tables = self.state.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables
            .get(table)
            .and_then(|t| t.rows.iter().find(|row| row.get(&pk) == Some(key)))
            .map(to_row))
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .tables
            .read()
            .map(|tables| tables.get(table).map_or(0, |t| t.rows.len()))
            .unwrap_or(0)
    }

    /// Number of `SELECT *` single-row reads executed.
    pub fn row_fetches(&self) -> u64 {
        self.state.row_fetches.load(Ordering::SeqCst)
    }

    pub fn connections_acquired(&self) -> u64 {
        self.state.connections_acquired.load(Ordering::SeqCst)
    }

    /// Connections acquired and not yet released.
    pub fn open_connections(&self) -> i64 {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    /// Every statement executed so far, oldest first.
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.state.log.read().map(|log| log.clone()).unwrap_or_default()
    }

    /// The most recent statement, if any.
    pub fn last_executed(&self) -> Option<ExecutedStatement> {
        self.state.log.read().ok().and_then(|log| log.last().cloned())
    }

    fn primary_key_of(&self, table: &str) -> ActiveRowResult<String> {
        let keys = self.state.primary_keys.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(keys.get(table).cloned().unwrap_or_else(|| "id".to_string()))
    }
}

impl StorageProvider for MockStorage {
    fn acquire(&self) -> ActiveRowResult<Box<dyn Connection>> {
        self.state.connections_acquired.fetch_add(1, Ordering::SeqCst);
        self.state.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            storage: self.clone(),
        }))
    }

    fn release(&self, _connection: Box<dyn Connection>) {
        self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockConnection {
    storage: MockStorage,
}

impl Connection for MockConnection {
    fn prepare(&mut self, sql: &str) -> ActiveRowResult<Box<dyn Statement + '_>> {
        Ok(Box::new(MockStatement {
            storage: &self.storage,
            sql: sql.trim().to_string(),
        }))
    }
}

struct MockStatement<'a> {
    storage: &'a MockStorage,
    sql: String,
}

impl MockStatement<'_> {
    fn record(&self, params: &[Value]) -> ActiveRowResult<()> {
        let state = &self.storage.state;
        state
            .log
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .push(ExecutedStatement {
                sql: self.sql.clone(),
                params: params.to_vec(),
            });
        let injected = state.fail_next.write().map_err(|_| StorageError::LockPoisoned)?.take();
        match injected {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn unsupported(&self) -> StorageError {
        StorageError::QueryFailed {
            sql: self.sql.clone(),
            reason: "statement shape not supported by mock storage".to_string(),
        }
    }

    fn arity_error(&self, expected: usize, got: usize) -> StorageError {
        StorageError::QueryFailed {
            sql: self.sql.clone(),
            reason: format!("expected {} parameters, got {}", expected, got),
        }
    }
}

impl Statement for MockStatement<'_> {
    fn execute_update(&mut self, params: &[Value]) -> ActiveRowResult<UpdateOutcome> {
        self.record(params)?;
        let storage = self.storage;

        if let Some(caps) = INSERT_RE.captures(&self.sql) {
            let table = &caps[1];
            let columns = split_list(&caps[2]);
            if columns.len() != params.len() {
                return Err(self.arity_error(columns.len(), params.len()).into());
            }
            let pk = storage.primary_key_of(table)?;
            let mut tables = storage.state.tables.write().map_err(|_| StorageError::LockPoisoned)?;
            let row = columns.into_iter().zip(params.iter().cloned()).collect();
            let key = insert_into(tables.entry(table.to_string()).or_default(), &pk, row);
            tracing::trace!(table, key = %key, "mock insert");
            return Ok(UpdateOutcome {
                rows_affected: 1,
                generated_keys: vec![key],
            });
        }

        if let Some(caps) = UPDATE_RE.captures(&self.sql) {
            let table = &caps[1];
            let assignments: Vec<String> = caps[2]
                .split(',')
                .map(|a| a.trim().trim_end_matches("= ?").trim().to_string())
                .collect();
            let pk_column = caps[3].to_string();
            if assignments.len() + 1 != params.len() {
                return Err(self.arity_error(assignments.len() + 1, params.len()).into());
            }
            let key = &params[assignments.len()];
            let mut tables = storage.state.tables.write().map_err(|_| StorageError::LockPoisoned)?;
            let mut affected = 0;
            if let Some(table) = tables.get_mut(table) {
                for row in table.rows.iter_mut().filter(|r| r.get(&pk_column) == Some(key)) {
                    for (column, value) in assignments.iter().zip(params) {
                        row.insert(column.clone(), value.clone());
                    }
                    affected += 1;
                }
            }
            return Ok(UpdateOutcome {
                rows_affected: affected,
                generated_keys: Vec::new(),
            });
        }

        Err(self.unsupported().into())
    }

    fn execute_query(&mut self, params: &[Value]) -> ActiveRowResult<Vec<Row>> {
        self.record(params)?;
        let storage = self.storage;

        {
            let scripted = storage.state.scripted.read().map_err(|_| StorageError::LockPoisoned)?;
            if let Some(rows) = scripted.get(&self.sql) {
                return Ok(rows.clone());
            }
        }

        let tables = storage.state.tables.read().map_err(|_| StorageError::LockPoisoned)?;

        if let Some(caps) = SELECT_ROW_RE.captures(&self.sql) {
            storage.state.row_fetches.fetch_add(1, Ordering::SeqCst);
            let key = params.first().ok_or_else(|| self.arity_error(1, 0))?;
            let column = &caps[2];
            return Ok(tables
                .get(&caps[1])
                .map(|t| {
                    t.rows
                        .iter()
                        .filter(|row| row.get(column) == Some(key))
                        .map(to_row)
                        .collect()
                })
                .unwrap_or_default());
        }

        if let Some(caps) = SELECT_COLUMN_RE.captures(&self.sql) {
            let selected = caps[2].to_string();
            let Some(table) = tables.get(&caps[3]) else {
                return Ok(Vec::new());
            };
            let criteria = match caps.get(5) {
                Some(criteria) => Criteria::parse(criteria.as_str()).ok_or_else(|| self.unsupported())?,
                None => Criteria::default(),
            };
            if criteria.placeholders() != params.len() {
                return Err(self.arity_error(criteria.placeholders(), params.len()).into());
            }
            return Ok(table
                .rows
                .iter()
                .filter(|row| criteria.matches(row, params))
                .map(|row| {
                    let value = row.get(&selected).cloned().unwrap_or(Value::Null);
                    Row::new().with(selected.clone(), value)
                })
                .collect());
        }

        Err(self.unsupported().into())
    }
}

/// `a = ? AND b = ? OR c = ?`: a disjunction of conjunctions of equalities.
#[derive(Debug, Default)]
struct Criteria {
    any_of: Vec<Vec<String>>,
}

impl Criteria {
    fn parse(source: &str) -> Option<Self> {
        let mut any_of = Vec::new();
        for disjunct in split_keyword(source, "OR") {
            let mut all_of = Vec::new();
            for clause in split_keyword(&disjunct, "AND") {
                let caps = CLAUSE_RE.captures(clause.trim())?;
                all_of.push(caps[2].to_string());
            }
            any_of.push(all_of);
        }
        Some(Self { any_of })
    }

    fn placeholders(&self) -> usize {
        self.any_of.iter().map(Vec::len).sum()
    }

    fn matches(&self, row: &StoredRow, params: &[Value]) -> bool {
        if self.any_of.is_empty() {
            return true;
        }
        let mut offset = 0;
        let mut matched = false;
        for all_of in &self.any_of {
            let bound = &params[offset..offset + all_of.len()];
            offset += all_of.len();
            if all_of
                .iter()
                .zip(bound)
                .all(|(column, value)| row.get(column).unwrap_or(&Value::Null) == value)
            {
                matched = true;
            }
        }
        matched
    }
}

fn split_keyword(source: &str, keyword: &str) -> Vec<String> {
    let separator = format!(" {} ", keyword);
    let upper = source.to_ascii_uppercase();
    let mut parts = Vec::new();
    let mut start = 0;
    while let Some(found) = upper[start..].find(&separator) {
        parts.push(source[start..start + found].to_string());
        start += found + separator.len();
    }
    parts.push(source[start..].to_string());
    parts
}

fn split_list(source: &str) -> Vec<String> {
    source
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn insert_into(table: &mut MockTable, pk: &str, mut row: StoredRow) -> Value {
    let key = match row.get(pk) {
        Some(Value::Int(given)) => {
            table.next_id = table.next_id.max(*given);
            Value::Int(*given)
        }
        Some(other) if !other.is_null() => other.clone(),
        _ => {
            table.next_id += 1;
            let generated = Value::Int(table.next_id);
            row.insert(pk.to_string(), generated.clone());
            generated
        }
    };
    table.rows.push(row);
    key
}

fn to_row(stored: &StoredRow) -> Row {
    stored
        .iter()
        .fold(Row::new(), |row, (name, value)| row.with(name.clone(), value.clone()))
}
