//! Per-entity method dispatch.
//!
//! Every call on an [`EntityHandle`](crate::EntityHandle) lands in
//! [`EntityProxy::invoke`], which looks the method up in the entity type's
//! frozen registry and serves it from the key slot, the cache layer, or a
//! relation query.

use std::sync::{Arc, Mutex, PoisonError};

use activerow_cache::{CacheLayer, CacheStats};
use activerow_core::{
    ActiveRowResult, ConfigError, EntityType, FieldType, Key, MethodKind, StorageError, Value,
};

use crate::handle::FieldValue;
use crate::manager::ManagerInner;

/// Interception object bound to one live entity and its cache layer.
pub struct EntityProxy {
    entity_type: Arc<EntityType>,
    table: String,
    key: Key,
    cache: Box<dyn CacheLayer>,
    /// Serialises row fetches so concurrent misses load once.
    load: Mutex<()>,
    /// Serialises saves so an older snapshot never lands after a newer one.
    save: Mutex<()>,
    manager: Arc<ManagerInner>,
}

impl EntityProxy {
    pub(crate) fn new(
        entity_type: Arc<EntityType>,
        table: String,
        key: Key,
        cache: Box<dyn CacheLayer>,
        manager: Arc<ManagerInner>,
    ) -> Self {
        Self {
            entity_type,
            table,
            key,
            cache,
            load: Mutex::new(()),
            save: Mutex::new(()),
            manager,
        }
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn dirty_fields(&self) -> Vec<String> {
        self.cache.dirty_fields()
    }

    pub(crate) fn manager(&self) -> &Arc<ManagerInner> {
        &self.manager
    }

    /// Discard every cached and dirty value so the next read goes to storage.
    pub fn flush_cache(&self) {
        self.cache.clear_dirty();
        for (field, _) in self.entity_type.fields() {
            self.cache.remove(field);
        }
        tracing::debug!(entity = %self.describe(), "flushed entity cache");
    }

    pub(crate) fn invoke(&self, method: &str, args: Vec<FieldValue>) -> ActiveRowResult<FieldValue> {
        let kind = self
            .entity_type
            .method(method)
            .ok_or_else(|| ConfigError::Unconfigured {
                entity_type: self.entity_type.name().to_string(),
                method: method.to_string(),
            })?;

        match kind {
            MethodKind::PrimaryKeyAccessor => {
                self.expect_args(method, &args, 0)?;
                Ok(FieldValue::Scalar(self.key.to_value()))
            }
            MethodKind::PrimaryKeyMutator => {
                self.expect_args(method, &args, 1)?;
                self.assign_key(&args[0])?;
                Ok(FieldValue::Unit)
            }
            MethodKind::Accessor { field, field_type } => {
                self.expect_args(method, &args, 0)?;
                let value = self.read_field(field)?;
                match field_type {
                    FieldType::Entity(target) => {
                        Ok(FieldValue::Entity(self.manager.resolve(target, &value)?))
                    }
                    _ => Ok(FieldValue::Scalar(value)),
                }
            }
            MethodKind::Mutator { field, .. } => {
                self.expect_args(method, &args, 1)?;
                let value = args[0].to_param(&self.qualified(method))?;
                self.cache.put(field, value);
                tracing::trace!(entity = %self.describe(), field = %field, "field written");
                Ok(FieldValue::Unit)
            }
            MethodKind::OneToMany { target } => {
                self.expect_args(method, &args, 0)?;
                let related = self
                    .manager
                    .one_to_many(&self.entity_type, &self.key, method, target)?;
                Ok(FieldValue::Entities(related))
            }
            MethodKind::ManyToMany { target, through } => {
                self.expect_args(method, &args, 0)?;
                let related = self.manager.many_to_many(
                    &self.entity_type,
                    &self.key,
                    method,
                    target,
                    through,
                )?;
                Ok(FieldValue::Entities(related))
            }
        }
    }

    /// Write all dirty fields with one `UPDATE`, then mark clean each field
    /// that still holds the value written. Writes made while the statement
    /// runs stay dirty for the next save.
    pub(crate) fn save(&self) -> ActiveRowResult<()> {
        let _saving = self.save.lock().unwrap_or_else(PoisonError::into_inner);
        let dirty: Vec<(String, Value)> = self
            .cache
            .dirty_fields()
            .into_iter()
            .filter_map(|field| self.cache.get(&field).map(|value| (field, value)))
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }

        let assignments: Vec<String> = dirty.iter().map(|(field, _)| format!("{} = ?", field)).collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            self.table,
            assignments.join(", "),
            self.entity_type.primary_key_field()
        );
        let mut params: Vec<Value> = dirty.iter().map(|(_, value)| value.clone()).collect();
        params.push(self.key.to_value());

        self.manager.execute_update(&sql, &params)?;
        tracing::debug!(entity = %self.describe(), fields = dirty.len(), "saved entity");

        for (field, value) in &dirty {
            if !self.cache.mark_clean(field, value) {
                tracing::debug!(entity = %self.describe(), field = %field, "field rewritten during save, left dirty");
            }
        }
        Ok(())
    }

    fn read_field(&self, field: &str) -> ActiveRowResult<Value> {
        if let Some(value) = self.cached(field) {
            return Ok(value);
        }

        let _loading = self.load.lock().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have loaded the row while we waited.
        if let Some(value) = self.cached(field) {
            return Ok(value);
        }

        tracing::trace!(entity = %self.describe(), field, "cache miss");
        let row = self.manager.fetch_row(&self.entity_type, &self.table, &self.key)?;
        // Columns the row lacks are cached as null so they never refetch.
        for (name, _) in self.entity_type.fields() {
            let value = row.get(name).cloned().unwrap_or(Value::Null);
            self.cache.fill(name, value);
        }
        // A dirty local write wins over the row just read.
        if let Some(value) = self.dirty_value(field) {
            return Ok(value);
        }
        Ok(row.get(field).cloned().unwrap_or(Value::Null))
    }

    fn cached(&self, field: &str) -> Option<Value> {
        if !self.cache.contains(field) {
            return None;
        }
        let value = self.cache.get(field)?;
        tracing::trace!(entity = %self.describe(), field, "cache hit");
        Some(value)
    }

    fn dirty_value(&self, field: &str) -> Option<Value> {
        if self.cache.dirty_contains(field) {
            self.cache.get(field)
        } else {
            None
        }
    }

    /// A live entity never changes identity; re-assigning the same key is a
    /// no-op.
    fn assign_key(&self, arg: &FieldValue) -> ActiveRowResult<()> {
        let value = arg.to_param(&self.qualified("primary key"))?;
        match self.entity_type.key_kind().key_from_value(&value) {
            Some(key) if key == self.key => Ok(()),
            _ => Err(ConfigError::PrimaryKeyReassignment {
                entity_type: self.entity_type.name().to_string(),
                current: self.key.clone(),
                requested: value.to_string(),
            }
            .into()),
        }
    }

    fn expect_args(&self, method: &str, args: &[FieldValue], expected: usize) -> ActiveRowResult<()> {
        if args.len() == expected {
            return Ok(());
        }
        Err(ConfigError::ArgumentMismatch {
            method: self.qualified(method),
            expected: format!("{} arguments", expected),
            got: format!("{} arguments", args.len()),
        }
        .into())
    }

    fn qualified(&self, method: &str) -> String {
        format!("{}.{}", self.entity_type.name(), method)
    }

    fn describe(&self) -> String {
        format!("{}[{}]", self.entity_type.name(), self.key)
    }
}

impl std::fmt::Debug for EntityProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityProxy")
            .field("entity_type", &self.entity_type.name())
            .field("table", &self.table)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Row fetch came back empty.
pub(crate) fn not_found(entity_type: &EntityType, key: &Key) -> StorageError {
    StorageError::NotFound {
        entity_type: entity_type.name().to_string(),
        key: key.clone(),
    }
}
