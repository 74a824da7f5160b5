//! The entity manager: identity map, entity factory and query orchestration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use activerow_cache::{factory_from_config, CacheLayerFactory, RamCache, RemoteCache};
use activerow_core::{
    ActiveRowConfig, ActiveRowResult, CacheKey, ConfigError, ConventionMetadataReader, DbParam,
    EntityType, EntityTypeBuilder, Key, MetadataReader, NameConverter, PluggableNameConverter,
    StorageError, Value,
};
use activerow_storage::{ConnectionGuard, Row, StorageProvider, UpdateOutcome};

use crate::handle::{EntityCell, EntityHandle, FieldValue};
use crate::proxy::{not_found, EntityProxy};

/// Alias every generated query gives the entity's own table.
pub const PRIME_ALIAS: &str = "prime";

/// Counters describing a manager's identity map and storage traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Entities with at least one live handle.
    pub live_entities: usize,
    /// Proxies constructed since the manager was built.
    pub proxies_created: u64,
    /// Single-row reads issued to fill entity caches.
    pub row_fetches: u64,
}

fn lock_poisoned<T>(_: T) -> StorageError {
    StorageError::LockPoisoned
}

pub(crate) struct ManagerInner {
    provider: Arc<dyn StorageProvider>,
    names: Arc<dyn NameConverter>,
    reader: Arc<dyn MetadataReader>,
    caches: Arc<dyn CacheLayerFactory>,
    types: RwLock<HashMap<String, Arc<EntityType>>>,
    /// Lock order: `identity` before `proxies`.
    pub(crate) identity: Mutex<HashMap<CacheKey, Weak<EntityCell>>>,
    pub(crate) proxies: Mutex<HashMap<u64, Weak<EntityProxy>>>,
    next_handle: AtomicU64,
    proxies_created: AtomicU64,
    row_fetches: AtomicU64,
    closed: AtomicBool,
}

impl ManagerInner {
    fn ensure_open(&self) -> ActiveRowResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConfigError::ManagerShutDown.into());
        }
        Ok(())
    }

    fn identity(&self) -> ActiveRowResult<MutexGuard<'_, HashMap<CacheKey, Weak<EntityCell>>>> {
        Ok(self.identity.lock().map_err(lock_poisoned)?)
    }

    pub(crate) fn entity_type(&self, name: &str) -> ActiveRowResult<Arc<EntityType>> {
        let types = self.types.read().map_err(lock_poisoned)?;
        types.get(name).cloned().ok_or_else(|| {
            ConfigError::UnknownEntityType {
                name: name.to_string(),
            }
            .into()
        })
    }

    fn table_name(&self, entity_type: &EntityType) -> String {
        self.names.table_name(entity_type)
    }

    /// Look up or create the canonical handle for `(entity_type, key)`.
    /// Never touches storage.
    pub(crate) fn handle_for(
        self: &Arc<Self>,
        entity_type: &Arc<EntityType>,
        key: Key,
    ) -> ActiveRowResult<EntityHandle> {
        self.ensure_open()?;
        // One entry per row: keys are normalised to the declared kind.
        let kind = entity_type.key_kind();
        let key = kind.coerce(&key).ok_or_else(|| ConfigError::InvalidValue {
            field: format!("{} key", entity_type.name()),
            value: key.to_string(),
            reason: format!("not a {:?} key", kind),
        })?;
        let cache_key = CacheKey::new(key.clone(), entity_type.name());

        let mut identity = self.identity()?;
        if let Some(cell) = identity.get(&cache_key).and_then(Weak::upgrade) {
            return Ok(EntityHandle::new(cell));
        }

        let table = self.table_name(entity_type);
        let cache = self.caches.layer_for(entity_type, &table, &key);
        let proxy = Arc::new(EntityProxy::new(
            entity_type.clone(),
            table,
            key,
            cache,
            self.clone(),
        ));
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(EntityCell {
            id,
            proxy: proxy.clone(),
        });

        identity.insert(cache_key, Arc::downgrade(&cell));
        self.proxies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::downgrade(&proxy));
        self.proxies_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(entity_type = %entity_type.name(), key = %proxy.key(), "registered entity");

        Ok(EntityHandle::new(cell))
    }

    /// Handle for a stored foreign key of type `target`, or `None` for null.
    pub(crate) fn resolve(
        self: &Arc<Self>,
        target: &str,
        value: &Value,
    ) -> ActiveRowResult<Option<EntityHandle>> {
        if value.is_null() {
            return Ok(None);
        }
        let entity_type = self.entity_type(target)?;
        let key = entity_type.key_kind().key_from_value(value).ok_or_else(|| {
            ConfigError::InvalidValue {
                field: format!("{} key", target),
                value: value.to_string(),
                reason: format!("not a {:?} key", entity_type.key_kind()),
            }
        })?;
        self.handle_for(&entity_type, key).map(Some)
    }

    /// Read the full row behind one entity.
    pub(crate) fn fetch_row(&self, entity_type: &EntityType, table: &str, key: &Key) -> ActiveRowResult<Row> {
        self.ensure_open()?;
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ?",
            table,
            entity_type.primary_key_field()
        );
        let rows = {
            let mut conn = ConnectionGuard::acquire(self.provider.as_ref())?;
            conn.query(&sql, &[key.to_value()])?
        };
        self.row_fetches.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(entity_type = %entity_type.name(), key = %key, "fetched row");
        rows.into_iter()
            .next()
            .ok_or_else(|| not_found(entity_type, key).into())
    }

    pub(crate) fn execute_update(&self, sql: &str, params: &[Value]) -> ActiveRowResult<UpdateOutcome> {
        self.ensure_open()?;
        let mut conn = ConnectionGuard::acquire(self.provider.as_ref())?;
        let outcome = conn.execute_update(sql, params)?;
        tracing::debug!(sql, rows_affected = outcome.rows_affected, "executed update");
        Ok(outcome)
    }

    /// Run a key query and map column `id_column` (or column 0) of every row
    /// through the identity map.
    fn query_handles(
        self: &Arc<Self>,
        entity_type: &Arc<EntityType>,
        sql: &str,
        params: &[Value],
        id_column: Option<&str>,
    ) -> ActiveRowResult<Vec<EntityHandle>> {
        self.ensure_open()?;
        let rows = {
            let mut conn = ConnectionGuard::acquire(self.provider.as_ref())?;
            conn.query(sql, params)?
        };
        tracing::debug!(entity_type = %entity_type.name(), sql, rows = rows.len(), "queried keys");

        let mut handles = Vec::with_capacity(rows.len());
        for row in rows {
            let value = match id_column {
                Some(column) => row.get(column),
                None => row.get_index(0),
            }
            .ok_or_else(|| StorageError::MissingColumn {
                column: id_column.unwrap_or("0").to_string(),
            })?;
            let key = entity_type.key_kind().key_from_value(value).ok_or_else(|| {
                StorageError::QueryFailed {
                    sql: sql.to_string(),
                    reason: format!("{} is not a valid {} key", value, entity_type.name()),
                }
            })?;
            handles.push(self.handle_for(entity_type, key)?);
        }
        Ok(handles)
    }

    /// Entities of type `target` whose foreign keys point at `owner`.
    pub(crate) fn one_to_many(
        self: &Arc<Self>,
        owner: &EntityType,
        key: &Key,
        method: &str,
        target: &str,
    ) -> ActiveRowResult<Vec<EntityHandle>> {
        let target_type = self.entity_type(target)?;
        let mapping = target_type.mapping_fields_to(owner.name());
        if mapping.is_empty() {
            return Err(ConfigError::Unconfigured {
                entity_type: owner.name().to_string(),
                method: method.to_string(),
            }
            .into());
        }

        let criteria: Vec<String> = mapping
            .iter()
            .map(|field| format!("{}.{} = ?", PRIME_ALIAS, field))
            .collect();
        let sql = format!(
            "SELECT {alias}.{pk} FROM {table} {alias} WHERE {criteria}",
            alias = PRIME_ALIAS,
            pk = target_type.primary_key_field(),
            table = self.table_name(&target_type),
            criteria = criteria.join(" OR "),
        );
        let params = vec![key.to_value(); mapping.len()];
        self.query_handles(&target_type, &sql, &params, None)
    }

    /// Entities of type `target` linked to `owner` through rows of `through`.
    pub(crate) fn many_to_many(
        self: &Arc<Self>,
        owner: &EntityType,
        key: &Key,
        method: &str,
        target: &str,
        through: &str,
    ) -> ActiveRowResult<Vec<EntityHandle>> {
        let target_type = self.entity_type(target)?;
        let through_type = self.entity_type(through)?;
        let unconfigured = || ConfigError::Unconfigured {
            entity_type: owner.name().to_string(),
            method: method.to_string(),
        };

        // Self-referential link tables take their fields in name order.
        let owner_field = through_type
            .mapping_fields_to(owner.name())
            .into_iter()
            .next()
            .ok_or_else(unconfigured)?;
        let target_field = through_type
            .mapping_fields_to(target)
            .into_iter()
            .find(|field| *field != owner_field)
            .ok_or_else(unconfigured)?;

        let sql = format!(
            "SELECT {alias}.{target_field} FROM {table} {alias} WHERE {alias}.{owner_field} = ?",
            alias = PRIME_ALIAS,
            table = self.table_name(&through_type),
        );
        self.query_handles(&target_type, &sql, &[key.to_value()], None)
    }
}

// ============================================================================
// PUBLIC MANAGER
// ============================================================================

/// Process-wide (or test-wide) entity manager.
///
/// Guarantees at most one live [`EntityHandle`] per `(type, primary key)`.
/// The manager holds entities weakly: once every handle to an entity is
/// dropped its map entries go with it.
///
/// Cloning yields another reference to the same manager.
#[derive(Clone)]
pub struct EntityManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityManager")
            .field("stats", &self.stats())
            .field("closed", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl EntityManager {
    pub fn builder(provider: Arc<dyn StorageProvider>) -> EntityManagerBuilder {
        EntityManagerBuilder {
            provider,
            names: None,
            reader: None,
            caches: None,
        }
    }

    /// A manager with default naming, metadata conventions and RAM caches.
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self::builder(provider).build()
    }

    /// Build a manager from configuration. Shadowed cache mode needs a
    /// remote cache client.
    pub fn from_config(
        provider: Arc<dyn StorageProvider>,
        config: &ActiveRowConfig,
        remote: Option<Arc<dyn RemoteCache>>,
    ) -> ActiveRowResult<Self> {
        config.validate()?;
        Ok(Self::builder(provider)
            .name_converter(Arc::new(config.name_converter()?))
            .metadata_reader(Arc::new(config.metadata_reader()))
            .cache_factory(factory_from_config(&config.cache, remote)?)
            .build())
    }

    /// Describe and register an entity type with this manager's metadata
    /// reader.
    pub fn declare(&self, builder: EntityTypeBuilder) -> ActiveRowResult<Arc<EntityType>> {
        let entity_type = builder.build(self.inner.reader.as_ref())?;
        self.register(entity_type)
    }

    /// Register an already built entity type, replacing any type of the same
    /// name.
    pub fn register(&self, entity_type: EntityType) -> ActiveRowResult<Arc<EntityType>> {
        let entity_type = Arc::new(entity_type);
        let mut types = self.inner.types.write().map_err(lock_poisoned)?;
        types.insert(entity_type.name().to_string(), entity_type.clone());
        tracing::debug!(entity_type = %entity_type.name(), "registered entity type");
        Ok(entity_type)
    }

    pub fn entity_type(&self, name: &str) -> ActiveRowResult<Arc<EntityType>> {
        self.inner.entity_type(name)
    }

    /// Table an entity type maps to.
    pub fn table_name(&self, entity_type: &EntityType) -> String {
        self.inner.table_name(entity_type)
    }

    /// Canonical handles for each key, in order. No storage is read.
    pub fn get(&self, entity_type: &Arc<EntityType>, keys: &[Key]) -> ActiveRowResult<Vec<EntityHandle>> {
        keys.iter()
            .map(|key| self.inner.handle_for(entity_type, key.clone()))
            .collect()
    }

    pub fn get_one(&self, entity_type: &Arc<EntityType>, key: impl Into<Key>) -> ActiveRowResult<EntityHandle> {
        self.inner.handle_for(entity_type, key.into())
    }

    /// Insert a row and return the canonical handle for its new key.
    pub fn create(&self, entity_type: &Arc<EntityType>, params: Vec<DbParam>) -> ActiveRowResult<EntityHandle> {
        self.inner.ensure_open()?;
        let table = self.inner.table_name(entity_type);
        let (columns, values): (Vec<String>, Vec<Value>) =
            params.into_iter().map(DbParam::into_parts).unzip();
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders
        );

        let outcome = self.inner.execute_update(&sql, &values)?;
        let generated = outcome
            .generated_keys
            .first()
            .ok_or_else(|| StorageError::NoGeneratedKey { table: table.clone() })?;
        let key = entity_type.key_kind().key_from_value(generated).ok_or_else(|| {
            StorageError::InsertFailed {
                table: table.clone(),
                reason: format!("generated key {} is not a {:?} key", generated, entity_type.key_kind()),
            }
        })?;
        tracing::debug!(entity_type = %entity_type.name(), key = %key, "created entity");

        self.inner.handle_for(entity_type, key)
    }

    /// Every entity of a type.
    pub fn find_all(&self, entity_type: &Arc<EntityType>) -> ActiveRowResult<Vec<EntityHandle>> {
        self.find_keys(entity_type, None, None, &[])
    }

    /// Entities matching a parameterised predicate over the table aliased
    /// `prime`. Entity handles among `params` bind their primary keys.
    pub fn find(
        &self,
        entity_type: &Arc<EntityType>,
        criteria: &str,
        params: &[FieldValue],
    ) -> ActiveRowResult<Vec<EntityHandle>> {
        self.find_keys(entity_type, None, Some(criteria), params)
    }

    /// Like [`EntityManager::find`] with a join clause after the table.
    pub fn find_with_join(
        &self,
        entity_type: &Arc<EntityType>,
        join: &str,
        criteria: Option<&str>,
        params: &[FieldValue],
    ) -> ActiveRowResult<Vec<EntityHandle>> {
        self.find_keys(entity_type, Some(join), criteria, params)
    }

    /// Run caller-supplied SQL; column `id_field` of each row is the key.
    pub fn find_with_sql(
        &self,
        entity_type: &Arc<EntityType>,
        id_field: &str,
        sql: &str,
        params: &[FieldValue],
    ) -> ActiveRowResult<Vec<EntityHandle>> {
        let values = bind(sql, params)?;
        self.inner.query_handles(entity_type, sql, &values, Some(id_field))
    }

    fn find_keys(
        &self,
        entity_type: &Arc<EntityType>,
        join: Option<&str>,
        criteria: Option<&str>,
        params: &[FieldValue],
    ) -> ActiveRowResult<Vec<EntityHandle>> {
        let mut sql = format!(
            "SELECT {alias}.{pk} FROM {table} {alias}",
            alias = PRIME_ALIAS,
            pk = entity_type.primary_key_field(),
            table = self.inner.table_name(entity_type),
        );
        if let Some(join) = join.filter(|j| !j.trim().is_empty()) {
            sql.push(' ');
            sql.push_str(join.trim());
        }
        if let Some(criteria) = criteria.filter(|c| !c.trim().is_empty()) {
            sql.push_str(" WHERE ");
            sql.push_str(criteria.trim());
        }
        let values = bind(&sql, params)?;
        self.inner.query_handles(entity_type, &sql, &values, None)
    }

    /// The proxy behind a handle, or `None` when the handle is not (or no
    /// longer) registered with this manager.
    pub fn get_proxy_for_entity(&self, handle: &EntityHandle) -> Option<Arc<EntityProxy>> {
        if !Arc::ptr_eq(handle.cell.proxy.manager(), &self.inner) {
            return None;
        }
        let proxies = self.inner.proxies.lock().ok()?;
        proxies.get(&handle.cell.id).and_then(Weak::upgrade)
    }

    /// Drop every cached and unsaved value of one entity.
    pub fn flush(&self, handle: &EntityHandle) -> ActiveRowResult<()> {
        let proxy = self.get_proxy_for_entity(handle).ok_or_else(|| ConfigError::UnknownEntityType {
            name: handle.to_string(),
        })?;
        proxy.flush_cache();
        Ok(())
    }

    /// Flush every live entity.
    pub fn flush_all(&self) -> ActiveRowResult<()> {
        let live: Vec<Arc<EntityProxy>> = {
            let proxies = self.inner.proxies.lock().map_err(lock_poisoned)?;
            proxies.values().filter_map(Weak::upgrade).collect()
        };
        tracing::debug!(entities = live.len(), "flushing all entities");
        for proxy in live {
            proxy.flush_cache();
        }
        Ok(())
    }

    pub fn stats(&self) -> ManagerStats {
        let live_entities = self
            .inner
            .identity
            .lock()
            .map(|identity| identity.values().filter(|cell| cell.strong_count() > 0).count())
            .unwrap_or(0);
        ManagerStats {
            live_entities,
            proxies_created: self.inner.proxies_created.load(Ordering::Relaxed),
            row_fetches: self.inner.row_fetches.load(Ordering::Relaxed),
        }
    }

    /// Forget every entity and refuse further storage work. Handles already
    /// given out keep serving cached fields.
    pub fn shutdown(&self) -> ActiveRowResult<()> {
        self.inner.closed.store(true, Ordering::Release);
        let mut identity = self.inner.identity()?;
        let mut proxies = self.inner.proxies.lock().map_err(lock_poisoned)?;
        let dropped = identity.len();
        identity.clear();
        proxies.clear();
        tracing::debug!(dropped, "entity manager shut down");
        Ok(())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

fn bind(sql: &str, params: &[FieldValue]) -> ActiveRowResult<Vec<Value>> {
    params.iter().map(|param| param.to_param(sql)).collect()
}

/// Collaborators for an [`EntityManager`]; anything left unset gets the
/// default convention.
pub struct EntityManagerBuilder {
    provider: Arc<dyn StorageProvider>,
    names: Option<Arc<dyn NameConverter>>,
    reader: Option<Arc<dyn MetadataReader>>,
    caches: Option<Arc<dyn CacheLayerFactory>>,
}

impl EntityManagerBuilder {
    pub fn name_converter(mut self, names: Arc<dyn NameConverter>) -> Self {
        self.names = Some(names);
        self
    }

    pub fn metadata_reader(mut self, reader: Arc<dyn MetadataReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn cache_factory(mut self, caches: Arc<dyn CacheLayerFactory>) -> Self {
        self.caches = Some(caches);
        self
    }

    pub fn build(self) -> EntityManager {
        EntityManager {
            inner: Arc::new(ManagerInner {
                provider: self.provider,
                names: self
                    .names
                    .unwrap_or_else(|| Arc::new(PluggableNameConverter::new())),
                reader: self
                    .reader
                    .unwrap_or_else(|| Arc::new(ConventionMetadataReader::default())),
                caches: self.caches.unwrap_or_else(|| Arc::new(RamCache)),
                types: RwLock::new(HashMap::new()),
                identity: Mutex::new(HashMap::new()),
                proxies: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                proxies_created: AtomicU64::new(0),
                row_fetches: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }
}
