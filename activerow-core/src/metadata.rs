//! Declared entity metadata.
//!
//! An entity type is declared as a set of method signatures. Each signature
//! is described once by a [`MetadataReader`] and frozen into a
//! name → [`MethodKind`] registry on the [`EntityType`], so dispatching a
//! call never has to pattern match on method names again.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{ActiveRowResult, ConfigError};
use crate::KeyKind;

/// Default suffix appended to fields that hold another entity's key.
pub const DEFAULT_KEY_SUFFIX: &str = "ID";

/// Default primary key field name.
pub const DEFAULT_PRIMARY_KEY: &str = "id";

// ============================================================================
// SIGNATURES
// ============================================================================

/// Value type of a declared field, parameter or return.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    Text,
    Uuid,
    Timestamp,
    Bytes,
    /// Any scalar value, including opaque in-process values.
    Any,
    /// A single related entity, stored as a foreign key.
    Entity(String),
    /// A collection of related entities.
    Entities(String),
}

impl FieldType {
    /// Target type name when this is a to-one entity reference.
    pub fn entity_target(&self) -> Option<&str> {
        match self {
            FieldType::Entity(target) => Some(target),
            _ => None,
        }
    }

    pub fn is_entity(&self) -> bool {
        matches!(self, FieldType::Entity(_))
    }
}

/// Declared metadata attached to a method, overriding name conventions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Annotation {
    /// Explicit accessor for the named field.
    Accessor(String),
    /// Explicit mutator for the named field.
    Mutator(String),
    /// Collection of entities whose foreign keys point back at this one.
    OneToMany,
    /// Collection reached through an intermediate entity type.
    ManyToMany { through: String },
}

/// A declared method on an entity contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    name: String,
    returns: Option<FieldType>,
    params: Vec<FieldType>,
    annotation: Option<Annotation>,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            returns: None,
            params: Vec::new(),
            annotation: None,
        }
    }

    /// `name() -> field_type`
    pub fn accessor(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(name).returning(field_type)
    }

    /// `name(field_type)`
    pub fn mutator(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(name).taking(field_type)
    }

    pub fn returning(mut self, field_type: FieldType) -> Self {
        self.returns = Some(field_type);
        self
    }

    pub fn taking(mut self, field_type: FieldType) -> Self {
        self.params.push(field_type);
        self
    }

    pub fn annotated(mut self, annotation: Annotation) -> Self {
        self.annotation = Some(annotation);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn returns(&self) -> Option<&FieldType> {
        self.returns.as_ref()
    }

    pub fn params(&self) -> &[FieldType] {
        &self.params
    }

    pub fn annotation(&self) -> Option<&Annotation> {
        self.annotation.as_ref()
    }
}

// ============================================================================
// METADATA READER
// ============================================================================

/// Relation carried by a described method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    None,
    /// Implicit: the field stores the related entity's key.
    ToOne,
    ToMany,
    ManyToMany { through: String },
}

/// Whether a described method reads or writes its field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// What a [`MetadataReader`] learned from one method signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Logical field name; `None` for collection relations.
    pub field_name: Option<String>,
    pub field_type: FieldType,
    pub relation: RelationKind,
    pub access: Access,
}

/// Resolves a method signature to the field it reads or writes.
///
/// Returns `Ok(None)` when the method matches no recognised pattern.
pub trait MetadataReader: Send + Sync {
    fn describe(&self, method: &MethodSignature) -> ActiveRowResult<Option<FieldDescriptor>>;
}

/// Lower-case the leading character of `name`.
pub fn downcase_first(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Strip `prefix` from `method` when at least one character follows it.
fn strip_accessor_prefix<'a>(method: &'a str, prefix: &str) -> Option<&'a str> {
    method.strip_prefix(prefix).filter(|rest| !rest.is_empty())
}

/// `getX` / `isX` / `setX` naming conventions, with declared annotations
/// taking precedence.
#[derive(Debug, Clone)]
pub struct ConventionMetadataReader {
    key_suffix: String,
}

impl Default for ConventionMetadataReader {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_SUFFIX)
    }
}

impl ConventionMetadataReader {
    pub fn new(key_suffix: impl Into<String>) -> Self {
        Self {
            key_suffix: key_suffix.into(),
        }
    }

    pub fn key_suffix(&self) -> &str {
        &self.key_suffix
    }

    fn returned(method: &MethodSignature) -> ActiveRowResult<FieldType> {
        method.returns().cloned().ok_or_else(|| {
            ConfigError::ArgumentMismatch {
                method: method.name().to_string(),
                expected: "a return type".to_string(),
                got: "none".to_string(),
            }
            .into()
        })
    }

    fn single_param(method: &MethodSignature) -> ActiveRowResult<FieldType> {
        match method.params() {
            [only] => Ok(only.clone()),
            other => Err(ConfigError::ArgumentMismatch {
                method: method.name().to_string(),
                expected: "1 parameter".to_string(),
                got: format!("{} parameters", other.len()),
            }
            .into()),
        }
    }

    fn scalar(&self, name: String, field_type: FieldType, access: Access) -> FieldDescriptor {
        let relation = if field_type.is_entity() {
            RelationKind::ToOne
        } else {
            RelationKind::None
        };
        FieldDescriptor {
            field_name: Some(name),
            field_type,
            relation,
            access,
        }
    }

    fn derived(&self, stem: &str, field_type: &FieldType) -> String {
        let mut name = downcase_first(stem);
        if field_type.is_entity() {
            name.push_str(&self.key_suffix);
        }
        name
    }
}

impl MetadataReader for ConventionMetadataReader {
    fn describe(&self, method: &MethodSignature) -> ActiveRowResult<Option<FieldDescriptor>> {
        match method.annotation() {
            Some(Annotation::Accessor(name)) => {
                let field_type = Self::returned(method)?;
                return Ok(Some(self.scalar(name.clone(), field_type, Access::Read)));
            }
            Some(Annotation::Mutator(name)) => {
                let field_type = Self::single_param(method)?;
                return Ok(Some(self.scalar(name.clone(), field_type, Access::Write)));
            }
            Some(Annotation::OneToMany) => {
                return Ok(Some(FieldDescriptor {
                    field_name: None,
                    field_type: Self::returned(method)?,
                    relation: RelationKind::ToMany,
                    access: Access::Read,
                }));
            }
            Some(Annotation::ManyToMany { through }) => {
                return Ok(Some(FieldDescriptor {
                    field_name: None,
                    field_type: Self::returned(method)?,
                    relation: RelationKind::ManyToMany {
                        through: through.clone(),
                    },
                    access: Access::Read,
                }));
            }
            None => {}
        }

        let name = method.name();
        if name == "get" || name == "is" || name == "set" {
            return Err(ConfigError::InvalidMethodName {
                method: name.to_string(),
            }
            .into());
        }

        let read_stem =
            strip_accessor_prefix(name, "get").or_else(|| strip_accessor_prefix(name, "is"));
        if let Some(stem) = read_stem {
            let field_type = Self::returned(method)?;
            if let FieldType::Entities(_) = field_type {
                return Ok(Some(FieldDescriptor {
                    field_name: None,
                    field_type,
                    relation: RelationKind::ToMany,
                    access: Access::Read,
                }));
            }
            let field = self.derived(stem, &field_type);
            return Ok(Some(self.scalar(field, field_type, Access::Read)));
        }

        if let Some(stem) = strip_accessor_prefix(name, "set") {
            let field_type = Self::single_param(method)?;
            let field = self.derived(stem, &field_type);
            return Ok(Some(self.scalar(field, field_type, Access::Write)));
        }

        Ok(None)
    }
}

// ============================================================================
// ENTITY TYPE REGISTRY
// ============================================================================

/// How the dispatcher serves a method, decided once at declaration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodKind {
    PrimaryKeyAccessor,
    PrimaryKeyMutator,
    Accessor { field: String, field_type: FieldType },
    Mutator { field: String, field_type: FieldType },
    OneToMany { target: String },
    ManyToMany { target: String, through: String },
}

/// A declared entity contract: its name, primary key and method registry.
#[derive(Debug, Clone)]
pub struct EntityType {
    name: String,
    table: Option<String>,
    primary_key: String,
    key_kind: KeyKind,
    methods: HashMap<String, MethodKind>,
    fields: BTreeMap<String, FieldType>,
}

impl EntityType {
    pub fn builder(name: impl Into<String>) -> EntityTypeBuilder {
        EntityTypeBuilder {
            name: name.into(),
            table: None,
            primary_key: DEFAULT_PRIMARY_KEY.to_string(),
            key_kind: KeyKind::Int,
            methods: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table name declared on the type itself, if any.
    pub fn declared_table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn primary_key_field(&self) -> &str {
        &self.primary_key
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key_kind
    }

    pub fn method(&self, name: &str) -> Option<&MethodKind> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Scalar (column-backed) fields declared by accessors and mutators.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldType)> {
        self.fields.iter().map(|(name, ty)| (name.as_str(), ty))
    }

    pub fn field_type(&self, field: &str) -> Option<&FieldType> {
        self.fields.get(field)
    }

    /// Fields on this type that hold a key of `owner`.
    pub fn mapping_fields_to(&self, owner: &str) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(_, ty)| ty.entity_target() == Some(owner))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Collects declarations before freezing them into an [`EntityType`].
#[derive(Debug, Clone)]
pub struct EntityTypeBuilder {
    name: String,
    table: Option<String>,
    primary_key: String,
    key_kind: KeyKind,
    methods: Vec<MethodSignature>,
}

impl EntityTypeBuilder {
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn primary_key(mut self, field: impl Into<String>, kind: KeyKind) -> Self {
        self.primary_key = field.into();
        self.key_kind = kind;
        self
    }

    pub fn primary_key_field(mut self, field: impl Into<String>) -> Self {
        self.primary_key = field.into();
        self
    }

    pub fn method(mut self, method: MethodSignature) -> Self {
        self.methods.push(method);
        self
    }

    /// Describe every declared method and freeze the registry.
    ///
    /// A method the reader cannot place is rejected here rather than at the
    /// first call. Field names equal to the primary key (ignoring case) are
    /// routed to the key slot.
    pub fn build(self, reader: &dyn MetadataReader) -> ActiveRowResult<EntityType> {
        let mut methods = HashMap::with_capacity(self.methods.len());
        let mut fields = BTreeMap::new();

        for signature in &self.methods {
            let descriptor =
                reader
                    .describe(signature)?
                    .ok_or_else(|| ConfigError::Unconfigured {
                        entity_type: self.name.clone(),
                        method: signature.name().to_string(),
                    })?;

            let kind = match (descriptor.relation, descriptor.field_name) {
                (RelationKind::ToMany, _) => MethodKind::OneToMany {
                    target: collection_target(&self.name, signature, &descriptor.field_type)?,
                },
                (RelationKind::ManyToMany { through }, _) => MethodKind::ManyToMany {
                    target: collection_target(&self.name, signature, &descriptor.field_type)?,
                    through,
                },
                (_, Some(field)) if field.eq_ignore_ascii_case(&self.primary_key) => {
                    match descriptor.access {
                        Access::Read => MethodKind::PrimaryKeyAccessor,
                        Access::Write => MethodKind::PrimaryKeyMutator,
                    }
                }
                (_, Some(field)) => {
                    fields.insert(field.clone(), descriptor.field_type.clone());
                    match descriptor.access {
                        Access::Read => MethodKind::Accessor {
                            field,
                            field_type: descriptor.field_type,
                        },
                        Access::Write => MethodKind::Mutator {
                            field,
                            field_type: descriptor.field_type,
                        },
                    }
                }
                (_, None) => {
                    return Err(ConfigError::Unconfigured {
                        entity_type: self.name.clone(),
                        method: signature.name().to_string(),
                    }
                    .into())
                }
            };
            methods.insert(signature.name().to_string(), kind);
        }

        Ok(EntityType {
            name: self.name,
            table: self.table,
            primary_key: self.primary_key,
            key_kind: self.key_kind,
            methods,
            fields,
        })
    }
}

fn collection_target(
    entity: &str,
    signature: &MethodSignature,
    field_type: &FieldType,
) -> ActiveRowResult<String> {
    match field_type {
        FieldType::Entities(target) => Ok(target.clone()),
        other => Err(ConfigError::ArgumentMismatch {
            method: format!("{}.{}", entity, signature.name()),
            expected: "an entity collection".to_string(),
            got: format!("{:?}", other),
        }
        .into()),
    }
}
