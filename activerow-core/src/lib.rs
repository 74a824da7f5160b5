//! ActiveRow Core - Values, Metadata and Errors
//!
//! Pure data types shared by every other crate: column values and primary
//! keys, declared entity metadata, table naming, configuration and the error
//! taxonomy. No storage or caching behavior lives here.

pub mod config;
pub mod error;
pub mod metadata;
pub mod naming;
pub mod value;

pub use config::{ActiveRowConfig, CacheConfig, CacheMode};
pub use error::{ActiveRowError, ActiveRowResult, CacheError, ConfigError, StorageError};
pub use metadata::{
    downcase_first, Access, Annotation, ConventionMetadataReader, EntityType, EntityTypeBuilder,
    FieldDescriptor, FieldType, MetadataReader, MethodKind, MethodSignature, RelationKind,
    DEFAULT_KEY_SUFFIX, DEFAULT_PRIMARY_KEY,
};
pub use naming::{derived_table_name, simple_type_name, NameConverter, PluggableNameConverter};
pub use value::{CacheKey, DbParam, Key, KeyKind, Timestamp, Value};
