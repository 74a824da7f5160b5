//! Configuration types

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ActiveRowResult, ConfigError};
use crate::metadata::{
    ConventionMetadataReader, EntityType, EntityTypeBuilder, DEFAULT_KEY_SUFFIX,
    DEFAULT_PRIMARY_KEY,
};
use crate::naming::PluggableNameConverter;

/// Which cache layer each entity gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Process-local field cache only.
    #[default]
    Ram,
    /// Local dirty overlay in front of a shared remote cache.
    Shadowed,
}

/// Per-entity field cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub mode: CacheMode,
    /// Prefix for every remote key, ahead of table and primary key.
    pub namespace: String,
    /// Expiry for remote entries, serialised in whole seconds.
    #[serde(with = "duration_secs")]
    pub expiry: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Ram,
            namespace: "activerow.".to_string(),
            expiry: Duration::from_secs(3600),
        }
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveRowConfig {
    /// Appended to the field name of to-one relations (`company` -> `companyID`).
    pub relation_key_suffix: String,
    /// Primary key field used by entity types that do not declare one.
    pub primary_key_field: String,
    /// Explicit entity type -> table overrides.
    pub table_mappings: BTreeMap<String, String>,
    /// Ordered `(pattern, result)` rewrites applied to derived table names.
    pub pattern_mappings: Vec<(String, String)>,
    pub cache: CacheConfig,
}

impl Default for ActiveRowConfig {
    fn default() -> Self {
        Self {
            relation_key_suffix: DEFAULT_KEY_SUFFIX.to_string(),
            primary_key_field: DEFAULT_PRIMARY_KEY.to_string(),
            table_mappings: BTreeMap::new(),
            pattern_mappings: Vec::new(),
            cache: CacheConfig::default(),
        }
    }
}

impl ActiveRowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> ActiveRowResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_relation_key_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.relation_key_suffix = suffix.into();
        self
    }

    pub fn with_table_mapping(mut self, type_name: impl Into<String>, table: impl Into<String>) -> Self {
        self.table_mappings.insert(type_name.into(), table.into());
        self
    }

    pub fn with_pattern_mapping(mut self, pattern: impl Into<String>, result: impl Into<String>) -> Self {
        self.pattern_mappings.push((pattern.into(), result.into()));
        self
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache.mode = mode;
        self
    }

    pub fn with_cache_expiry(mut self, expiry: Duration) -> Self {
        self.cache.expiry = expiry;
        self
    }

    pub fn validate(&self) -> ActiveRowResult<()> {
        if self.primary_key_field.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "primary_key_field".to_string(),
                value: self.primary_key_field.clone(),
                reason: "must not be empty".to_string(),
            }
            .into());
        }
        if self.cache.mode == CacheMode::Shadowed && self.cache.expiry.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "cache.expiry".to_string(),
                value: "0".to_string(),
                reason: "shadowed caches need a non-zero expiry".to_string(),
            }
            .into());
        }
        for (type_name, table) in &self.table_mappings {
            if table.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("table_mappings.{}", type_name),
                    value: table.clone(),
                    reason: "must not be empty".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Start declaring an entity type with the configured primary key field.
    pub fn entity(&self, name: impl Into<String>) -> EntityTypeBuilder {
        EntityType::builder(name).primary_key_field(self.primary_key_field.clone())
    }

    pub fn metadata_reader(&self) -> ConventionMetadataReader {
        ConventionMetadataReader::new(self.relation_key_suffix.clone())
    }

    pub fn name_converter(&self) -> ActiveRowResult<PluggableNameConverter> {
        let mut converter = PluggableNameConverter::new();
        converter.add_class_mappings(self.table_mappings.clone());
        converter.add_pattern_mappings(
            self.pattern_mappings
                .iter()
                .map(|(pattern, result)| (pattern.as_str(), result.as_str())),
        )?;
        Ok(converter)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FieldType, MetadataReader, MethodKind, MethodSignature};
    use crate::naming::NameConverter;

    #[test]
    fn test_defaults() {
        let config = ActiveRowConfig::default();
        assert_eq!(config.relation_key_suffix, "ID");
        assert_eq!(config.primary_key_field, "id");
        assert_eq!(config.cache.mode, CacheMode::Ram);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = ActiveRowConfig::from_toml_str(
            r#"
            relation_key_suffix = "_id"
            pattern_mappings = [["(.+)y", "{1}ies"]]

            [table_mappings]
            Person = "people"

            [cache]
            mode = "shadowed"
            namespace = "app."
            expiry = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.relation_key_suffix, "_id");
        assert_eq!(config.cache.mode, CacheMode::Shadowed);
        assert_eq!(config.cache.expiry, Duration::from_secs(120));
        assert_eq!(config.cache.namespace, "app.");

        let converter = config.name_converter().unwrap();
        let reader = config.metadata_reader();
        let company = EntityType::builder("Company").build(&reader).unwrap();
        let person = EntityType::builder("Person").build(&reader).unwrap();
        assert_eq!(converter.table_name(&company), "companies");
        assert_eq!(converter.table_name(&person), "people");

        let desc = reader
            .describe(&MethodSignature::accessor(
                "getCompany",
                FieldType::Entity("Company".into()),
            ))
            .unwrap()
            .unwrap();
        assert_eq!(desc.field_name.as_deref(), Some("company_id"));
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let err = ActiveRowConfig::from_toml_str("relation_key_suffix = [").unwrap_err();
        assert!(matches!(
            err,
            crate::ActiveRowError::Config(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_shadow_expiry() {
        let config = ActiveRowConfig::new()
            .with_cache_mode(CacheMode::Shadowed)
            .with_cache_expiry(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_entity_uses_configured_primary_key() {
        let config = ActiveRowConfig {
            primary_key_field: "code".to_string(),
            ..ActiveRowConfig::default()
        };
        let entity = config
            .entity("Country")
            .method(MethodSignature::accessor("getCode", FieldType::Text))
            .build(&config.metadata_reader())
            .unwrap();
        assert_eq!(entity.primary_key_field(), "code");
        assert_eq!(entity.method("getCode"), Some(&MethodKind::PrimaryKeyAccessor));
    }

    #[test]
    fn test_builder_methods() {
        let config = ActiveRowConfig::new()
            .with_relation_key_suffix("Key")
            .with_table_mapping("Person", "people")
            .with_pattern_mapping("(.+)", "{1}s");
        assert_eq!(config.relation_key_suffix, "Key");
        assert_eq!(config.table_mappings.get("Person").map(String::as_str), Some("people"));
        assert_eq!(config.pattern_mappings.len(), 1);
    }
}
