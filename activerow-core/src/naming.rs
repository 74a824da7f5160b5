//! Table name derivation.
//!
//! Precedence, highest first: an explicit class mapping registered on the
//! converter, a table name declared on the entity type, then the derived name
//! (simple type name with its leading character lower-cased) rewritten by the
//! first matching pattern mapping.

use std::collections::HashMap;

use regex::Regex;

use crate::error::{ActiveRowResult, ConfigError};
use crate::metadata::{downcase_first, EntityType};

/// Maps an entity type to the table that stores it.
pub trait NameConverter: Send + Sync {
    fn table_name(&self, entity: &EntityType) -> String;
}

/// Simple type name: the last segment of a `::` or `.` separated path.
pub fn simple_type_name(name: &str) -> &str {
    name.rsplit([':', '.']).next().unwrap_or(name)
}

/// Default derivation: simple type name with its leading character lowered.
pub fn derived_table_name(type_name: &str) -> String {
    downcase_first(simple_type_name(type_name))
}

#[derive(Debug, Clone)]
struct PatternMapping {
    pattern: Regex,
    replacement: String,
}

/// Name converter with class and pattern overrides.
///
/// Pattern example: `"(.+)y"` with result `"{1}ies"` maps `company` to
/// `companies`. Patterns must match the whole derived name.
#[derive(Debug, Clone, Default)]
pub struct PluggableNameConverter {
    class_mappings: HashMap<String, String>,
    patterns: Vec<PatternMapping>,
}

impl PluggableNameConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class_mapping(&mut self, type_name: impl Into<String>, table: impl Into<String>) {
        self.class_mappings.insert(type_name.into(), table.into());
    }

    pub fn add_class_mappings<I, K, V>(&mut self, mappings: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (type_name, table) in mappings {
            self.add_class_mapping(type_name, table);
        }
    }

    /// Register a pattern mapping. Patterns are tried in registration order.
    pub fn add_pattern_mapping(&mut self, pattern: &str, result: &str) -> ActiveRowResult<()> {
        let anchored = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
            ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.patterns.push(PatternMapping {
            pattern: anchored,
            replacement: to_regex_replacement(result),
        });
        Ok(())
    }

    pub fn add_pattern_mappings<'a, I>(&mut self, mappings: I) -> ActiveRowResult<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (pattern, result) in mappings {
            self.add_pattern_mapping(pattern, result)?;
        }
        Ok(())
    }

    fn apply_patterns(&self, name: String) -> String {
        for mapping in &self.patterns {
            if mapping.pattern.is_match(&name) {
                return mapping
                    .pattern
                    .replace(&name, mapping.replacement.as_str())
                    .into_owned();
            }
        }
        name
    }
}

impl NameConverter for PluggableNameConverter {
    fn table_name(&self, entity: &EntityType) -> String {
        if let Some(table) = self.class_mappings.get(entity.name()) {
            return table.clone();
        }
        if let Some(table) = entity.declared_table() {
            return table.to_string();
        }
        self.apply_patterns(derived_table_name(entity.name()))
    }
}

/// Translate `{1}` style group references into the regex crate's `${1}`,
/// escaping any literal `$`.
fn to_regex_replacement(result: &str) -> String {
    let mut out = String::with_capacity(result.len() + 4);
    let mut chars = result.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '{' if chars.peek().is_some_and(char::is_ascii_digit) => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    digits.push(d);
                    chars.next();
                }
                if chars.peek() == Some(&'}') {
                    chars.next();
                    out.push_str("${");
                    out.push_str(&digits);
                    out.push('}');
                } else {
                    out.push('{');
                    out.push_str(&digits);
                }
            }
            other => out.push(other),
        }
    }
    out
}
