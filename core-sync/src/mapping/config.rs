//! Declarative field mapping configuration
//!
//! Loaded once at startup from JSON shaped as
//!
//! ```json
//! {
//!   "users": {
//!     "username": { "airtable_fields": ["Username", "Login"], "required": true, "validation": "lowercase" },
//!     "roles":    { "airtable_fields": ["Roles"], "validation": "comma_list", "allowed_values": ["admin", "surveyor"] }
//!   }
//! }
//! ```
//!
//! Field order within an entity is preserved and is the order the mapper
//! evaluates fields in.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("Invalid field mapping JSON: {0}")]
    Parse(String),

    #[error("Entity '{0}' must map to an object of field specifications")]
    NotAnObject(String),

    #[error("Entity '{0}' has no fields")]
    EmptyEntity(String),

    #[error("{entity}.{field}: {message}")]
    InvalidField {
        entity: String,
        field: String,
        message: String,
    },

    #[error("{entity}.{field}: airtable_fields must list at least one non-blank candidate")]
    EmptyCandidates { entity: String, field: String },

    #[error("{entity}.{field}: candidate '{candidate}' listed more than once")]
    DuplicateCandidate {
        entity: String,
        field: String,
        candidate: String,
    },

    #[error("{entity}.{field}: unknown mapping table '{table}'")]
    UnknownMappingTable {
        entity: String,
        field: String,
        table: String,
    },
}

/// Transform-and-check applied to a resolved value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validation {
    /// Strip surrounding whitespace
    Trim,
    /// Trim, then lowercase
    Lowercase,
    /// Trim, lowercase and require an address shape
    Email,
    /// Digits only after trimming
    Numeric,
    /// Split on commas into a list of trimmed, non-empty strings
    CommaList,
    /// Booleans or "true"/"false"/"yes"/"no"/"1"/"0"
    Boolean,
    /// ISO-8601 calendar date, normalized to `YYYY-MM-DD`
    Date,
}

/// How one canonical field is derived from a source record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    /// Candidate source columns in priority order
    pub airtable_fields: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub validation: Option<Validation>,
    #[serde(default)]
    pub allowed_values: Option<Vec<String>>,
    /// Literal value substitution
    #[serde(default)]
    pub mapping: Option<Map<String, Value>>,
    /// Cross-table reference resolved through a mapping table
    #[serde(default)]
    pub mapping_table: Option<String>,
}

/// Ordered field specifications of one entity type
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMapping {
    fields: Vec<(String, FieldSpec)>,
}

impl EntityMapping {
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, spec)| spec)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields().filter(|(_, spec)| spec.required)
    }

    /// Mapping tables referenced by any field, deduplicated in first-use order
    pub fn referenced_tables(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.fields
            .iter()
            .filter_map(|(_, spec)| spec.mapping_table.as_deref())
            .filter(|table| seen.insert(*table))
            .collect()
    }
}

/// Field mapping for every entity type
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldMappingConfig {
    entities: HashMap<String, EntityMapping>,
}

impl FieldMappingConfig {
    /// Read and validate the configuration file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let Value::Object(entities) = value else {
            return Err(ConfigError::Parse(
                "top level must be an object keyed by entity type".to_string(),
            ));
        };

        let mut parsed = HashMap::with_capacity(entities.len());
        for (entity, fields) in entities {
            let Value::Object(fields) = fields else {
                return Err(ConfigError::NotAnObject(entity));
            };

            let mut specs = Vec::with_capacity(fields.len());
            for (field, raw_spec) in fields {
                let spec: FieldSpec =
                    serde_json::from_value(raw_spec).map_err(|e| ConfigError::InvalidField {
                        entity: entity.clone(),
                        field: field.clone(),
                        message: e.to_string(),
                    })?;
                specs.push((field, spec));
            }

            parsed.insert(entity, EntityMapping { fields: specs });
        }

        let config = Self { entities: parsed };
        config.validate()?;
        Ok(config)
    }

    pub fn entity(&self, entity_type: &str) -> Option<&EntityMapping> {
        self.entities.get(entity_type)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Structural checks that need nothing but the configuration itself
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (entity, mapping) in &self.entities {
            if mapping.fields.is_empty() {
                return Err(ConfigError::EmptyEntity(entity.clone()));
            }

            for (field, spec) in &mapping.fields {
                if spec.airtable_fields.is_empty()
                    || spec.airtable_fields.iter().any(|c| c.trim().is_empty())
                {
                    return Err(ConfigError::EmptyCandidates {
                        entity: entity.clone(),
                        field: field.clone(),
                    });
                }

                let mut seen = HashSet::new();
                if let Some(duplicate) = spec
                    .airtable_fields
                    .iter()
                    .find(|candidate| !seen.insert(candidate.as_str()))
                {
                    return Err(ConfigError::DuplicateCandidate {
                        entity: entity.clone(),
                        field: field.clone(),
                        candidate: duplicate.clone(),
                    });
                }

                if let Some(table) = &spec.mapping_table {
                    if table.trim().is_empty() {
                        return Err(ConfigError::InvalidField {
                            entity: entity.clone(),
                            field: field.clone(),
                            message: "mapping_table cannot be blank".to_string(),
                        });
                    }
                }

                if matches!(&spec.allowed_values, Some(values) if values.is_empty()) {
                    return Err(ConfigError::InvalidField {
                        entity: entity.clone(),
                        field: field.clone(),
                        message: "allowed_values cannot be empty".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Check every `mapping_table` reference against the registered tables
    pub fn validate_tables<'a, I>(&self, known_tables: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let known: HashSet<&str> = known_tables.into_iter().collect();

        for (entity, mapping) in &self.entities {
            for (field, spec) in &mapping.fields {
                if let Some(table) = &spec.mapping_table {
                    if !known.contains(table.as_str()) {
                        return Err(ConfigError::UnknownMappingTable {
                            entity: entity.clone(),
                            field: field.clone(),
                            table: table.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }
}
