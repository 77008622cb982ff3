//! # Field Mapper
//!
//! Turns one [`ExternalRecord`] into canonical document fields.
//!
//! For every configured field, in order:
//!
//! 1. Resolve the first candidate column holding a non-blank value
//! 2. Unresolved required fields are errors; unresolved optional fields are skipped
//! 3. Apply the validation (which may transform the value)
//! 4. Check `allowed_values`
//! 5. Apply literal `mapping` substitution
//! 6. Resolve `mapping_table` references
//!
//! Every field is evaluated before the record is judged, so a rejected record
//! reports all of its problems at once.

use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::config::{FieldMappingConfig, FieldSpec, Validation};
use crate::source::ExternalRecord;

/// External record id to canonical value
pub type MappingTable = HashMap<String, Value>;

/// Mapping tables by name
pub type MappingTables = HashMap<String, MappingTable>;

/// Record rejected by the mapper; lists every failing field
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", .errors.join("; "))]
pub struct MappingError {
    pub errors: Vec<String>,
}

/// Canonical fields plus non-fatal observations
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MappedRecord {
    pub fields: Map<String, Value>,
    pub warnings: Vec<String>,
}

/// Required field with no candidate column in the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingField {
    pub field: String,
    pub candidates: Vec<String>,
}

/// Outcome of a schema pre-flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaReport {
    pub entity_type: String,
    pub sampled_records: usize,
    pub missing: Vec<MissingField>,
}

impl SchemaReport {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty()
    }

    /// `field (candidates: A, B)` entries joined for error messages
    pub fn describe_missing(&self) -> String {
        self.missing
            .iter()
            .map(|m| format!("{} (candidates: {})", m.field, m.candidates.join(", ")))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct FieldMapper {
    config: Arc<FieldMappingConfig>,
}

impl FieldMapper {
    pub fn new(config: Arc<FieldMappingConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FieldMappingConfig {
        &self.config
    }

    pub fn map_record(
        &self,
        entity_type: &str,
        record: &ExternalRecord,
        tables: &MappingTables,
    ) -> Result<MappedRecord, MappingError> {
        let Some(mapping) = self.config.entity(entity_type) else {
            return Err(MappingError {
                errors: vec![format!("unknown entity type '{}'", entity_type)],
            });
        };

        let mut mapped = MappedRecord::default();
        let mut errors = Vec::new();

        for (field, spec) in mapping.fields() {
            match map_field(field, spec, record, tables) {
                FieldOutcome::Value(value, warning) => {
                    mapped.fields.insert(field.to_string(), value);
                    mapped.warnings.extend(warning);
                }
                FieldOutcome::Skipped(warning) => mapped.warnings.extend(warning),
                FieldOutcome::Error(message) => errors.push(message),
            }
        }

        if !errors.is_empty() {
            debug!(record_id = %record.id, errors = errors.len(), "Record rejected");
            return Err(MappingError { errors });
        }

        if !mapped.warnings.is_empty() {
            debug!(record_id = %record.id, warnings = ?mapped.warnings, "Record mapped with warnings");
        }

        Ok(mapped)
    }

    /// Verify every required field has at least one candidate among the
    /// columns present in `sample_records`
    pub fn validate_schema(
        &self,
        entity_type: &str,
        sample_records: &[ExternalRecord],
    ) -> SchemaReport {
        let columns: BTreeSet<&str> = sample_records
            .iter()
            .flat_map(|record| record.fields.keys().map(String::as_str))
            .collect();

        let missing = self
            .config
            .entity(entity_type)
            .map(|mapping| {
                mapping
                    .required_fields()
                    .filter(|(_, spec)| {
                        !spec
                            .airtable_fields
                            .iter()
                            .any(|candidate| columns.contains(candidate.as_str()))
                    })
                    .map(|(field, spec)| MissingField {
                        field: field.to_string(),
                        candidates: spec.airtable_fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        SchemaReport {
            entity_type: entity_type.to_string(),
            sampled_records: sample_records.len(),
            missing,
        }
    }
}

enum FieldOutcome {
    Value(Value, Option<String>),
    Skipped(Option<String>),
    Error(String),
}

fn map_field(
    field: &str,
    spec: &FieldSpec,
    record: &ExternalRecord,
    tables: &MappingTables,
) -> FieldOutcome {
    let resolved = spec
        .airtable_fields
        .iter()
        .filter_map(|candidate| record.field(candidate))
        .find(|value| !is_blank(value));

    let Some(raw) = resolved else {
        return if spec.required {
            FieldOutcome::Error(format!(
                "{}: required field missing (tried {})",
                field,
                spec.airtable_fields.join(", ")
            ))
        } else {
            FieldOutcome::Skipped(None)
        };
    };

    let mut value = match spec.validation {
        Some(validation) => match apply_validation(validation, raw) {
            Ok(value) => value,
            Err(reason) => return FieldOutcome::Error(format!("{}: {}", field, reason)),
        },
        None => raw.clone(),
    };

    if let Some(allowed) = &spec.allowed_values {
        let rejected: Vec<String> = elements(&value)
            .filter_map(|element| {
                let key = scalar_key(element)?;
                (!allowed.iter().any(|a| a == &key)).then_some(key)
            })
            .collect();
        if !rejected.is_empty() {
            return FieldOutcome::Error(format!(
                "{}: value(s) {} not in allowed values [{}]",
                field,
                rejected.join(", "),
                allowed.join(", ")
            ));
        }
    }

    if let Some(substitutions) = &spec.mapping {
        value = map_elements(value, |element| {
            scalar_key(&element)
                .and_then(|key| substitutions.get(&key).cloned())
                .unwrap_or(element)
        });
    }

    match &spec.mapping_table {
        Some(table_name) => resolve_reference(field, spec, value, table_name, tables),
        None => FieldOutcome::Value(value, None),
    }
}

fn resolve_reference(
    field: &str,
    spec: &FieldSpec,
    value: Value,
    table_name: &str,
    tables: &MappingTables,
) -> FieldOutcome {
    let Some(table) = tables.get(table_name) else {
        return FieldOutcome::Error(format!(
            "{}: mapping table '{}' not loaded",
            field, table_name
        ));
    };

    match value {
        Value::Array(references) => {
            if let Some(malformed) = references.iter().find(|r| scalar_key(r).is_none()) {
                return FieldOutcome::Error(format!(
                    "{}: reference {} is not a record id",
                    field, malformed
                ));
            }
            let total = references.len();
            let resolved: Vec<Value> = references
                .iter()
                .filter_map(|reference| scalar_key(reference).and_then(|key| table.get(&key)))
                .cloned()
                .collect();

            if resolved.is_empty() {
                if spec.required {
                    return FieldOutcome::Error(format!(
                        "{}: none of {} reference(s) resolved in '{}'",
                        field, total, table_name
                    ));
                }
                return FieldOutcome::Skipped(Some(format!("{}: 0/{} resolved", field, total)));
            }

            let warning = (resolved.len() < total)
                .then(|| format!("{}: {}/{} resolved", field, resolved.len(), total));
            FieldOutcome::Value(Value::Array(resolved), warning)
        }
        scalar => {
            let Some(key) = scalar_key(&scalar) else {
                return FieldOutcome::Error(format!(
                    "{}: reference {} is not a record id",
                    field, scalar
                ));
            };
            match table.get(&key) {
                Some(resolved) => FieldOutcome::Value(resolved.clone(), None),
                None if spec.required => FieldOutcome::Error(format!(
                    "{}: '{}' not found in '{}'",
                    field, key, table_name
                )),
                None => FieldOutcome::Skipped(Some(format!(
                    "{}: '{}' not found in '{}'",
                    field, key, table_name
                ))),
            }
        }
    }
}

/// Null, whitespace-only strings and empty arrays count as absent
pub(crate) fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// String form of a scalar, used for lookups and membership checks
fn scalar_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn elements(value: &Value) -> Box<dyn Iterator<Item = &Value> + '_> {
    match value {
        Value::Array(items) => Box::new(items.iter()),
        other => Box::new(std::iter::once(other)),
    }
}

fn map_elements(value: Value, mut f: impl FnMut(Value) -> Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(f).collect()),
        other => f(other),
    }
}

fn apply_validation(validation: Validation, value: &Value) -> Result<Value, String> {
    match validation {
        Validation::Trim => Ok(map_strings(value.clone(), |s| s.trim().to_string())),
        Validation::Lowercase => Ok(map_strings(value.clone(), |s| s.trim().to_lowercase())),
        Validation::Email => {
            let Value::String(raw) = value else {
                return Err("email must be text".to_string());
            };
            let email = raw.trim().to_lowercase();
            if is_valid_email(&email) {
                Ok(Value::String(email))
            } else {
                Err(format!("'{}' is not a valid email address", email))
            }
        }
        Validation::Numeric => {
            let digits = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                _ => return Err("expected digits".to_string()),
            };
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                Ok(Value::String(digits))
            } else {
                Err(format!("'{}' must contain digits only", digits))
            }
        }
        Validation::CommaList => {
            let items: Vec<Value> = match value {
                Value::String(s) => s
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(|item| Value::String(item.to_string()))
                    .collect(),
                Value::Array(items) => items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) if !s.trim().is_empty() => {
                            Some(Value::String(s.trim().to_string()))
                        }
                        Value::String(_) => None,
                        other => Some(other.clone()),
                    })
                    .collect(),
                _ => return Err("expected a comma-separated list".to_string()),
            };
            if items.is_empty() {
                return Err("list is empty".to_string());
            }
            Ok(Value::Array(items))
        }
        Validation::Boolean => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) if n.as_u64() == Some(1) => Ok(Value::Bool(true)),
            Value::Number(n) if n.as_u64() == Some(0) => Ok(Value::Bool(false)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "0" => Ok(Value::Bool(false)),
                other => Err(format!("'{}' is not a boolean", other)),
            },
            _ => Err("expected a boolean".to_string()),
        },
        Validation::Date => {
            let Value::String(raw) = value else {
                return Err("date must be text".to_string());
            };
            let raw = raw.trim();
            chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .or_else(|| {
                    chrono::DateTime::parse_from_rfc3339(raw)
                        .ok()
                        .map(|dt| dt.date_naive())
                })
                .map(|date| Value::String(date.format("%Y-%m-%d").to_string()))
                .ok_or_else(|| format!("'{}' is not an ISO-8601 date", raw))
        }
    }
}

fn map_strings(value: Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Value::String(f(&s)),
                    other => other,
                })
                .collect(),
        ),
        other => other,
    }
}

fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
}
