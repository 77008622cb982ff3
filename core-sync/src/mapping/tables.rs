//! Mapping-table builder
//!
//! Fetches auxiliary source tables and turns them into `record id -> value`
//! lookups for cross-table references. Tables needed by one run are fetched
//! concurrently; they all go through the same record source, and therefore the
//! same rate limiter.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::mapper::{is_blank, MappingTable, MappingTables};
use crate::client::Result;
use crate::source::RecordSource;

/// Where a mapping table's values come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingTableDefinition {
    /// Name referenced by `mapping_table` in the field mapping
    pub name: String,
    /// External table to paginate
    pub source_table: String,
    /// Candidate value columns in priority order
    pub value_fields: Vec<String>,
}

impl MappingTableDefinition {
    pub fn new(
        name: impl Into<String>,
        source_table: impl Into<String>,
        value_fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            source_table: source_table.into(),
            value_fields: value_fields.into_iter().map(Into::into).collect(),
        }
    }
}

pub struct MappingTableBuilder {
    source: Arc<dyn RecordSource>,
}

impl MappingTableBuilder {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self { source }
    }

    /// Build one table. Records without any value column are left out.
    #[instrument(skip(self, definition), fields(table = %definition.name))]
    pub async fn build(&self, definition: &MappingTableDefinition) -> Result<MappingTable> {
        let records = self.source.fetch_all(&definition.source_table).await?;
        let fetched = records.len();

        let table: MappingTable = records
            .into_iter()
            .filter_map(|record| {
                let value = definition
                    .value_fields
                    .iter()
                    .filter_map(|field| record.field(field))
                    .find(|value| !is_blank(value))?
                    .clone();
                let value = match value {
                    Value::String(s) => Value::String(s.trim().to_string()),
                    other => other,
                };
                Some((record.id, value))
            })
            .collect();

        debug!(fetched, entries = table.len(), "Mapping table built");
        Ok(table)
    }

    /// Build every table concurrently; the first failure aborts the rest
    pub async fn build_all<'a, I>(&self, definitions: I) -> Result<MappingTables>
    where
        I: IntoIterator<Item = &'a MappingTableDefinition>,
    {
        let definitions: Vec<&MappingTableDefinition> = definitions.into_iter().collect();
        if definitions.is_empty() {
            return Ok(MappingTables::new());
        }

        let tables = try_join_all(definitions.iter().map(|definition| async move {
            let table = self.build(definition).await?;
            Ok::<_, crate::client::ClientError>((definition.name.clone(), table))
        }))
        .await?;

        info!(tables = tables.len(), "Mapping tables ready");
        Ok(tables.into_iter().collect())
    }
}
