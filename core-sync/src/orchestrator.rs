//! # Reconciliation Orchestrator
//!
//! Composes the engine into one run per entity type:
//!
//! ```text
//! lock ─> recover stale checkpoints ─> checkpoint ─> mapping tables ─> fetch
//!      ─> schema pre-flight ─> map + classify ─> create / update ─> delete
//!      ─> commit or rollback ─> audit entry ─> unlock
//! ```
//!
//! Source records are matched to stored documents by a natural key. Only
//! documents tagged with the sync provenance are updated or deleted; a manual
//! document sharing a natural key with a source record is left alone and the
//! record is skipped.

use bridge_traits::store::{Document, DocumentStore, Fields, Filter};
use chrono::SecondsFormat;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditLogRepository, AuditLogger, ResultKind, RunStatus, SyncResults, TriggeredBy};
use crate::credentials::{generate_secret, hash_secret, GeneratedCredential};
use crate::lock::{SyncLease, SyncLock};
use crate::mapping::mapper::is_blank;
use crate::mapping::{
    ConfigError, FieldMapper, FieldMappingConfig, FieldSpec, MappingTableBuilder,
    MappingTableDefinition,
};
use crate::source::{ExternalRecord, RecordSource};
use crate::transaction::{SyncTransaction, TransactionMetadata, PROVENANCE_FIELD, PROVENANCE_SYNC};
use crate::{Result, SyncError};

const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(600);
const SYNC_ACTOR: &str = "sync";

/// How one entity type's source table lands in the document store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub entity_type: String,
    pub source_table: String,
    pub collection: String,
    /// Canonical field identifying a document across runs
    pub natural_key: String,
    /// Canonical field that receives a hashed secret when a document is created
    #[serde(default)]
    pub credential_field: Option<String>,
}

impl EntityDefinition {
    pub fn new(
        entity_type: impl Into<String>,
        source_table: impl Into<String>,
        collection: impl Into<String>,
        natural_key: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            source_table: source_table.into(),
            collection: collection.into(),
            natural_key: natural_key.into(),
            credential_field: None,
        }
    }

    pub fn with_credential_field(mut self, field: impl Into<String>) -> Self {
        self.credential_field = Some(field.into());
        self
    }
}

/// What a run reports back to its trigger
///
/// `generated_credentials` holds plaintext secrets. Hand them to the user and
/// drop them; never log them.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub sync_id: String,
    pub entity_type: String,
    pub status: RunStatus,
    pub results: SyncResults,
    pub generated_credentials: Vec<GeneratedCredential>,
}

impl SyncOutcome {
    /// Source records accounted for by the run
    pub fn total(&self) -> u64 {
        self.results.total()
    }
}

pub struct ReconciliationOrchestratorBuilder {
    store: Arc<dyn DocumentStore>,
    source: Arc<dyn RecordSource>,
    config: Arc<FieldMappingConfig>,
    lease_duration: Duration,
    entities: Vec<EntityDefinition>,
    mapping_tables: Vec<MappingTableDefinition>,
}

impl ReconciliationOrchestratorBuilder {
    pub fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn entity(mut self, definition: EntityDefinition) -> Self {
        self.entities.push(definition);
        self
    }

    pub fn mapping_table(mut self, definition: MappingTableDefinition) -> Self {
        self.mapping_tables.push(definition);
        self
    }

    /// Cross-check the registrations against the field mapping
    ///
    /// # Errors
    ///
    /// - [`SyncError::UnknownEntityType`] for an entity with no field mapping
    /// - [`SyncError::Config`] for an unknown natural key or mapping table
    pub fn build(self) -> Result<ReconciliationOrchestrator> {
        self.config
            .validate_tables(self.mapping_tables.iter().map(|t| t.name.as_str()))?;

        for definition in &self.entities {
            let mapping = self
                .config
                .entity(&definition.entity_type)
                .ok_or_else(|| SyncError::UnknownEntityType(definition.entity_type.clone()))?;

            if mapping.field(&definition.natural_key).is_none() {
                return Err(ConfigError::InvalidField {
                    entity: definition.entity_type.clone(),
                    field: definition.natural_key.clone(),
                    message: "natural key is not a mapped field".to_string(),
                }
                .into());
            }
        }

        Ok(ReconciliationOrchestrator {
            lock: SyncLock::new(self.store.clone(), self.lease_duration),
            audit_logs: AuditLogRepository::new(self.store.clone()),
            mapper: FieldMapper::new(self.config),
            store: self.store,
            source: self.source,
            entities: self
                .entities
                .into_iter()
                .map(|d| (d.entity_type.clone(), d))
                .collect(),
            mapping_tables: self
                .mapping_tables
                .into_iter()
                .map(|t| (t.name.clone(), t))
                .collect(),
        })
    }
}

pub struct ReconciliationOrchestrator {
    store: Arc<dyn DocumentStore>,
    source: Arc<dyn RecordSource>,
    mapper: FieldMapper,
    lock: SyncLock,
    audit_logs: AuditLogRepository,
    entities: HashMap<String, EntityDefinition>,
    mapping_tables: HashMap<String, MappingTableDefinition>,
}

impl ReconciliationOrchestrator {
    pub fn builder(
        store: Arc<dyn DocumentStore>,
        source: Arc<dyn RecordSource>,
        config: Arc<FieldMappingConfig>,
    ) -> ReconciliationOrchestratorBuilder {
        ReconciliationOrchestratorBuilder {
            store,
            source,
            config,
            lease_duration: DEFAULT_LEASE_DURATION,
            entities: Vec::new(),
            mapping_tables: Vec::new(),
        }
    }

    pub fn entity(&self, entity_type: &str) -> Option<&EntityDefinition> {
        self.entities.get(entity_type)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn audit_logs(&self) -> &AuditLogRepository {
        &self.audit_logs
    }

    pub async fn lease(&self, entity_type: &str) -> Result<Option<SyncLease>> {
        self.lock.lease(entity_type).await
    }

    /// Restore checkpoints left by interrupted runs of `entity_type`
    ///
    /// Takes the lease, so a run in progress elsewhere yields
    /// [`SyncError::SyncInProgress`] instead of having its backup restored.
    pub async fn recover(&self, entity_type: &str) -> Result<usize> {
        let definition = self
            .entities
            .get(entity_type)
            .ok_or_else(|| SyncError::UnknownEntityType(entity_type.to_string()))?;

        self.lock
            .execute_with_lock(entity_type, "recovery", || {
                SyncTransaction::recover_stale_checkpoints(self.store.as_ref(), &definition.collection)
            })
            .await
    }

    /// Reconcile one entity type
    ///
    /// # Errors
    ///
    /// - [`SyncError::SyncInProgress`] when another run holds the lease; the
    ///   target collection is not touched and no audit entry is written
    /// - the run's own error otherwise, after rollback and after its audit
    ///   entry has been written
    #[instrument(skip(self, triggered_by), fields(triggered_by = %triggered_by))]
    pub async fn run(&self, entity_type: &str, triggered_by: TriggeredBy) -> Result<SyncOutcome> {
        let definition = self
            .entities
            .get(entity_type)
            .ok_or_else(|| SyncError::UnknownEntityType(entity_type.to_string()))?;

        let owner = triggered_by.to_string();
        self.lock
            .execute_with_lock(entity_type, &owner, || self.run_locked(definition, triggered_by))
            .await
    }

    async fn run_locked(
        &self,
        definition: &EntityDefinition,
        triggered_by: TriggeredBy,
    ) -> Result<SyncOutcome> {
        let mut audit = AuditLogger::new(
            self.store.clone(),
            definition.entity_type.clone(),
            triggered_by,
        );
        let metadata = TransactionMetadata {
            sync_id: audit.sync_id().to_string(),
            entity_type: definition.entity_type.clone(),
            started_at: audit.start_time(),
        };
        let mut credentials = Vec::new();
        let (audit_ref, credentials_ref) = (&mut audit, &mut credentials);

        info!(sync_id = %metadata.sync_id, entity_type = %definition.entity_type, "Sync run started");

        let run = async {
            match SyncTransaction::recover_stale_checkpoints(self.store.as_ref(), &definition.collection)
                .await
            {
                Ok(_) => {
                    SyncTransaction::execute(
                        self.store.clone(),
                        &definition.collection,
                        &metadata,
                        || async move { self.apply(definition, audit_ref, credentials_ref).await },
                    )
                    .await
                }
                Err(e) => Err(e),
            }
        };
        let unwound = AssertUnwindSafe(run).catch_unwind().await;

        let result = match unwound {
            Ok(result) => result,
            Err(panic) => {
                // The transaction has already rolled back; record the run before unwinding further.
                audit.add_error("sync panicked".to_string(), None);
                if let Err(e) = audit.log_completion(RunStatus::Failed).await {
                    error!(sync_id = %metadata.sync_id, error = %e, "Failed to persist audit log");
                }
                std::panic::resume_unwind(panic);
            }
        };

        let status = match &result {
            Ok(_) if audit.errors().is_empty() => RunStatus::Success,
            Ok(_) => RunStatus::Partial,
            Err(e) => {
                audit.add_error(e.to_string(), None);
                RunStatus::Failed
            }
        };

        if let Err(e) = audit.log_completion(status).await {
            error!(sync_id = %metadata.sync_id, error = %e, "Failed to persist audit log");
        }

        let results = result?;
        Ok(SyncOutcome {
            sync_id: metadata.sync_id,
            entity_type: definition.entity_type.clone(),
            status,
            results,
            generated_credentials: credentials,
        })
    }

    /// Fetch, map, classify and write. Runs inside the checkpoint.
    async fn apply(
        &self,
        definition: &EntityDefinition,
        audit: &mut AuditLogger,
        credentials: &mut Vec<GeneratedCredential>,
    ) -> Result<SyncResults> {
        let entity_type = definition.entity_type.as_str();
        let mapping = self
            .mapper
            .config()
            .entity(entity_type)
            .ok_or_else(|| SyncError::UnknownEntityType(entity_type.to_string()))?;
        let key_spec = mapping.field(&definition.natural_key).ok_or_else(|| {
            SyncError::Config(ConfigError::InvalidField {
                entity: entity_type.to_string(),
                field: definition.natural_key.clone(),
                message: "natural key is not a mapped field".to_string(),
            })
        })?;

        let table_definitions = mapping
            .referenced_tables()
            .into_iter()
            .map(|name| {
                self.mapping_tables
                    .get(name)
                    .ok_or_else(|| SyncError::UnknownMappingTable(name.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let tables = MappingTableBuilder::new(self.source.clone())
            .build_all(table_definitions)
            .await?;

        let records = self.source.fetch_all(&definition.source_table).await?;
        info!(records = records.len(), "Fetched source records");

        if !records.is_empty() {
            let report = self.mapper.validate_schema(entity_type, &records);
            if !report.is_ok() {
                return Err(SyncError::SchemaDrift {
                    entity_type: entity_type.to_string(),
                    missing: report.describe_missing(),
                });
            }
        }

        // Manual documents are tracked by key only; they are never written.
        let mut synced: HashMap<String, Document> = HashMap::new();
        let mut manual: HashSet<String> = HashSet::new();
        let mut duplicates = Vec::new();
        for document in self
            .store
            .find(&definition.collection, &Filter::all())
            .await?
        {
            let Some(key) = document.get(&definition.natural_key).and_then(key_string) else {
                continue;
            };
            if !is_synced(&document) {
                manual.insert(key);
            } else if let Some(previous) = synced.get(&key) {
                warn!(natural_key = %key, kept = %previous.id, duplicate = %document.id, "Duplicate synced documents");
                duplicates.push(document);
            } else {
                synced.insert(key, document);
            }
        }

        let mut seen = HashSet::new();
        for record in &records {
            if raw_natural_key(record, key_spec).is_none() {
                audit.increment_result(ResultKind::Skipped);
                audit.add_error(
                    format!("{}: natural key missing", definition.natural_key),
                    Some(record.id.as_str()),
                );
                continue;
            }

            let mapped = match self.mapper.map_record(entity_type, record, &tables) {
                Ok(mapped) => mapped,
                Err(e) => {
                    audit.increment_result(ResultKind::Failed);
                    audit.add_error(e.to_string(), Some(record.id.as_str()));
                    continue;
                }
            };
            if !mapped.warnings.is_empty() {
                warn!(record_id = %record.id, warnings = ?mapped.warnings, "Record mapped with warnings");
            }

            let Some(key) = mapped.fields.get(&definition.natural_key).and_then(key_string) else {
                audit.increment_result(ResultKind::Failed);
                audit.add_error(
                    format!("{}: natural key did not map to a scalar", definition.natural_key),
                    Some(record.id.as_str()),
                );
                continue;
            };

            if !seen.insert(key.clone()) {
                audit.increment_result(ResultKind::Skipped);
                audit.add_error(format!("duplicate natural key '{}'", key), Some(record.id.as_str()));
                continue;
            }

            if manual.contains(&key) {
                audit.increment_result(ResultKind::Skipped);
                audit.add_error(format!("'{}' is managed manually", key), Some(record.id.as_str()));
                continue;
            }

            match synced.get(&key) {
                None => {
                    let document = self.new_document(definition, &key, mapped.fields, credentials)?;
                    self.store
                        .insert_many(&definition.collection, vec![document])
                        .await?;
                    audit.increment_result(ResultKind::Created);
                }
                Some(current) => {
                    let managed = mapping.fields().map(|(field, _)| field);
                    match self.updated_document(current, managed, &mapped.fields) {
                        Some(document) => {
                            self.store
                                .replace_one(&definition.collection, &document)
                                .await?;
                            audit.increment_result(ResultKind::Updated);
                        }
                        None => audit.increment_result(ResultKind::Skipped),
                    }
                }
            }
        }

        for document in &duplicates {
            self.store
                .delete_one(&definition.collection, &document.id)
                .await?;
            audit.increment_result(ResultKind::Deleted);
        }

        for (key, document) in &synced {
            if !seen.contains(key) {
                self.store
                    .delete_one(&definition.collection, &document.id)
                    .await?;
                audit.increment_result(ResultKind::Deleted);
                debug!(natural_key = %key, "Deleted document absent from source");
            }
        }

        Ok(audit.results())
    }

    fn new_document(
        &self,
        definition: &EntityDefinition,
        key: &str,
        mut fields: Fields,
        credentials: &mut Vec<GeneratedCredential>,
    ) -> Result<Document> {
        let now = self.timestamp();
        fields.insert(PROVENANCE_FIELD.into(), PROVENANCE_SYNC.into());
        fields.insert("created_by".into(), SYNC_ACTOR.into());
        fields.insert("updated_by".into(), SYNC_ACTOR.into());
        fields.insert("created_at".into(), now.clone().into());
        fields.insert("updated_at".into(), now.into());

        if let Some(credential_field) = &definition.credential_field {
            let secret = generate_secret();
            fields.insert(credential_field.clone(), hash_secret(&secret)?.into());
            credentials.push(GeneratedCredential {
                entity_type: definition.entity_type.clone(),
                natural_key: key.to_string(),
                secret,
            });
        }

        Ok(Document::new(Uuid::new_v4().to_string(), fields))
    }

    /// The rewritten document, or `None` when no managed field changed
    fn updated_document<'a>(
        &self,
        current: &Document,
        managed: impl Iterator<Item = &'a str>,
        mapped: &Fields,
    ) -> Option<Document> {
        let mut fields = current.fields.clone();
        let mut changed = false;

        for field in managed {
            match mapped.get(field) {
                Some(value) if current.get(field) != Some(value) => {
                    fields.insert(field.to_string(), value.clone());
                    changed = true;
                }
                None if current.get(field).is_some() => {
                    fields.remove(field);
                    changed = true;
                }
                _ => {}
            }
        }

        if !changed {
            return None;
        }

        fields.insert("updated_by".into(), SYNC_ACTOR.into());
        fields.insert("updated_at".into(), self.timestamp().into());
        Some(Document::new(current.id.clone(), fields))
    }

    fn timestamp(&self) -> String {
        self.store.now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

fn is_synced(document: &Document) -> bool {
    document.get_str(PROVENANCE_FIELD) == Some(PROVENANCE_SYNC)
}

fn raw_natural_key<'a>(record: &'a ExternalRecord, spec: &FieldSpec) -> Option<&'a Value> {
    spec.airtable_fields
        .iter()
        .filter_map(|candidate| record.field(candidate))
        .find(|value| !is_blank(value))
}

fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::{record, StaticSource};
    use bridge_desktop::SqliteDocumentStore;
    use serde_json::json;

    fn config() -> Arc<FieldMappingConfig> {
        Arc::new(
            FieldMappingConfig::from_value(json!({
                "users": {
                    "username": {"airtable_fields": ["Username", "Login"], "required": true, "validation": "lowercase"},
                    "email": {"airtable_fields": ["Email", "email"], "validation": "email"},
                    "role": {
                        "airtable_fields": ["Role"],
                        "required": true,
                        "allowed_values": ["Admin", "Surveyor"],
                        "mapping": {"Admin": "admin", "Surveyor": "surveyor"}
                    },
                    "region": {"airtable_fields": ["Region"], "mapping_table": "regions"}
                }
            }))
            .unwrap(),
        )
    }

    fn source(users: Vec<ExternalRecord>) -> Arc<StaticSource> {
        Arc::new(
            StaticSource::new(2)
                .with_table("Users", users)
                .with_table("Regions", vec![record("recR1", json!({"Code": "NORTH"}))]),
        )
    }

    async fn orchestrator(
        store: Arc<dyn DocumentStore>,
        users: Vec<ExternalRecord>,
    ) -> ReconciliationOrchestrator {
        ReconciliationOrchestrator::builder(store, source(users), config())
            .entity(
                EntityDefinition::new("users", "Users", "users", "username")
                    .with_credential_field("password_hash"),
            )
            .mapping_table(MappingTableDefinition::new("regions", "Regions", ["Code"]))
            .build()
            .unwrap()
    }

    async fn store() -> Arc<dyn DocumentStore> {
        Arc::new(SqliteDocumentStore::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_build_rejects_unknown_mapping_table() {
        let result = ReconciliationOrchestrator::builder(store().await, source(vec![]), config())
            .entity(EntityDefinition::new("users", "Users", "users", "username"))
            .build();

        assert!(matches!(
            result,
            Err(SyncError::Config(ConfigError::UnknownMappingTable { .. }))
        ));
    }

    #[tokio::test]
    async fn test_build_rejects_unmapped_natural_key() {
        let result = ReconciliationOrchestrator::builder(store().await, source(vec![]), config())
            .entity(EntityDefinition::new("users", "Users", "users", "login_name"))
            .mapping_table(MappingTableDefinition::new("regions", "Regions", ["Code"]))
            .build();

        assert!(matches!(
            result,
            Err(SyncError::Config(ConfigError::InvalidField { .. }))
        ));
    }

    #[tokio::test]
    async fn test_first_run_creates_tagged_documents_with_hashed_secret() {
        let store = store().await;
        let orchestrator = orchestrator(
            store.clone(),
            vec![
                record("rec1", json!({"Username": "Alice", "Role": "Admin", "Region": ["recR1"]})),
                record("rec2", json!({"Login": "bob", "Role": "Surveyor", "email": "Bob@Example.com"})),
            ],
        )
        .await;

        let outcome = orchestrator.run("users", TriggeredBy::Scheduled).await.unwrap();

        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.results.created, 2);
        assert_eq!(outcome.total(), 2);
        assert_eq!(outcome.generated_credentials.len(), 2);

        let alice = store
            .find("users", &Filter::all().eq("username", "alice"))
            .await
            .unwrap()
            .remove(0);
        assert_eq!(alice.get_str("provenance"), Some("sync"));
        assert_eq!(alice.get_str("created_by"), Some("sync"));
        assert_eq!(alice.get_str("role"), Some("admin"));
        assert_eq!(alice.get("region"), Some(&json!(["NORTH"])));

        let secret = outcome
            .generated_credentials
            .iter()
            .find(|c| c.natural_key == "alice")
            .unwrap();
        let hash = alice.get_str("password_hash").unwrap();
        assert_ne!(hash, secret.secret);
        assert!(crate::credentials::verify_secret(&secret.secret, hash).unwrap());
    }

    #[tokio::test]
    async fn test_rerun_updates_changed_skips_unchanged_and_deletes_missing() {
        let store = store().await;
        orchestrator(
            store.clone(),
            vec![
                record("rec1", json!({"Username": "alice", "Role": "Admin"})),
                record("rec2", json!({"Username": "bob", "Role": "Surveyor"})),
                record("rec3", json!({"Username": "carol", "Role": "Surveyor"})),
            ],
        )
        .await
        .run("users", TriggeredBy::Scheduled)
        .await
        .unwrap();

        let outcome = orchestrator(
            store.clone(),
            vec![
                record("rec1", json!({"Username": "alice", "Role": "Surveyor"})),
                record("rec2", json!({"Username": "bob", "Role": "Surveyor"})),
            ],
        )
        .await
        .run("users", TriggeredBy::User("admin".into()))
        .await
        .unwrap();

        assert_eq!(outcome.results.updated, 1);
        assert_eq!(outcome.results.skipped, 1);
        assert_eq!(outcome.results.deleted, 1);
        assert!(outcome.generated_credentials.is_empty());
        assert_eq!(store.count("users", &Filter::all()).await.unwrap(), 2);

        let alice = store
            .find("users", &Filter::all().eq("username", "alice"))
            .await
            .unwrap()
            .remove(0);
        assert_eq!(alice.get_str("role"), Some("surveyor"));
        assert!(alice.get_str("password_hash").is_some());
    }

    #[tokio::test]
    async fn test_missing_key_and_manual_conflict_are_skipped() {
        let store = store().await;
        let mut manual = Fields::new();
        manual.insert("username".into(), json!("root"));
        store
            .insert_many("users", vec![Document::new("manual-1", manual.clone())])
            .await
            .unwrap();

        let outcome = orchestrator(
            store.clone(),
            vec![
                record("rec1", json!({"Username": "alice", "Role": "Admin"})),
                record("rec2", json!({"Username": "  ", "Role": "Admin"})),
                record("rec3", json!({"Username": "root", "Role": "Admin"})),
            ],
        )
        .await
        .run("users", TriggeredBy::Webhook)
        .await
        .unwrap();

        assert_eq!(outcome.status, RunStatus::Partial);
        assert_eq!(outcome.results.created, 1);
        assert_eq!(outcome.results.skipped, 2);
        assert_eq!(outcome.total(), 3);

        let untouched = store.find_one("users", "manual-1").await.unwrap().unwrap();
        assert_eq!(untouched.fields, manual);

        let entry = orchestrator(store.clone(), vec![])
            .await
            .audit_logs()
            .find_by_sync_id(&outcome.sync_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, RunStatus::Partial);
        assert_eq!(entry.errors.len(), 2);
    }

    fn synced_user(username: &str, role: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("username".into(), json!(username));
        fields.insert("role".into(), json!(role));
        fields.insert(PROVENANCE_FIELD.into(), json!(PROVENANCE_SYNC));
        fields
    }

    #[tokio::test]
    async fn test_manual_document_shadows_synced_document_with_same_key() {
        let store = store().await;
        let mut manual = Fields::new();
        manual.insert("username".into(), json!("root"));
        store
            .insert_many(
                "users",
                vec![
                    Document::new("manual-1", manual.clone()),
                    Document::new("synced-1", synced_user("root", "admin")),
                ],
            )
            .await
            .unwrap();

        let outcome = orchestrator(
            store.clone(),
            vec![record("rec1", json!({"Username": "root", "Role": "Surveyor"}))],
        )
        .await
        .run("users", TriggeredBy::Scheduled)
        .await
        .unwrap();

        assert_eq!(outcome.status, RunStatus::Partial);
        assert_eq!(outcome.results.skipped, 1);
        assert_eq!(outcome.results.deleted, 0);
        assert_eq!(
            store.find_one("users", "manual-1").await.unwrap().unwrap().fields,
            manual
        );
        let synced = store.find_one("users", "synced-1").await.unwrap().unwrap();
        assert_eq!(synced.get_str("role"), Some("admin"));

        let outcome = orchestrator(store.clone(), vec![record("rec2", json!({"Username": "alice", "Role": "Admin"}))])
            .await
            .run("users", TriggeredBy::Scheduled)
            .await
            .unwrap();

        assert_eq!(outcome.results.deleted, 1);
        assert!(store.find_one("users", "synced-1").await.unwrap().is_none());
        assert!(store.find_one("users", "manual-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_synced_documents_collapse_to_one() {
        let store = store().await;
        store
            .insert_many(
                "users",
                vec![
                    Document::new("synced-1", synced_user("alice", "admin")),
                    Document::new("synced-2", synced_user("alice", "admin")),
                ],
            )
            .await
            .unwrap();

        let outcome = orchestrator(
            store.clone(),
            vec![record("rec1", json!({"Username": "alice", "Role": "Admin"}))],
        )
        .await
        .run("users", TriggeredBy::Scheduled)
        .await
        .unwrap();

        assert_eq!(outcome.results.deleted, 1);
        assert_eq!(
            store
                .count("users", &Filter::all().eq("username", "alice"))
                .await
                .unwrap(),
            1
        );
    }

    struct PanickingSource;

    #[async_trait::async_trait]
    impl RecordSource for PanickingSource {
        async fn list_page(
            &self,
            _table: &str,
            _offset: Option<&str>,
        ) -> crate::client::Result<crate::source::RecordPage> {
            panic!("source exploded");
        }
    }

    #[tokio::test]
    async fn test_panicking_run_is_audited_and_releases_lease() {
        let store = store().await;
        let orchestrator = Arc::new(
            ReconciliationOrchestrator::builder(store.clone(), Arc::new(PanickingSource), config())
                .entity(EntityDefinition::new("users", "Users", "users", "username"))
                .mapping_table(MappingTableDefinition::new("regions", "Regions", ["Code"]))
                .build()
                .unwrap(),
        );

        let task = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run("users", TriggeredBy::Scheduled).await })
        };
        let joined = task.await;
        assert!(joined.unwrap_err().is_panic());

        let history = orchestrator.audit_logs().history("users", 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Failed);
        assert!(history[0].errors.iter().any(|e| e.message == "sync panicked"));
        assert!(orchestrator.lease("users").await.unwrap().map_or(true, |l| !l.locked));
    }

    #[tokio::test]
    async fn test_unknown_entity_type() {
        let orchestrator = orchestrator(store().await, vec![]).await;
        let result = orchestrator.run("vessels", TriggeredBy::Scheduled).await;
        assert!(matches!(result, Err(SyncError::UnknownEntityType(_))));
    }

    #[test]
    fn test_key_string_accepts_scalars_only() {
        assert_eq!(key_string(&json!("alice")), Some("alice".to_string()));
        assert_eq!(key_string(&json!(42)), Some("42".to_string()));
        assert_eq!(key_string(&json!(" ")), None);
        assert_eq!(key_string(&json!(["alice"])), None);
        assert_eq!(key_string(&Value::Null), None);
    }
}
