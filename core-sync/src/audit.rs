//! # Audit Logger
//!
//! One structured entry per reconciliation run, persisted once at the end of
//! the run in `sync_audit_logs`. Counters and errors accumulate in memory while
//! the run is in flight; nothing is written until [`AuditLogger::log_completion`].

use bridge_traits::store::{Document, DocumentStore, Filter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Result, SyncError};

pub const AUDIT_COLLECTION: &str = "sync_audit_logs";

/// Who started a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    /// Interactive user, by login name
    User(String),
    Scheduled,
    Webhook,
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggeredBy::User(name) => write!(f, "user:{}", name),
            TriggeredBy::Scheduled => write!(f, "scheduled"),
            TriggeredBy::Webhook => write!(f, "webhook"),
        }
    }
}

/// Outcome category of one processed record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    Created,
    Updated,
    Deleted,
    Skipped,
    Failed,
}

/// Per-run record counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResults {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl SyncResults {
    pub fn increment(&mut self, kind: ResultKind) {
        match kind {
            ResultKind::Created => self.created += 1,
            ResultKind::Updated => self.updated += 1,
            ResultKind::Deleted => self.deleted += 1,
            ResultKind::Skipped => self.skipped += 1,
            ResultKind::Failed => self.failed += 1,
        }
    }

    /// Source records accounted for. Deletions don't come from the source.
    pub fn total(&self) -> u64 {
        self.created + self.updated + self.skipped + self.failed
    }
}

/// Final status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Persisted summary of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub sync_id: String,
    pub entity_type: String,
    pub triggered_by: TriggeredBy,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub results: SyncResults,
    pub errors: Vec<AuditError>,
}

impl AuditLogEntry {
    fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self).map_err(bridge_traits::BridgeError::from)? {
            Value::Object(fields) => Ok(Document::new(self.sync_id.clone(), fields)),
            _ => Err(SyncError::InvalidDocument {
                id: self.sync_id.clone(),
                reason: "audit entry did not serialize to an object".to_string(),
            }),
        }
    }

    fn from_document(document: Document) -> Result<Self> {
        serde_json::from_value(Value::Object(document.fields)).map_err(|e| {
            SyncError::InvalidDocument {
                id: document.id,
                reason: e.to_string(),
            }
        })
    }
}

/// In-flight audit record for one run
pub struct AuditLogger {
    store: Arc<dyn DocumentStore>,
    sync_id: String,
    entity_type: String,
    triggered_by: TriggeredBy,
    start_time: DateTime<Utc>,
    results: SyncResults,
    errors: Vec<AuditError>,
    logged: bool,
}

impl AuditLogger {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        entity_type: impl Into<String>,
        triggered_by: TriggeredBy,
    ) -> Self {
        let start_time = store.now();
        Self {
            store,
            sync_id: Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            triggered_by,
            start_time,
            results: SyncResults::default(),
            errors: Vec::new(),
            logged: false,
        }
    }

    pub fn sync_id(&self) -> &str {
        &self.sync_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn results(&self) -> SyncResults {
        self.results
    }

    pub fn errors(&self) -> &[AuditError] {
        &self.errors
    }

    pub fn increment_result(&mut self, kind: ResultKind) {
        self.results.increment(kind);
    }

    pub fn add_error(&mut self, message: impl Into<String>, record_id: Option<&str>) {
        self.errors.push(AuditError {
            message: message.into(),
            record_id: record_id.map(str::to_string),
            timestamp: self.store.now(),
        });
    }

    /// Finalize and persist the entry
    ///
    /// # Errors
    ///
    /// [`SyncError::AuditAlreadyLogged`] if the entry was already written.
    pub async fn log_completion(&mut self, status: RunStatus) -> Result<AuditLogEntry> {
        if self.logged {
            return Err(SyncError::AuditAlreadyLogged {
                sync_id: self.sync_id.clone(),
            });
        }

        let end_time = self.store.now();
        let entry = AuditLogEntry {
            sync_id: self.sync_id.clone(),
            entity_type: self.entity_type.clone(),
            triggered_by: self.triggered_by.clone(),
            start_time: self.start_time,
            end_time,
            duration_ms: (end_time - self.start_time).num_milliseconds(),
            status,
            results: self.results,
            errors: self.errors.clone(),
        };

        self.store
            .insert_many(AUDIT_COLLECTION, vec![entry.to_document()?])
            .await?;
        self.logged = true;

        let r = &entry.results;
        if status == RunStatus::Failed {
            warn!(
                sync_id = %entry.sync_id,
                entity_type = %entry.entity_type,
                triggered_by = %entry.triggered_by,
                errors = entry.errors.len(),
                "Sync run failed"
            );
        } else {
            info!(
                sync_id = %entry.sync_id,
                entity_type = %entry.entity_type,
                triggered_by = %entry.triggered_by,
                status = %status,
                created = r.created,
                updated = r.updated,
                deleted = r.deleted,
                skipped = r.skipped,
                failed = r.failed,
                duration_ms = entry.duration_ms,
                "Sync run completed"
            );
        }

        Ok(entry)
    }
}

/// Read access to persisted audit entries
pub struct AuditLogRepository {
    store: Arc<dyn DocumentStore>,
}

impl AuditLogRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Most recent runs for an entity type, newest first
    pub async fn history(&self, entity_type: &str, limit: usize) -> Result<Vec<AuditLogEntry>> {
        let documents = self
            .store
            .find(AUDIT_COLLECTION, &Filter::all().eq("entity_type", entity_type))
            .await?;

        let mut entries = documents
            .into_iter()
            .map(AuditLogEntry::from_document)
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        entries.truncate(limit);
        Ok(entries)
    }

    pub async fn find_by_sync_id(&self, sync_id: &str) -> Result<Option<AuditLogEntry>> {
        self.store
            .find_one(AUDIT_COLLECTION, sync_id)
            .await?
            .map(AuditLogEntry::from_document)
            .transpose()
    }
}
