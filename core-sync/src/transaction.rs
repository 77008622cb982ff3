//! # Sync Transaction
//!
//! Checkpoint/commit/rollback around one reconciliation run. The document store
//! offers no multi-document transactions, so all-or-nothing behaviour is built
//! from a throwaway backup of the synced documents.
//!
//! ## State Machine
//!
//! ```text
//! NoCheckpoint ──create_checkpoint──> Checkpointed ──commit───> Committed
//!      │                                   └────────rollback──> RolledBack
//!      └──commit / rollback (bootstrap run, nothing to back up)
//! ```
//!
//! Only documents carrying the provenance tag are backed up, restored or
//! deleted. Manually created documents in the same collection are never touched.

use bridge_traits::store::{Document, DocumentStore, Filter};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::audit::SyncResults;
use crate::{Result, SyncError};

pub const PROVENANCE_FIELD: &str = "provenance";
pub const PROVENANCE_SYNC: &str = "sync";

/// Filter selecting machine-managed documents
pub fn provenance_filter() -> Filter {
    Filter::all().eq(PROVENANCE_FIELD, PROVENANCE_SYNC)
}

/// Deterministic backup collection name for a run
pub fn backup_collection_name(collection: &str, run_started_at: DateTime<Utc>) -> String {
    format!("{}{}", backup_prefix(collection), run_started_at.timestamp_millis())
}

fn backup_prefix(collection: &str) -> String {
    format!("{}_backup_", collection)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NoCheckpoint,
    Checkpointed,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::NoCheckpoint => "no_checkpoint",
            TransactionState::Checkpointed => "checkpointed",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifies the run a transaction belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMetadata {
    pub sync_id: String,
    pub entity_type: String,
    pub started_at: DateTime<Utc>,
}

pub struct SyncTransaction {
    store: Arc<dyn DocumentStore>,
    collection: String,
    backup_collection: String,
    state: TransactionState,
}

impl SyncTransaction {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        metadata: &TransactionMetadata,
    ) -> Self {
        let collection = collection.into();
        let backup_collection = backup_collection_name(&collection, metadata.started_at);
        Self {
            store,
            collection,
            backup_collection,
            state: TransactionState::NoCheckpoint,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn backup_collection(&self) -> &str {
        &self.backup_collection
    }

    /// Wrap `sync_fn` in checkpoint, validation and commit or rollback
    ///
    /// A nonzero `failed` counter in the returned results is treated as a
    /// failure of the whole run. Rollback completes before the error is
    /// returned; a panic in `sync_fn` is rolled back and then resumed.
    #[instrument(skip(store, metadata, sync_fn), fields(sync_id = %metadata.sync_id))]
    pub async fn execute<F, Fut>(
        store: Arc<dyn DocumentStore>,
        collection: &str,
        metadata: &TransactionMetadata,
        sync_fn: F,
    ) -> Result<SyncResults>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SyncResults>>,
    {
        let mut transaction = SyncTransaction::new(store, collection, metadata);
        transaction.create_checkpoint().await?;

        let outcome = AssertUnwindSafe(sync_fn()).catch_unwind().await;

        let failure = match &outcome {
            Ok(Ok(results)) if results.failed == 0 => None,
            Ok(Ok(results)) => Some(format!("{} record(s) failed", results.failed)),
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("sync panicked".to_string()),
        };

        match failure {
            None => transaction.commit().await?,
            Some(reason) => {
                warn!(%reason, "Rolling back sync run");
                if let Err(e) = transaction.rollback().await {
                    error!(error = %e, backup = %transaction.backup_collection, "Rollback failed");
                    return Err(e);
                }
            }
        }

        match outcome {
            Ok(Ok(results)) if results.failed > 0 => Err(SyncError::ConsistencyViolation {
                failed: results.failed,
            }),
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Copy every synced document of the target into the backup
    ///
    /// A missing collection, or one without synced documents, leaves the
    /// transaction in `NoCheckpoint`.
    pub async fn create_checkpoint(&mut self) -> Result<u64> {
        self.validate_transition(TransactionState::Checkpointed)?;

        if !self.store.collection_exists(&self.collection).await? {
            info!(collection = %self.collection, "No collection yet, skipping checkpoint");
            return Ok(0);
        }

        let documents = self
            .store
            .find(&self.collection, &provenance_filter())
            .await?;
        if documents.is_empty() {
            info!(collection = %self.collection, "No synced documents, skipping checkpoint");
            return Ok(0);
        }

        let copied = self
            .store
            .insert_many(&self.backup_collection, documents)
            .await?;
        self.state = TransactionState::Checkpointed;

        info!(
            collection = %self.collection,
            backup = %self.backup_collection,
            documents = copied,
            "Checkpoint created"
        );
        Ok(copied)
    }

    /// Keep the run's writes and discard the backup
    pub async fn commit(&mut self) -> Result<()> {
        self.validate_transition(TransactionState::Committed)?;

        if self.state == TransactionState::Checkpointed {
            self.store.drop_collection(&self.backup_collection).await?;
        }
        self.state = TransactionState::Committed;

        info!(collection = %self.collection, "Sync transaction committed");
        Ok(())
    }

    /// Restore the target to its checkpointed state
    ///
    /// Returns the number of documents restored.
    pub async fn rollback(&mut self) -> Result<u64> {
        self.validate_transition(TransactionState::RolledBack)?;

        let backup = if self.state == TransactionState::Checkpointed {
            Some(self.backup_collection.as_str())
        } else {
            None
        };
        let restored = restore(self.store.as_ref(), &self.collection, backup).await?;
        self.state = TransactionState::RolledBack;

        info!(collection = %self.collection, restored, "Sync transaction rolled back");
        Ok(restored)
    }

    /// Restore and drop backups left behind by runs that never finished
    ///
    /// Must run under the entity's lease: a backup owned by a live run would
    /// otherwise be mistaken for a stale one. When several backups survive, the
    /// oldest one holds the last known-good state.
    #[instrument(skip(store))]
    pub async fn recover_stale_checkpoints(
        store: &dyn DocumentStore,
        collection: &str,
    ) -> Result<usize> {
        let prefix = backup_prefix(collection);
        let mut backups: Vec<(i64, String)> = store
            .list_collections(&prefix)
            .await?
            .into_iter()
            .filter_map(|name| {
                let millis = name.strip_prefix(&prefix)?.parse::<i64>().ok()?;
                Some((millis, name))
            })
            .collect();

        if backups.is_empty() {
            return Ok(0);
        }
        backups.sort();

        let (_, oldest) = &backups[0];
        warn!(backup = %oldest, "Restoring checkpoint left by an interrupted run");
        restore(store, collection, Some(oldest)).await?;

        for (_, name) in &backups[1..] {
            store.drop_collection(name).await?;
        }
        Ok(backups.len())
    }

    fn validate_transition(&self, to: TransactionState) -> Result<()> {
        let valid = matches!(
            (self.state, to),
            (TransactionState::NoCheckpoint, TransactionState::Checkpointed)
                | (TransactionState::NoCheckpoint, TransactionState::Committed)
                | (TransactionState::NoCheckpoint, TransactionState::RolledBack)
                | (TransactionState::Checkpointed, TransactionState::Committed)
                | (TransactionState::Checkpointed, TransactionState::RolledBack)
        );

        if !valid {
            let reason = if self.state.is_terminal() {
                format!("Transaction already {}", self.state)
            } else {
                format!("Cannot transition from {} to {}", self.state, to)
            };
            return Err(SyncError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
                reason,
            });
        }
        Ok(())
    }
}

/// Replace the synced documents of `collection` with the content of `backup`
/// and drop it. Without a backup the synced documents are simply removed.
async fn restore(store: &dyn DocumentStore, collection: &str, backup: Option<&str>) -> Result<u64> {
    let removed = store.delete_many(collection, &provenance_filter()).await?;

    let Some(backup) = backup else {
        return Ok(0);
    };

    let documents: Vec<Document> = store.find(backup, &Filter::all()).await?;
    let restored = if documents.is_empty() {
        0
    } else {
        store.insert_many(collection, documents).await?
    };
    store.drop_collection(backup).await?;

    info!(collection, removed, restored, "Synced documents restored from backup");
    Ok(restored)
}
