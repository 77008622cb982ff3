//! # Directory Reconciliation Engine
//!
//! Pulls authoritative records from an external paginated record API, maps them
//! into canonical documents and reconciles them into a document store.
//!
//! ## Components
//!
//! - **Rate-Limited Client** (`client`): per-service token bucket with retry and backoff
//! - **Record Source** (`source`): paginated table access over the client
//! - **Field Mapping** (`mapping`): declarative field mapping, the record mapper and
//!   cross-table lookup tables
//! - **Sync Lock** (`lock`): lease-based mutual exclusion per entity type
//! - **Sync Transaction** (`transaction`): checkpoint, commit and rollback of one run
//! - **Audit Logger** (`audit`): one persisted entry per run
//! - **Orchestrator** (`orchestrator`): composes the above into a reconciliation run
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_sync::{EntityDefinition, ReconciliationOrchestrator, TriggeredBy};
//!
//! let orchestrator = ReconciliationOrchestrator::builder(store, source, mapping)
//!     .entity(EntityDefinition::new("users", "Users", "users", "username"))
//!     .build()?;
//!
//! let outcome = orchestrator.run("users", TriggeredBy::Scheduled).await?;
//! println!("created {} of {}", outcome.results.created, outcome.total());
//! ```

pub mod audit;
pub mod client;
pub mod credentials;
pub mod error;
pub mod lock;
pub mod mapping;
pub mod orchestrator;
pub mod source;
pub mod transaction;

pub use audit::{
    AuditError, AuditLogEntry, AuditLogRepository, AuditLogger, ResultKind, RunStatus,
    SyncResults, TriggeredBy,
};
pub use client::{ClientError, RateLimitedClient, TokenBucket};
pub use credentials::GeneratedCredential;
pub use error::{Result, SyncError};
pub use lock::{LockState, SyncLease, SyncLock};
pub use mapping::{
    FieldMapper, FieldMappingConfig, MappedRecord, MappingError, MappingTableBuilder,
    MappingTableDefinition, MappingTables, SchemaReport,
};
pub use orchestrator::{
    EntityDefinition, ReconciliationOrchestrator, ReconciliationOrchestratorBuilder, SyncOutcome,
};
pub use source::{AirtableSource, ExternalRecord, RecordPage, RecordSource};
pub use transaction::{SyncTransaction, TransactionMetadata, TransactionState};
