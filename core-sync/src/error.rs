use bridge_traits::BridgeError;
use thiserror::Error;

use crate::client::ClientError;
use crate::mapping::ConfigError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync already in progress for {entity_type}")]
    SyncInProgress { entity_type: String },

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Unknown mapping table: {0}")]
    UnknownMappingTable(String),

    #[error("Source request failed: {0}")]
    Client(#[from] ClientError),

    #[error("Field mapping configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source schema drift for {entity_type}: missing {missing}")]
    SchemaDrift {
        entity_type: String,
        missing: String,
    },

    #[error("Consistency violation: {failed} record(s) failed")]
    ConsistencyViolation { failed: u64 },

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Audit log {sync_id} was already persisted")]
    AuditAlreadyLogged { sync_id: String },

    #[error("Invalid document {id}: {reason}")]
    InvalidDocument { id: String, reason: String },

    #[error("Credential generation failed: {0}")]
    Credential(String),

    #[error("Store error: {0}")]
    Store(#[from] BridgeError),
}

impl SyncError {
    /// A held lock, as opposed to a failed run
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::SyncInProgress { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
