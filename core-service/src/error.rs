use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Capability missing: {capability} - {message}")]
    CapabilityMissing { capability: String, message: String },

    #[error("Invalid entity registry: {0}")]
    Registry(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] core_sync::SyncError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] bridge_traits::BridgeError),
}

impl From<core_sync::mapping::ConfigError> for CoreError {
    fn from(err: core_sync::mapping::ConfigError) -> Self {
        CoreError::Sync(err.into())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
