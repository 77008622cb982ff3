//! Integration tests for configuration with injected bridges

use std::sync::Arc;

use bridge_desktop::SqliteDocumentStore;
use bridge_traits::DocumentStore;
use core_runtime::config::{CoreConfig, SOURCE_SERVICE};
use core_runtime::logging::{redact_if_sensitive, LogLevel, LoggingConfig};

#[tokio::test]
async fn test_injected_store_replaces_database_path() {
    let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::in_memory().await.unwrap());

    let config = CoreConfig::builder()
        .field_mapping_path("config/field_mapping.json")
        .source_base_id("appBase")
        .source_api_token("key")
        .document_store(store)
        .build()
        .unwrap();

    assert!(config.database_path.is_none());
    assert!(config.document_store.is_some());
    assert_eq!(config.rate_limit_for(SOURCE_SERVICE), Some(5));

    let rendered = format!("{:?}", config);
    assert!(rendered.contains("DocumentStore { ... }"));
}

#[test]
fn test_missing_mapping_path_fails_fast() {
    let err = CoreConfig::builder()
        .database_path("directory.db")
        .source_base_id("appBase")
        .source_api_token("key")
        .build()
        .unwrap_err();

    assert!(err.to_string().contains("SYNC_FIELD_MAPPING_PATH"));
}

#[test]
fn test_logging_config_from_env_defaults() {
    let config = LoggingConfig::from_lookup(|_| None).unwrap();
    assert_eq!(config.level, LogLevel::Info);
    assert!(config.filter.is_none());
}

#[test]
fn test_secret_fields_never_leak() {
    assert_eq!(redact_if_sensitive("SYNC_SOURCE_API_TOKEN", "patXYZ"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("generated_secret", "hunter2"), "[REDACTED]");
}
