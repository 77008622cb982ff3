//! Core service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (HTTP and the document
//! store) into the reconciliation engine. Desktop and server hosts typically
//! enable the `desktop-shims` feature (which depends on `bridge-desktop`) and
//! let [`SyncService::bootstrap`] fall back to the reqwest client and the SQLite
//! store for any bridge the configuration does not inject.
//!
//! There are no process-wide singletons: the host owns the [`SyncService`]
//! returned by `bootstrap` and tears it down with [`SyncService::shutdown`].
//!
//! ```ignore
//! use core_runtime::{config::CoreConfig, logging::{init_logging, LoggingConfig}};
//! use core_service::{EntityRegistry, SyncService};
//! use core_sync::TriggeredBy;
//!
//! init_logging(LoggingConfig::from_env()?)?;
//! let registry = EntityRegistry::load("/etc/portal/entities.json").await?;
//! let service = SyncService::bootstrap(CoreConfig::from_env()?, registry).await?;
//!
//! let outcome = service.trigger("users", TriggeredBy::Scheduled).await?;
//! service.shutdown().await;
//! ```

pub mod error;

pub use error::{CoreError, Result};

use std::path::Path;
use std::sync::Arc;

use bridge_traits::{DocumentStore, HttpClient};
use core_runtime::config::{CoreConfig, SOURCE_SERVICE};
use core_runtime::logging::redact_if_sensitive;
use core_sync::{
    AirtableSource, AuditLogEntry, EntityDefinition, FieldMappingConfig, MappingTableDefinition,
    RateLimitedClient, ReconciliationOrchestrator, SyncError, SyncLease, SyncOutcome, TriggeredBy,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Aggregated handle to the bridge dependencies the core requires.
#[derive(Clone)]
pub struct CoreDependencies {
    pub http_client: Arc<dyn HttpClient>,
    pub document_store: Arc<dyn DocumentStore>,
}

impl CoreDependencies {
    /// Construct a dependency bundle from explicit bridge handles.
    pub fn new(http_client: Arc<dyn HttpClient>, document_store: Arc<dyn DocumentStore>) -> Self {
        Self {
            http_client,
            document_store,
        }
    }

    /// Take injected bridges from the configuration, building desktop
    /// defaults for the rest when available.
    pub async fn resolve(config: &CoreConfig) -> Result<Self> {
        let http_client = match &config.http_client {
            Some(client) => Arc::clone(client),
            None => default_http_client()?,
        };

        let document_store = match &config.document_store {
            Some(store) => Arc::clone(store),
            None => default_document_store(config).await?,
        };

        Ok(Self::new(http_client, document_store))
    }
}

#[cfg(feature = "desktop-shims")]
fn default_http_client() -> Result<Arc<dyn HttpClient>> {
    Ok(Arc::new(bridge_desktop::ReqwestHttpClient::new()?))
}

#[cfg(not(feature = "desktop-shims"))]
fn default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(CoreError::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "Inject an HttpClient or enable the desktop-shims feature.".to_string(),
    })
}

#[cfg(feature = "desktop-shims")]
async fn default_document_store(config: &CoreConfig) -> Result<Arc<dyn DocumentStore>> {
    let path = config
        .database_path
        .as_ref()
        .ok_or_else(|| CoreError::CapabilityMissing {
            capability: "DocumentStore".to_string(),
            message: "Set database_path or inject a DocumentStore implementation.".to_string(),
        })?;
    let store = bridge_desktop::SqliteDocumentStore::new(path).await?;
    info!(path = %path.display(), "Opened SQLite document store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "desktop-shims"))]
async fn default_document_store(_config: &CoreConfig) -> Result<Arc<dyn DocumentStore>> {
    Err(CoreError::CapabilityMissing {
        capability: "DocumentStore".to_string(),
        message: "Inject a DocumentStore or enable the desktop-shims feature.".to_string(),
    })
}

/// Entity types and auxiliary tables the service reconciles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRegistry {
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
    #[serde(default)]
    pub mapping_tables: Vec<MappingTableDefinition>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, definition: EntityDefinition) -> Self {
        self.entities.push(definition);
        self
    }

    pub fn mapping_table(mut self, definition: MappingTableDefinition) -> Self {
        self.mapping_tables.push(definition);
        self
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            CoreError::Registry(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let registry: Self =
            serde_json::from_str(raw).map_err(|e| CoreError::Registry(e.to_string()))?;
        if registry.entities.is_empty() {
            return Err(CoreError::Registry("no entity types defined".to_string()));
        }
        Ok(registry)
    }
}

/// Primary façade exposed to host applications.
#[derive(Clone)]
pub struct SyncService {
    deps: CoreDependencies,
    orchestrator: Arc<ReconciliationOrchestrator>,
}

impl SyncService {
    /// Load the field mapping, resolve bridges, and restore checkpoints left
    /// by interrupted runs.
    #[instrument(skip_all)]
    pub async fn bootstrap(config: CoreConfig, registry: EntityRegistry) -> Result<Self> {
        info!(
            base_url = %config.source.base_url,
            base_id = %config.source.base_id,
            api_token = %redact_if_sensitive("api_token", &config.source.api_token),
            "Bootstrapping sync service"
        );
        let mapping = FieldMappingConfig::load(&config.field_mapping_path).await?;
        let deps = CoreDependencies::resolve(&config).await?;
        let service = Self::new(deps, &config, mapping, registry)?;

        for entity_type in service.entity_types() {
            match service.orchestrator.recover(&entity_type).await {
                Ok(0) => {}
                Ok(restored) => warn!(%entity_type, restored, "Restored interrupted sync checkpoints"),
                Err(SyncError::SyncInProgress { .. }) => {
                    debug!(%entity_type, "Sync running elsewhere, skipping recovery")
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(entity_types = service.orchestrator.entity_types().count(), "Sync service ready");
        Ok(service)
    }

    /// Assemble the service from resolved parts without touching the store
    pub fn new(
        deps: CoreDependencies,
        config: &CoreConfig,
        mapping: FieldMappingConfig,
        registry: EntityRegistry,
    ) -> Result<Self> {
        let client = RateLimitedClient::new(
            Arc::clone(&deps.http_client),
            &config.rate_limits,
            config.retry_policy.clone(),
        );
        let source = AirtableSource::new(
            Arc::new(client),
            SOURCE_SERVICE,
            config.source.base_url.clone(),
            config.source.base_id.clone(),
            config.source.api_token.clone(),
        );

        let mut builder = ReconciliationOrchestrator::builder(
            Arc::clone(&deps.document_store),
            Arc::new(source),
            Arc::new(mapping),
        )
        .lease_duration(config.lease_duration);
        for entity in registry.entities {
            builder = builder.entity(entity);
        }
        for table in registry.mapping_tables {
            builder = builder.mapping_table(table);
        }

        Ok(Self {
            deps,
            orchestrator: Arc::new(builder.build()?),
        })
    }

    /// Run one reconciliation. Lock conflicts surface as
    /// `CoreError::Sync(SyncError::SyncInProgress { .. })`.
    pub async fn trigger(&self, entity_type: &str, triggered_by: TriggeredBy) -> Result<SyncOutcome> {
        Ok(self.orchestrator.run(entity_type, triggered_by).await?)
    }

    /// Most recent audit entries for an entity type, newest first
    pub async fn history(&self, entity_type: &str, limit: usize) -> Result<Vec<AuditLogEntry>> {
        Ok(self.orchestrator.audit_logs().history(entity_type, limit).await?)
    }

    pub async fn lease(&self, entity_type: &str) -> Result<Option<SyncLease>> {
        Ok(self.orchestrator.lease(entity_type).await?)
    }

    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.orchestrator.entity_types().map(str::to_string).collect();
        types.sort();
        types
    }

    /// Release the service's handles. Bridges shared with the host stay
    /// usable through the host's own references.
    pub async fn shutdown(self) {
        let Self { deps, orchestrator } = self;
        drop(orchestrator);
        drop(deps);
        info!("Sync service shut down");
    }
}

#[cfg(all(test, feature = "desktop-shims"))]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_desktop::SqliteDocumentStore;
    use bridge_traits::{HttpRequest, HttpResponse};
    use bytes::Bytes;
    use mockall::mock;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;

    mock! {
        pub HttpClient {}

        #[async_trait]
        impl HttpClient for HttpClient {
            async fn execute(&self, request: HttpRequest) -> bridge_traits::error::Result<HttpResponse>;
        }
    }

    const MAPPING: &str = r#"{
        "users": {
            "username": {"airtable_fields": ["Username"], "required": true, "validation": "lowercase"},
            "role": {"airtable_fields": ["Role"], "allowed_values": ["Admin", "Surveyor"]}
        }
    }"#;

    const REGISTRY: &str = r#"{
        "entities": [
            {"entity_type": "users", "source_table": "Users", "collection": "users",
             "natural_key": "username", "credential_field": "password_hash"}
        ]
    }"#;

    fn mapping_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MAPPING.as_bytes()).unwrap();
        file
    }

    fn users_page() -> HttpResponse {
        let body = json!({"records": [
            {"id": "rec1", "fields": {"Username": "Alice", "Role": "Admin"}},
            {"id": "rec2", "fields": {"Username": "bob", "Role": "Surveyor"}}
        ]});
        HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    async fn config(
        mapping: &tempfile::NamedTempFile,
        http: MockHttpClient,
        store: Arc<dyn DocumentStore>,
    ) -> CoreConfig {
        CoreConfig::builder()
            .field_mapping_path(mapping.path())
            .source_base_id("appTEST")
            .source_api_token("test-token")
            .http_client(Arc::new(http))
            .document_store(store)
            .build()
            .unwrap()
    }

    #[test]
    fn test_registry_requires_entities() {
        assert!(matches!(
            EntityRegistry::from_json_str(r#"{"entities": []}"#),
            Err(CoreError::Registry(_))
        ));

        let registry = EntityRegistry::from_json_str(REGISTRY).unwrap();
        assert_eq!(registry.entities[0].credential_field.as_deref(), Some("password_hash"));
        assert!(registry.mapping_tables.is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_and_trigger() {
        let mapping = mapping_file();
        let mut http = MockHttpClient::new();
        http.expect_execute()
            .withf(|request| request.url.starts_with("https://api.airtable.com/v0/appTEST/Users"))
            .times(1)
            .returning(|_| Ok(users_page()));
        let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::in_memory().await.unwrap());

        let service = SyncService::bootstrap(
            config(&mapping, http, store.clone()).await,
            EntityRegistry::from_json_str(REGISTRY).unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(service.entity_types(), vec!["users".to_string()]);

        let outcome = service.trigger("users", TriggeredBy::Scheduled).await.unwrap();
        assert_eq!(outcome.results.created, 2);
        assert_eq!(outcome.generated_credentials.len(), 2);

        let history = service.history("users", 5).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!service.lease("users").await.unwrap().unwrap().locked);

        service.shutdown().await;
        assert_eq!(store.count("users", &bridge_traits::Filter::all()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_restores_interrupted_run() {
        let mapping = mapping_file();
        let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::in_memory().await.unwrap());
        let mut fields = bridge_traits::Fields::new();
        fields.insert("username".into(), json!("alice"));
        fields.insert("provenance".into(), json!("sync"));
        store
            .insert_many("users_backup_42", vec![bridge_traits::Document::new("u1", fields)])
            .await
            .unwrap();

        SyncService::bootstrap(
            config(&mapping, MockHttpClient::new(), store.clone()).await,
            EntityRegistry::from_json_str(REGISTRY).unwrap(),
        )
        .await
        .unwrap();

        assert!(store.find_one("users", "u1").await.unwrap().is_some());
        assert!(!store.collection_exists("users_backup_42").await.unwrap());
    }

    #[tokio::test]
    async fn test_bootstrap_reports_invalid_mapping() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"users": {"username": {"airtable_fields": []}}}"#).unwrap();
        let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::in_memory().await.unwrap());

        let result = SyncService::bootstrap(
            config(&file, MockHttpClient::new(), store).await,
            EntityRegistry::from_json_str(REGISTRY).unwrap(),
        )
        .await;

        assert!(matches!(
            result,
            Err(CoreError::Sync(SyncError::Config(_)))
        ));
    }
}
