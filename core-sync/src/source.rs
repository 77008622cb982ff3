//! # Record Source
//!
//! Paginated access to the external record API.
//!
//! The source returns pages of `{records, offset?}`; callers follow `offset`
//! until it is absent. [`AirtableSource`] talks to an Airtable-style REST API
//! through the shared [`RateLimitedClient`].

use async_trait::async_trait;
use bridge_traits::http::{HttpMethod, HttpRequest};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::client::{ClientError, RateLimitedClient, Result};

const DEFAULT_PAGE_SIZE: u32 = 100;

/// One row of an external table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl ExternalRecord {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// One page of a table listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordPage {
    #[serde(default)]
    pub records: Vec<ExternalRecord>,
    #[serde(default)]
    pub offset: Option<String>,
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch one page of `table`, continuing from `offset`
    async fn list_page(&self, table: &str, offset: Option<&str>) -> Result<RecordPage>;

    /// Fetch every record of `table`, following pagination to the end
    async fn fetch_all(&self, table: &str) -> Result<Vec<ExternalRecord>> {
        let mut records = Vec::new();
        let mut offset: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self.list_page(table, offset.as_deref()).await?;
            pages += 1;
            records.extend(page.records);

            match page.offset.filter(|next| !next.is_empty()) {
                Some(next) if offset.as_deref() == Some(next.as_str()) => {
                    return Err(ClientError::InvalidResponse {
                        service: table.to_string(),
                        message: format!("pagination offset '{}' repeated", next),
                    });
                }
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        debug!(table, pages, records = records.len(), "Fetched table");
        Ok(records)
    }
}

/// Airtable-style record API reached through the rate-limited client
pub struct AirtableSource {
    client: Arc<RateLimitedClient>,
    service: String,
    base_url: String,
    base_id: String,
    api_token: String,
    page_size: u32,
}

impl std::fmt::Debug for AirtableSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AirtableSource")
            .field("service", &self.service)
            .field("base_url", &self.base_url)
            .field("base_id", &self.base_id)
            .field("api_token", &"[REDACTED]")
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl AirtableSource {
    pub fn new(
        client: Arc<RateLimitedClient>,
        service: impl Into<String>,
        base_url: impl Into<String>,
        base_id: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            service: service.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            base_id: base_id.into(),
            api_token: api_token.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Records per page, clamped to the API's 1..=100 range
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, DEFAULT_PAGE_SIZE);
        self
    }

    fn page_url(&self, table: &str, offset: Option<&str>) -> String {
        let mut url = format!(
            "{}/{}/{}?pageSize={}",
            self.base_url,
            urlencoding::encode(&self.base_id),
            urlencoding::encode(table),
            self.page_size
        );
        if let Some(offset) = offset {
            url.push_str("&offset=");
            url.push_str(&urlencoding::encode(offset));
        }
        url
    }
}

#[async_trait]
impl RecordSource for AirtableSource {
    #[instrument(skip(self), fields(service = %self.service))]
    async fn list_page(&self, table: &str, offset: Option<&str>) -> Result<RecordPage> {
        let request = HttpRequest::new(HttpMethod::Get, self.page_url(table, offset))
            .bearer_token(&self.api_token)
            .header("Accept", "application/json");

        let response = self.client.request(&self.service, request).await?;

        let page: RecordPage = response.json().map_err(|e| ClientError::InvalidResponse {
            service: self.service.clone(),
            message: e.to_string(),
        })?;

        debug!(records = page.records.len(), has_more = page.offset.is_some(), "Fetched page");
        Ok(page)
    }
}
