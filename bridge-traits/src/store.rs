//! Document Store Abstraction
//!
//! A keyed collection store holding JSON documents. The reconciliation core
//! needs only a narrow surface from it:
//!
//! - an atomic conditional upsert (lease acquisition)
//! - bulk insert, replace and delete-by-filter
//! - collection existence checks, listing and drop
//!
//! No multi-document transactions are assumed. Callers that need all-or-nothing
//! behaviour build it on top (checkpoint and rollback).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Field map of a document body
pub type Fields = serde_json::Map<String, Value>;

/// A stored document: a string key plus a JSON object body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.fields.get(field).and_then(Value::as_i64)
    }
}

/// Conjunction of top-level field equality conditions
///
/// An empty filter matches every document in the collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    /// Filter matching every document
    pub fn all() -> Self {
        Self::default()
    }

    /// Add a `field == value` condition
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }
}

/// A single predicate on an existing document's top-level field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldCheck {
    /// `field == value`
    Equals(String, Value),
    /// Numeric `field < value`
    LessThan(String, i64),
}

/// Guard applied by [`DocumentStore::conditional_upsert`]
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertCondition {
    /// Insert or overwrite unconditionally
    Always,
    /// Insert when no document has the id; overwrite an existing document only
    /// if at least one of the checks holds for it
    ExistingMatchesAny(Vec<FieldCheck>),
}

/// Keyed JSON document store
///
/// ## Atomicity
///
/// `conditional_upsert` must be a single compare-and-set at the storage layer.
/// Implementing it as a read followed by a write reintroduces the race where two
/// callers both observe the same state and both win.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::store::{DocumentStore, Filter};
///
/// async fn synced_users(store: &dyn DocumentStore) -> Result<usize> {
///     let docs = store.find("users", &Filter::all().eq("provenance", "sync")).await?;
///     Ok(docs.len())
/// }
/// ```
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Current time according to the store
    fn now(&self) -> DateTime<Utc>;

    /// Whether the collection has been created
    async fn collection_exists(&self, collection: &str) -> Result<bool>;

    /// Names of existing collections starting with `prefix`
    async fn list_collections(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove a collection and all of its documents. Missing collections are ignored.
    async fn drop_collection(&self, collection: &str) -> Result<()>;

    /// Insert new documents, creating the collection if needed.
    ///
    /// # Errors
    ///
    /// Fails if any id already exists; no document of the batch is written then.
    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<u64>;

    /// All documents matching the filter
    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>>;

    /// Document by id
    async fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Overwrite an existing document. Returns `false` when the id is unknown.
    async fn replace_one(&self, collection: &str, document: &Document) -> Result<bool>;

    /// Delete a document by id. Returns `false` when the id is unknown.
    async fn delete_one(&self, collection: &str, id: &str) -> Result<bool>;

    /// Delete all documents matching the filter, returning the count removed
    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Number of documents matching the filter
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Atomically insert or overwrite `document` subject to `condition`.
    ///
    /// Returns `true` when the write happened.
    async fn conditional_upsert(
        &self,
        collection: &str,
        document: &Document,
        condition: &UpsertCondition,
    ) -> Result<bool>;
}
