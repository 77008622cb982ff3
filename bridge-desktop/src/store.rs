//! Document Store using SQLite
//!
//! Documents live in a single `documents` table keyed by `(collection, id)` with
//! the body stored as JSON text. Filters and upsert guards are compiled to
//! `json_type`/`json_extract` expressions so every predicate is evaluated by
//! SQLite inside the statement that uses it.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    store::{Document, DocumentStore, FieldCheck, Fields, Filter, UpsertCondition},
    time::{Clock, SystemClock},
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS collections (
        name TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        body TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (collection, id)
    )
    "#,
];

fn db_err(context: &str, error: sqlx::Error) -> BridgeError {
    BridgeError::DatabaseError(format!("{}: {}", context, error))
}

/// SQLite-backed document store implementation
///
/// Provides:
/// - Atomic conditional upserts via `INSERT .. ON CONFLICT DO UPDATE .. WHERE`
/// - All-or-nothing batch inserts
/// - WAL journaling for file-backed databases
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteDocumentStore {
    /// Open (or create) a file-backed store
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(BridgeError::Io)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| db_err("Failed to open database", e))?;

        info!(path = ?db_path, "Opened document store");
        Self::from_pool(pool).await
    }

    /// Create an in-memory store (for testing)
    ///
    /// The pool is pinned to a single connection that never expires; an
    /// in-memory SQLite database disappears with its last connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| db_err("Failed to open in-memory database", e))?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema if needed
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| db_err("Failed to create schema", e))?;
        }

        debug!("Document store schema ready");

        Ok(Self {
            pool,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Close all pooled connections
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn ensure_collection<'e, E>(&self, executor: E, collection: &str) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        sqlx::query("INSERT OR IGNORE INTO collections (name, created_at) VALUES (?, ?)")
            .bind(collection)
            .bind(self.clock.unix_timestamp_millis())
            .execute(executor)
            .await
            .map_err(|e| db_err("Failed to create collection", e))?;
        Ok(())
    }

    fn encode_body(fields: &Fields) -> Result<String> {
        Ok(serde_json::to_string(fields)?)
    }

    fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
        let id: String = row
            .try_get("id")
            .map_err(|e| db_err("Failed to read document id", e))?;
        let body: String = row
            .try_get("body")
            .map_err(|e| db_err("Failed to read document body", e))?;
        let fields: Fields = serde_json::from_str(&body)?;
        Ok(Document { id, fields })
    }
}

/// JSON path addressing a top-level field
fn json_path(field: &str) -> Result<String> {
    if field.is_empty() || field.contains('"') {
        return Err(BridgeError::OperationFailed(format!(
            "Unsupported field name: {:?}",
            field
        )));
    }
    Ok(format!("$.\"{}\"", field))
}

/// Append a predicate that holds when `column`'s `field` equals `value`.
///
/// A missing field compares equal to JSON `null`.
fn push_equals(
    qb: &mut QueryBuilder<'_, Sqlite>,
    column: &str,
    field: &str,
    value: &Value,
) -> Result<()> {
    let path = json_path(field)?;

    match value {
        Value::Null => {
            qb.push(format!("(json_type({}, ", column));
            qb.push_bind(path.clone());
            qb.push(format!(") IS NULL OR json_type({}, ", column));
            qb.push_bind(path);
            qb.push(") = 'null')");
        }
        Value::Bool(flag) => {
            qb.push(format!("json_type({}, ", column));
            qb.push_bind(path);
            qb.push(if *flag { ") = 'true'" } else { ") = 'false'" });
        }
        Value::String(text) => {
            qb.push(format!("(json_type({}, ", column));
            qb.push_bind(path.clone());
            qb.push(format!(") = 'text' AND json_extract({}, ", column));
            qb.push_bind(path);
            qb.push(") = ");
            qb.push_bind(text.clone());
            qb.push(")");
        }
        Value::Number(number) => {
            qb.push(format!("json_extract({}, ", column));
            qb.push_bind(path);
            qb.push(") = ");
            if let Some(int) = number.as_i64() {
                qb.push_bind(int);
            } else if let Some(float) = number.as_f64() {
                qb.push_bind(float);
            } else {
                return Err(BridgeError::OperationFailed(format!(
                    "Unsupported numeric filter value for {}",
                    field
                )));
            }
        }
        Value::Array(_) | Value::Object(_) => {
            return Err(BridgeError::OperationFailed(format!(
                "Filter on {} must use a scalar value",
                field
            )));
        }
    }

    Ok(())
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &Filter) -> Result<()> {
    for (field, value) in filter.conditions() {
        qb.push(" AND ");
        push_equals(qb, "body", field, value)?;
    }
    Ok(())
}

fn push_check(qb: &mut QueryBuilder<'_, Sqlite>, check: &FieldCheck) -> Result<()> {
    match check {
        FieldCheck::Equals(field, value) => push_equals(qb, "documents.body", field, value),
        FieldCheck::LessThan(field, bound) => {
            let path = json_path(field)?;
            qb.push("(json_type(documents.body, ");
            qb.push_bind(path.clone());
            qb.push(") IN ('integer', 'real') AND json_extract(documents.body, ");
            qb.push_bind(path);
            qb.push(") < ");
            qb.push_bind(*bound);
            qb.push(")");
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM collections WHERE name = ?")
            .bind(collection)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("Failed to look up collection", e))?;
        Ok(row.is_some())
    }

    async fn list_collections(&self, prefix: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT name FROM collections WHERE substr(name, 1, length(?)) = ? ORDER BY name",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to list collections", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("name")
                    .map_err(|e| db_err("Failed to read collection name", e))
            })
            .collect()
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("Failed to begin transaction", e))?;

        let removed = sqlx::query("DELETE FROM documents WHERE collection = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("Failed to drop documents", e))?
            .rows_affected();

        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("Failed to drop collection", e))?;

        tx.commit()
            .await
            .map_err(|e| db_err("Failed to commit transaction", e))?;

        debug!(collection, removed, "Dropped collection");
        Ok(())
    }

    /// Creates the collection even when `documents` is empty.
    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> Result<u64> {
        let now = self.clock.unix_timestamp_millis();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("Failed to begin transaction", e))?;

        self.ensure_collection(&mut *tx, collection).await?;

        let mut inserted = 0u64;
        for document in &documents {
            let body = Self::encode_body(&document.fields)?;
            inserted += sqlx::query(
                "INSERT INTO documents (collection, id, body, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(collection)
            .bind(&document.id)
            .bind(body)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err(&format!("Failed to insert document {}", document.id), e))?
            .rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| db_err("Failed to commit transaction", e))?;

        debug!(collection, inserted, "Inserted documents");
        Ok(inserted)
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, body FROM documents WHERE collection = ",
        );
        qb.push_bind(collection.to_string());
        push_filter(&mut qb, filter)?;
        qb.push(" ORDER BY rowid");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("Failed to query documents", e))?;

        rows.iter().map(Self::decode_row).collect()
    }

    async fn find_one(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT id, body FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("Failed to fetch document", e))?;

        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn replace_one(&self, collection: &str, document: &Document) -> Result<bool> {
        let body = Self::encode_body(&document.fields)?;
        let result = sqlx::query(
            "UPDATE documents SET body = ?, updated_at = ? WHERE collection = ? AND id = ?",
        )
        .bind(body)
        .bind(self.clock.unix_timestamp_millis())
        .bind(collection)
        .bind(&document.id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to replace document", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_one(&self, collection: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("Failed to delete document", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM documents WHERE collection = ");
        qb.push_bind(collection.to_string());
        push_filter(&mut qb, filter)?;

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("Failed to delete documents", e))?;

        Ok(result.rows_affected())
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM documents WHERE collection = ");
        qb.push_bind(collection.to_string());
        push_filter(&mut qb, filter)?;

        let row = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_err("Failed to count documents", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| db_err("Failed to read count", e))?;
        Ok(total.max(0) as u64)
    }

    async fn conditional_upsert(
        &self,
        collection: &str,
        document: &Document,
        condition: &UpsertCondition,
    ) -> Result<bool> {
        self.ensure_collection(&self.pool, collection).await?;

        let body = Self::encode_body(&document.fields)?;
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO documents (collection, id, body, updated_at) VALUES (",
        );
        {
            let mut values = qb.separated(", ");
            values.push_bind(collection.to_string());
            values.push_bind(document.id.clone());
            values.push_bind(body);
            values.push_bind(self.clock.unix_timestamp_millis());
        }
        qb.push(
            ") ON CONFLICT(collection, id) DO UPDATE SET \
             body = excluded.body, updated_at = excluded.updated_at",
        );

        if let UpsertCondition::ExistingMatchesAny(checks) = condition {
            if checks.is_empty() {
                qb.push(" WHERE 0");
            } else {
                qb.push(" WHERE ");
                for (index, check) in checks.iter().enumerate() {
                    if index > 0 {
                        qb.push(" OR ");
                    }
                    push_check(&mut qb, check)?;
                }
            }
        }

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("Failed to upsert document", e))?;

        let written = result.rows_affected() > 0;
        debug!(collection, id = %document.id, written, "Conditional upsert");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::time::ManualClock;
    use serde_json::json;

    fn doc(id: &str, body: Value) -> Document {
        match body {
            Value::Object(fields) => Document::new(id, fields),
            _ => panic!("document body must be an object"),
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_with_filter() {
        let store = SqliteDocumentStore::in_memory().await.unwrap();

        store
            .insert_many(
                "users",
                vec![
                    doc("u1", json!({"username": "alice", "provenance": "sync", "active": true})),
                    doc("u2", json!({"username": "bob", "provenance": "manual", "active": false})),
                    doc("u3", json!({"username": "carol", "provenance": "sync", "active": false})),
                ],
            )
            .await
            .unwrap();

        let synced = store
            .find("users", &Filter::all().eq("provenance", "sync"))
            .await
            .unwrap();
        assert_eq!(synced.len(), 2);
        assert_eq!(synced[0].id, "u1");

        let inactive_synced = store
            .count(
                "users",
                &Filter::all().eq("provenance", "sync").eq("active", false),
            )
            .await
            .unwrap();
        assert_eq!(inactive_synced, 1);

        let missing_field = store
            .count("users", &Filter::all().eq("deleted_at", Value::Null))
            .await
            .unwrap();
        assert_eq!(missing_field, 3);
    }

    #[tokio::test]
    async fn test_insert_many_is_all_or_nothing() {
        let store = SqliteDocumentStore::in_memory().await.unwrap();
        store
            .insert_many("users", vec![doc("u1", json!({"n": 1}))])
            .await
            .unwrap();

        let result = store
            .insert_many(
                "users",
                vec![doc("u2", json!({"n": 2})), doc("u1", json!({"n": 3}))],
            )
            .await;

        assert!(matches!(result, Err(BridgeError::DatabaseError(_))));
        assert!(store.find_one("users", "u2").await.unwrap().is_none());
        assert_eq!(store.count("users", &Filter::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_insert_creates_collection() {
        let store = SqliteDocumentStore::in_memory().await.unwrap();
        assert!(!store.collection_exists("users_backup_1").await.unwrap());

        store.insert_many("users_backup_1", Vec::new()).await.unwrap();

        assert!(store.collection_exists("users_backup_1").await.unwrap());
        assert_eq!(
            store.list_collections("users_backup_").await.unwrap(),
            vec!["users_backup_1".to_string()]
        );

        store.drop_collection("users_backup_1").await.unwrap();
        assert!(!store.collection_exists("users_backup_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_and_delete() {
        let store = SqliteDocumentStore::in_memory().await.unwrap();
        store
            .insert_many("users", vec![doc("u1", json!({"email": "a@x.com"}))])
            .await
            .unwrap();

        assert!(store
            .replace_one("users", &doc("u1", json!({"email": "b@x.com"})))
            .await
            .unwrap());
        assert!(!store
            .replace_one("users", &doc("nope", json!({})))
            .await
            .unwrap());

        let updated = store.find_one("users", "u1").await.unwrap().unwrap();
        assert_eq!(updated.get_str("email"), Some("b@x.com"));

        assert!(store.delete_one("users", "u1").await.unwrap());
        assert!(!store.delete_one("users", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_conditional_upsert_respects_existing_state() {
        let store = SqliteDocumentStore::in_memory().await.unwrap();
        let condition = UpsertCondition::ExistingMatchesAny(vec![
            FieldCheck::Equals("locked".into(), json!(false)),
            FieldCheck::LessThan("expires_at".into(), 2_000),
        ]);

        // Absent: insert
        let held = doc("users", json!({"locked": true, "expires_at": 5_000}));
        assert!(store
            .conditional_upsert("sync_locks", &held, &condition)
            .await
            .unwrap());

        // Held and unexpired relative to 2_000: rejected
        let contender = doc("users", json!({"locked": true, "expires_at": 9_000}));
        assert!(!store
            .conditional_upsert("sync_locks", &contender, &condition)
            .await
            .unwrap());

        // Released: accepted
        assert!(store
            .conditional_upsert(
                "sync_locks",
                &doc("users", json!({"locked": false, "expires_at": 5_000})),
                &UpsertCondition::Always,
            )
            .await
            .unwrap());
        assert!(store
            .conditional_upsert("sync_locks", &contender, &condition)
            .await
            .unwrap());

        let stored = store.find_one("sync_locks", "users").await.unwrap().unwrap();
        assert_eq!(stored.get_i64("expires_at"), Some(9_000));
    }

    #[tokio::test]
    async fn test_conditional_upsert_is_exclusive_under_contention() {
        let store = Arc::new(SqliteDocumentStore::in_memory().await.unwrap());
        let condition = UpsertCondition::ExistingMatchesAny(vec![FieldCheck::Equals(
            "locked".into(),
            json!(false),
        )]);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            let condition = condition.clone();
            handles.push(tokio::spawn(async move {
                let lease = doc("users", json!({"locked": true, "holder": i}));
                store
                    .conditional_upsert("sync_locks", &lease, &condition)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_clock_is_injectable() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let store = SqliteDocumentStore::in_memory()
            .await
            .unwrap()
            .with_clock(Arc::new(ManualClock::new(start)));

        assert_eq!(store.now(), start);
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("directory.db");

        {
            let store = SqliteDocumentStore::new(&path).await.unwrap();
            store
                .insert_many("roles", vec![doc("r1", json!({"name": "admin"}))])
                .await
                .unwrap();
            store.close().await;
        }

        let reopened = SqliteDocumentStore::new(&path).await.unwrap();
        let role = reopened.find_one("roles", "r1").await.unwrap().unwrap();
        assert_eq!(role.get_str("name"), Some("admin"));
        reopened.close().await;
    }

    #[tokio::test]
    async fn test_non_scalar_filter_rejected() {
        let store = SqliteDocumentStore::in_memory().await.unwrap();
        let result = store
            .find("users", &Filter::all().eq("roles", json!(["a"])))
            .await;
        assert!(matches!(result, Err(BridgeError::OperationFailed(_))));
    }
}
