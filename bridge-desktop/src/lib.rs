//! # Desktop Bridge Implementations
//!
//! Default implementations of the host capabilities for server and desktop
//! deployments.
//!
//! ## Overview
//!
//! - `HttpClient` using `reqwest`
//! - `DocumentStore` using SQLite (JSON1 functions) through `sqlx`
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{ReqwestHttpClient, SqliteDocumentStore};
//!
//! #[tokio::main]
//! async fn main() -> bridge_traits::error::Result<()> {
//!     let http_client = ReqwestHttpClient::new()?;
//!     let store = SqliteDocumentStore::new("data/directory.db").await?;
//!
//!     // Hand both to the core configuration
//!     Ok(())
//! }
//! ```

mod http;
mod store;

pub use http::ReqwestHttpClient;
pub use store::SqliteDocumentStore;
