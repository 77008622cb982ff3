//! # Host Bridge Traits
//!
//! Capability traits that the reconciliation core requires from its host.
//!
//! ## Overview
//!
//! This crate defines the contract between the sync core and the concrete
//! adapters that talk to the outside world. Each trait represents a capability
//! the core needs but must not hard-wire:
//!
//! - [`HttpClient`](http::HttpClient) - Single-attempt async HTTP transport
//! - [`DocumentStore`](store::DocumentStore) - Keyed collection store with an
//!   atomic conditional upsert
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//!
//! ## Implementations
//!
//! | Capability      | Implementation Crate | Backend |
//! |-----------------|----------------------|---------|
//! | `HttpClient`    | `bridge-desktop`     | reqwest |
//! | `DocumentStore` | `bridge-desktop`     | SQLite (JSON1) via sqlx |
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. Adapters
//! should convert backend-specific errors into it with an actionable message.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` so handles can be shared across
//! tasks behind an `Arc`.

pub mod error;
pub mod http;
pub mod store;
pub mod time;

pub use error::BridgeError;

pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy};
pub use store::{Document, DocumentStore, FieldCheck, Fields, Filter, UpsertCondition};
pub use time::{Clock, ManualClock, SystemClock};
