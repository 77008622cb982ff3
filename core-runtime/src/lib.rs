//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the directory sync core:
//! - Logging and tracing infrastructure
//! - Configuration management with fail-fast validation
//!
//! ## Overview
//!
//! This crate contains the runtime utilities the engine and the service façade
//! depend on. It establishes the logging conventions and the configuration
//! contract (which bridges and settings must be supplied before the engine can
//! be bootstrapped).

pub mod config;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
