//! Shared plumbing for the Vault client cache crates.
//!
//! This crate provides centralized implementations for:
//! - Platform error types with retryability classification
//! - HTTP client configuration for Vault connections
//! - Tracing subscriber initialisation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod http;
pub mod tracing_config;

pub use error::PlatformError;
pub use http::{HttpConfig, build_http_client};
pub use tracing_config::{TracingConfig, init_tracing};
