//! Platform-level error types.
//!
//! These cover failures of the shared plumbing itself (building HTTP
//! clients, parsing configuration, installing the tracing subscriber) as
//! opposed to failures reported by Vault.

use thiserror::Error;

/// Errors raised by the shared plumbing.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// The HTTP client could not be constructed
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// A header name or value was rejected
    #[error("Invalid header {name}: {reason}")]
    InvalidHeader {
        /// Header name as configured
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// A configuration value could not be parsed or is out of range
    #[error("Invalid configuration for {key}: {reason}")]
    InvalidConfig {
        /// Configuration key (usually an environment variable)
        key: String,
        /// Why it was rejected
        reason: String,
    },

    /// The global tracing subscriber could not be installed
    #[error("Failed to initialise tracing: {0}")]
    Tracing(String),
}

impl PlatformError {
    /// Check if this error is retryable.
    ///
    /// Plumbing errors are configuration problems; only a transient failure
    /// to construct the HTTP client (e.g. TLS backend initialisation) is
    /// worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpClient(e) => e.is_connect() || e.is_timeout(),
            Self::InvalidHeader { .. } | Self::InvalidConfig { .. } | Self::Tracing(_) => false,
        }
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid header error.
    #[must_use]
    pub fn invalid_header(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidHeader {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
