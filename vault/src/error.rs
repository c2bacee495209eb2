//! Vault client cache error types using thiserror 2.0.
//!
//! Errors are classified along two axes: retryable (transient, the
//! reconciliation scheduler should back off and retry) and fatal (the
//! backend is in an unexpected state and the cycle must abort without
//! touching status).

use crate::events::Reason;
use crate::store::StoreError;
use rust_common::PlatformError;
use std::time::Duration;
use thiserror::Error;

/// Vault client cache errors.
#[derive(Error, Debug)]
pub enum VaultError {
    /// Client configuration is invalid (e.g. an empty derived cache key)
    #[error("Invalid client configuration: {0}")]
    Config(String),

    /// Vault server unavailable
    #[error("Vault unavailable: {0}")]
    Unavailable(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The client has no usable session
    #[error("Client error: {0}")]
    Client(String),

    /// Secret not found
    #[error("Secret not found at path: {0}")]
    SecretNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Rate limited
    #[error("Rate limited")]
    RateLimited,

    /// Lease or token renewal failed
    #[error("Lease renewal failed: {0}")]
    LeaseRenewalFailed(String),

    /// Vault returned a different lease after renewal
    #[error("Lease ID changed after renewal, expected={expected}, actual={actual}")]
    LeaseRenewalMismatch {
        /// Lease ID that was renewed
        expected: String,
        /// Lease ID Vault reported back
        actual: String,
    },

    /// Restoring a persisted client failed
    #[error("Client cache restoration failed: {0}")]
    RestorationFailed(String),

    /// Writing the persisted client cache failed
    #[error("Client cache persistence failed: {0}")]
    Persistence(String),

    /// Transit encryption or decryption failed
    #[error("Transit {operation} failed: {reason}")]
    Transit {
        /// `encrypt` or `decrypt`
        operation: &'static str,
        /// Underlying reason
        reason: String,
    },

    /// A requeue horizon could not be computed
    #[error("Invalid horizon: {0}")]
    InvalidHorizon(String),

    /// The request context was cancelled
    #[error("Request cancelled")]
    Cancelled,

    /// The request context deadline elapsed
    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// Object store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Platform error
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Result type for Vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

impl VaultError {
    /// Check if error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unavailable(_)
            | Self::RateLimited
            | Self::Http(_)
            | Self::DeadlineExceeded(_) => true,
            Self::Store(e) => e.is_retryable(),
            Self::Platform(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Check if error signals an unrecoverable backend state.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::LeaseRenewalMismatch { .. })
    }

    /// Check if the request context finished before the operation did.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded(_))
    }

    /// Event reason to record for this error.
    #[must_use]
    pub fn reason(&self) -> Reason {
        match self {
            Self::Config(_) | Self::Platform(_) => Reason::VaultClientConfigError,
            Self::LeaseRenewalFailed(_) => Reason::SecretLeaseRenewalError,
            Self::LeaseRenewalMismatch { .. } => Reason::Unrecoverable,
            Self::RestorationFailed(_) => Reason::CacheRestorationFailed,
            Self::Persistence(_) => Reason::VaultClientCacheCreation,
            Self::Transit {
                operation: "encrypt",
                ..
            } => Reason::TransitEncryptError,
            Self::Transit { .. } => Reason::TransitDecryptError,
            Self::InvalidHorizon(_) => Reason::InvalidHorizon,
            _ => Reason::VaultClientError,
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an unavailable error.
    #[must_use]
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create an authentication failed error.
    #[must_use]
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// Create a client error.
    #[must_use]
    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client(msg.into())
    }

    /// Create a secret not found error.
    #[must_use]
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::SecretNotFound(path.into())
    }

    /// Create a restoration error.
    #[must_use]
    pub fn restoration(msg: impl Into<String>) -> Self {
        Self::RestorationFailed(msg.into())
    }

    /// Create a transit error.
    #[must_use]
    pub fn transit(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Transit {
            operation,
            reason: reason.into(),
        }
    }
}
