//! Event reasons and the recorder seam.

use crate::model::ObjectKey;
use std::fmt;
use tracing::{info, warn};

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Informational
    Normal,
    /// Something went wrong
    Warning,
}

impl EventType {
    /// Kubernetes event type string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// Why an event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    /// Client configuration could not be resolved
    VaultClientConfigError,
    /// A backend call failed
    VaultClientError,
    /// A lease was renewed
    SecretLeaseRenewal,
    /// A lease renewal failed
    SecretLeaseRenewalError,
    /// Secret data was synced
    SecretSynced,
    /// Secret data was re-issued
    SecretRotated,
    /// Transit encryption failed
    TransitEncryptError,
    /// Transit encryption succeeded
    TransitEncryptSuccessful,
    /// Transit decryption failed
    TransitDecryptError,
    /// Transit decryption succeeded
    TransitDecryptSuccessful,
    /// A client was stored for reuse
    VaultClientCacheCreation,
    /// A client was evicted
    VaultClientCacheEviction,
    /// A requeue horizon could not be computed
    InvalidHorizon,
    /// Persistence was refused by the persistence model
    PersistenceForbidden,
    /// A persisted client could not be restored
    CacheRestorationFailed,
    /// A persisted client was restored
    CacheRestorationSucceeded,
    /// The backend is in an unexpected state
    Unrecoverable,
}

impl Reason {
    /// Reason string as it appears on the event.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::VaultClientConfigError => "VaultClientConfigError",
            Self::VaultClientError => "VaultClientError",
            Self::SecretLeaseRenewal => "SecretLeaseRenewal",
            Self::SecretLeaseRenewalError => "SecretLeaseRenewalError",
            Self::SecretSynced => "SecretSynced",
            Self::SecretRotated => "SecretRotated",
            Self::TransitEncryptError => "TransitEncryptError",
            Self::TransitEncryptSuccessful => "TransitEncryptSuccessful",
            Self::TransitDecryptError => "TransitDecryptError",
            Self::TransitDecryptSuccessful => "TransitDecryptSuccessful",
            Self::VaultClientCacheCreation => "VaultClientCacheCreation",
            Self::VaultClientCacheEviction => "VaultClientCacheEviction",
            Self::InvalidHorizon => "InvalidHorizon",
            Self::PersistenceForbidden => "PersistenceForbidden",
            Self::CacheRestorationFailed => "CacheRestorationFailed",
            Self::CacheRestorationSucceeded => "CacheRestorationSucceeded",
            Self::Unrecoverable => "Unrecoverable",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for Kubernetes events.
pub trait EventRecorder: Send + Sync {
    /// Record an event against `object`.
    fn record(&self, object: &ObjectKey, event_type: EventType, reason: Reason, message: String);

    /// Record a `Normal` event.
    fn normal(&self, object: &ObjectKey, reason: Reason, message: String) {
        self.record(object, EventType::Normal, reason, message);
    }

    /// Record a `Warning` event.
    fn warning(&self, object: &ObjectKey, reason: Reason, message: String) {
        self.record(object, EventType::Warning, reason, message);
    }
}

/// Recorder that emits events as structured log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, object: &ObjectKey, event_type: EventType, reason: Reason, message: String) {
        match event_type {
            EventType::Normal => info!(
                object = %object,
                reason = reason.as_str(),
                event_type = event_type.as_str(),
                "{message}"
            ),
            EventType::Warning => warn!(
                object = %object,
                reason = reason.as_str(),
                event_type = event_type.as_str(),
                "{message}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings() {
        assert_eq!(Reason::CacheRestorationFailed.to_string(), "CacheRestorationFailed");
        assert_eq!(Reason::Unrecoverable.as_str(), "Unrecoverable");
        assert_eq!(EventType::Warning.as_str(), "Warning");
    }

    #[test]
    fn test_tracing_recorder_does_not_panic_without_subscriber() {
        let recorder = TracingRecorder;
        recorder.warning(
            &ObjectKey::new("tenant", "app"),
            Reason::VaultClientError,
            "login failed".to_string(),
        );
    }
}
