//! Vault wire types.
//!
//! [`VaultSecret`] is the backend-native response shape shared by login,
//! read and write calls; it is also what gets serialized into the
//! persisted client cache.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Generic Vault response.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultSecret {
    /// Request ID assigned by Vault
    #[serde(default)]
    pub request_id: String,
    /// Lease ID of a dynamic secret
    #[serde(default)]
    pub lease_id: String,
    /// Lease duration in seconds
    #[serde(default)]
    pub lease_duration: u64,
    /// Whether the lease can be renewed
    #[serde(default)]
    pub renewable: bool,
    /// Secret payload
    #[serde(default)]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    /// Warnings returned with the response
    #[serde(default)]
    pub warnings: Option<Vec<String>>,
    /// Auth block of login and token responses
    #[serde(default)]
    pub auth: Option<SecretAuth>,
}

impl fmt::Debug for VaultSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultSecret")
            .field("request_id", &self.request_id)
            .field("lease_id", &self.lease_id)
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .field("data", &self.data.as_ref().map(|_| "[REDACTED]"))
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl VaultSecret {
    /// Look up a string field in `data`.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key)?.as_str()
    }

    /// Look up an integer field in `data`.
    #[must_use]
    pub fn data_u64(&self, key: &str) -> Option<u64> {
        let value = self.data.as_ref()?.get(key)?;
        // token lookups report TTLs as numbers, some plugins as strings
        value.as_u64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
    }
}

/// Auth block of a login or token response.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretAuth {
    /// Vault token
    pub client_token: String,
    /// Token accessor
    #[serde(default)]
    pub accessor: String,
    /// Policies attached to the token
    #[serde(default)]
    pub policies: Vec<String>,
    /// Policies attached by the token store
    #[serde(default)]
    pub token_policies: Vec<String>,
    /// Token TTL in seconds
    #[serde(default)]
    pub lease_duration: u64,
    /// Whether the token can be renewed
    #[serde(default)]
    pub renewable: bool,
}

impl fmt::Debug for SecretAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretAuth")
            .field("client_token", &"[REDACTED]")
            .field("accessor", &self.accessor)
            .field("policies", &self.policies)
            .field("lease_duration", &self.lease_duration)
            .field("renewable", &self.renewable)
            .finish_non_exhaustive()
    }
}

/// Transit encrypt response data.
#[derive(Debug, Deserialize)]
pub struct TransitEncryptData {
    /// Ciphertext prefixed with the key version
    pub ciphertext: String,
}

/// Transit decrypt response data.
#[derive(Debug, Deserialize)]
pub struct TransitDecryptData {
    /// Base64-encoded plaintext
    pub plaintext: String,
}
