//! Client cache key derivation.
//!
//! A cache key fingerprints everything a session depends on: the auth
//! object, the connection object and the credential provider. Generations
//! are part of the digest, so any spec change to either object produces a
//! new key and the old session is simply never looked up again.

use crate::context::RequestContext;
use crate::error::{VaultError, VaultResult};
use crate::model::{VaultAuth, VaultConnection, VaultConsumer};
use crate::provider::CredentialProvider;
use crate::store::ObjectStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Number of hex characters kept from the digest.
pub const CACHE_KEY_DIGEST_LEN: usize = 22;

/// Opaque client cache key, e.g. `kubernetes-2a8108711ae49ac0faa724`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an existing key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the key is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Compute the cache key for an auth, connection and provider.
///
/// # Errors
///
/// Returns [`VaultError::Config`] if any of the UIDs is empty.
pub fn compute_cache_key(
    auth: &VaultAuth,
    connection: &VaultConnection,
    provider_uid: &str,
) -> VaultResult<CacheKey> {
    for (what, uid) in [
        ("VaultAuth", auth.metadata.uid.as_str()),
        ("VaultConnection", connection.metadata.uid.as_str()),
        ("credential provider", provider_uid),
    ] {
        if uid.is_empty() {
            return Err(VaultError::config(format!("{what} UID is empty")));
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(auth.metadata.uid.as_bytes());
    hasher.update(auth.metadata.generation.to_be_bytes());
    hasher.update(connection.metadata.uid.as_bytes());
    hasher.update(connection.metadata.generation.to_be_bytes());
    hasher.update(provider_uid.as_bytes());
    let digest = hex::encode(hasher.finalize());

    Ok(CacheKey(format!(
        "{}-{}",
        auth.spec.method,
        &digest[..CACHE_KEY_DIGEST_LEN]
    )))
}

/// Derives the cache key for a consumer.
#[async_trait]
pub trait CacheKeyDeriver: Send + Sync {
    /// Derive the key; an empty key is treated as a configuration error by
    /// the caller.
    async fn derive(
        &self,
        ctx: &RequestContext,
        consumer: &dyn VaultConsumer,
    ) -> VaultResult<CacheKey>;
}

/// Deriver that resolves the consumer's auth, connection and provider
/// through the object store.
#[derive(Clone)]
pub struct ObjectCacheKeyDeriver {
    store: Arc<dyn ObjectStore>,
    operator_namespace: String,
}

impl fmt::Debug for ObjectCacheKeyDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCacheKeyDeriver")
            .field("operator_namespace", &self.operator_namespace)
            .finish_non_exhaustive()
    }
}

impl ObjectCacheKeyDeriver {
    /// Create a deriver.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, operator_namespace: impl Into<String>) -> Self {
        Self {
            store,
            operator_namespace: operator_namespace.into(),
        }
    }
}

#[async_trait]
impl CacheKeyDeriver for ObjectCacheKeyDeriver {
    #[instrument(skip_all, fields(consumer = %consumer.object_key()))]
    async fn derive(
        &self,
        ctx: &RequestContext,
        consumer: &dyn VaultConsumer,
    ) -> VaultResult<CacheKey> {
        let target = consumer.client_target(&self.operator_namespace);
        let store = self.store.as_ref();
        let auth = ctx
            .run(async { store.get_vault_auth(&target.auth).await.map_err(VaultError::from) })
            .await?;
        let conn_key = auth.connection_key(&self.operator_namespace);
        let connection = ctx
            .run(async { store.get_vault_connection(&conn_key).await.map_err(VaultError::from) })
            .await?;
        let provider_uid =
            CredentialProvider::resolve_uid(ctx, store, &auth, &target.target_namespace).await?;

        let key = compute_cache_key(&auth, &connection, &provider_uid)?;
        debug!(cache_key = %key, "Derived client cache key");
        Ok(key)
    }
}
