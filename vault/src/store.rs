//! Object store seam.
//!
//! The Kubernetes API client lives outside this crate. [`ObjectStore`] is
//! the narrow get/create/patch surface the cache needs from it;
//! [`MemoryStore`] backs development setups and tests.

use crate::model::{
    ObjectKey, ObjectMeta, Secret, ServiceAccount, VaultAuth, VaultClientCache, VaultConnection,
    VaultTransit,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Object store errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Object does not exist
    #[error("{kind} {key} not found")]
    NotFound {
        /// Object kind
        kind: &'static str,
        /// Object key
        key: String,
    },

    /// Object already exists
    #[error("{kind} {key} already exists")]
    AlreadyExists {
        /// Object kind
        kind: &'static str,
        /// Object key
        key: String,
    },

    /// Any other API failure
    #[error("Object store error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Create a not found error.
    #[must_use]
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    /// Create an already exists error.
    #[must_use]
    pub fn already_exists(kind: &'static str, key: impl ToString) -> Self {
        Self::AlreadyExists {
            kind,
            key: key.to_string(),
        }
    }

    /// Check if error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// Check if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is an already exists error.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Kubernetes API surface used by the client cache.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get a `VaultAuth`.
    async fn get_vault_auth(&self, key: &ObjectKey) -> StoreResult<VaultAuth>;

    /// Get a `VaultConnection`.
    async fn get_vault_connection(&self, key: &ObjectKey) -> StoreResult<VaultConnection>;

    /// Get a `VaultTransit`.
    async fn get_vault_transit(&self, key: &ObjectKey) -> StoreResult<VaultTransit>;

    /// Get a `ServiceAccount`.
    async fn get_service_account(&self, key: &ObjectKey) -> StoreResult<ServiceAccount>;

    /// Request a token for a service account.
    async fn create_service_account_token(
        &self,
        key: &ObjectKey,
        audiences: &[String],
    ) -> StoreResult<String>;

    /// Get a `Secret`.
    async fn get_secret(&self, key: &ObjectKey) -> StoreResult<Secret>;

    /// Create a `Secret`.
    async fn create_secret(&self, secret: &Secret) -> StoreResult<Secret>;

    /// Patch a `Secret`'s labels and data.
    async fn patch_secret(&self, secret: &Secret) -> StoreResult<Secret>;

    /// Get a `VaultClientCache`.
    async fn get_client_cache(&self, key: &ObjectKey) -> StoreResult<VaultClientCache>;

    /// Create a `VaultClientCache`.
    async fn create_client_cache(&self, obj: &VaultClientCache) -> StoreResult<VaultClientCache>;

    /// Patch a `VaultClientCache`'s labels, spec and status.
    async fn patch_client_cache(&self, obj: &VaultClientCache) -> StoreResult<VaultClientCache>;
}

/// In-memory [`ObjectStore`].
///
/// Assigns UIDs and generation 1 on create, and bumps the generation when
/// a patch changes an object.
#[derive(Debug, Default)]
pub struct MemoryStore {
    auths: RwLock<HashMap<ObjectKey, VaultAuth>>,
    connections: RwLock<HashMap<ObjectKey, VaultConnection>>,
    transits: RwLock<HashMap<ObjectKey, VaultTransit>>,
    service_accounts: RwLock<HashMap<ObjectKey, ServiceAccount>>,
    secrets: RwLock<HashMap<ObjectKey, Secret>>,
    client_caches: RwLock<HashMap<ObjectKey, VaultClientCache>>,
}

fn admit(meta: &mut ObjectMeta) {
    if meta.uid.is_empty() {
        meta.uid = Uuid::new_v4().to_string();
    }
    if meta.generation == 0 {
        meta.generation = 1;
    }
}

fn upsert<T: Clone>(
    map: &RwLock<HashMap<ObjectKey, T>>,
    mut obj: T,
    meta: impl Fn(&mut T) -> &mut ObjectMeta,
) -> T {
    let m = meta(&mut obj);
    admit(m);
    let key = m.key();
    map.write().insert(key, obj.clone());
    obj
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a `VaultAuth`.
    pub fn put_vault_auth(&self, obj: VaultAuth) -> VaultAuth {
        upsert(&self.auths, obj, |o| &mut o.metadata)
    }

    /// Insert or replace a `VaultConnection`.
    pub fn put_vault_connection(&self, obj: VaultConnection) -> VaultConnection {
        upsert(&self.connections, obj, |o| &mut o.metadata)
    }

    /// Insert or replace a `VaultTransit`.
    pub fn put_vault_transit(&self, obj: VaultTransit) -> VaultTransit {
        upsert(&self.transits, obj, |o| &mut o.metadata)
    }

    /// Insert or replace a `ServiceAccount`.
    pub fn put_service_account(&self, obj: ServiceAccount) -> ServiceAccount {
        upsert(&self.service_accounts, obj, |o| &mut o.metadata)
    }

    /// Insert or replace a `Secret`.
    pub fn put_secret(&self, obj: Secret) -> Secret {
        upsert(&self.secrets, obj, |o| &mut o.metadata)
    }

    /// Update a `VaultAuth` in place, bumping its generation.
    ///
    /// Returns `false` if the object does not exist.
    pub fn update_vault_auth(&self, key: &ObjectKey, f: impl FnOnce(&mut VaultAuth)) -> bool {
        let mut auths = self.auths.write();
        match auths.get_mut(key) {
            Some(auth) => {
                f(auth);
                auth.metadata.generation += 1;
                true
            }
            None => false,
        }
    }

    /// Delete a `Secret`.
    pub fn delete_secret(&self, key: &ObjectKey) -> bool {
        self.secrets.write().remove(key).is_some()
    }

    /// Delete a `VaultClientCache`.
    pub fn delete_client_cache(&self, key: &ObjectKey) -> bool {
        self.client_caches.write().remove(key).is_some()
    }

    /// Peek at a `VaultAuth` without going through the async API.
    #[must_use]
    pub fn vault_auth(&self, key: &ObjectKey) -> Option<VaultAuth> {
        self.auths.read().get(key).cloned()
    }

    /// Peek at a `Secret` without going through the async API.
    #[must_use]
    pub fn secret(&self, key: &ObjectKey) -> Option<Secret> {
        self.secrets.read().get(key).cloned()
    }

    /// Peek at a `VaultClientCache` without going through the async API.
    #[must_use]
    pub fn client_cache(&self, key: &ObjectKey) -> Option<VaultClientCache> {
        self.client_caches.read().get(key).cloned()
    }

    /// Number of stored `VaultClientCache` records.
    #[must_use]
    pub fn client_cache_count(&self) -> usize {
        self.client_caches.read().len()
    }
}

fn get<T: Clone>(
    map: &RwLock<HashMap<ObjectKey, T>>,
    kind: &'static str,
    key: &ObjectKey,
) -> StoreResult<T> {
    map.read().get(key).cloned().ok_or_else(|| StoreError::not_found(kind, key))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_vault_auth(&self, key: &ObjectKey) -> StoreResult<VaultAuth> {
        get(&self.auths, "VaultAuth", key)
    }

    async fn get_vault_connection(&self, key: &ObjectKey) -> StoreResult<VaultConnection> {
        get(&self.connections, "VaultConnection", key)
    }

    async fn get_vault_transit(&self, key: &ObjectKey) -> StoreResult<VaultTransit> {
        get(&self.transits, "VaultTransit", key)
    }

    async fn get_service_account(&self, key: &ObjectKey) -> StoreResult<ServiceAccount> {
        get(&self.service_accounts, "ServiceAccount", key)
    }

    async fn create_service_account_token(
        &self,
        key: &ObjectKey,
        audiences: &[String],
    ) -> StoreResult<String> {
        let sa = get(&self.service_accounts, "ServiceAccount", key)?;
        Ok(format!(
            "sa-token.{}.{}.{}",
            sa.metadata.uid,
            key.name,
            audiences.join(",")
        ))
    }

    async fn get_secret(&self, key: &ObjectKey) -> StoreResult<Secret> {
        get(&self.secrets, "Secret", key)
    }

    async fn create_secret(&self, secret: &Secret) -> StoreResult<Secret> {
        let key = secret.metadata.key();
        if self.secrets.read().contains_key(&key) {
            return Err(StoreError::already_exists("Secret", key));
        }
        Ok(self.put_secret(secret.clone()))
    }

    async fn patch_secret(&self, secret: &Secret) -> StoreResult<Secret> {
        let key = secret.metadata.key();
        let mut secrets = self.secrets.write();
        let current = secrets.get_mut(&key).ok_or_else(|| StoreError::not_found("Secret", &key))?;
        current.metadata.labels.clone_from(&secret.metadata.labels);
        current.data.clone_from(&secret.data);
        Ok(current.clone())
    }

    async fn get_client_cache(&self, key: &ObjectKey) -> StoreResult<VaultClientCache> {
        get(&self.client_caches, "VaultClientCache", key)
    }

    async fn create_client_cache(&self, obj: &VaultClientCache) -> StoreResult<VaultClientCache> {
        let key = obj.metadata.key();
        if self.client_caches.read().contains_key(&key) {
            return Err(StoreError::already_exists("VaultClientCache", key));
        }
        Ok(upsert(&self.client_caches, obj.clone(), |o| &mut o.metadata))
    }

    async fn patch_client_cache(&self, obj: &VaultClientCache) -> StoreResult<VaultClientCache> {
        let key = obj.metadata.key();
        let mut caches = self.client_caches.write();
        let current = caches
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found("VaultClientCache", &key))?;
        if current.spec != obj.spec {
            current.metadata.generation += 1;
        }
        current.metadata.labels.clone_from(&obj.metadata.labels);
        current.spec = obj.spec.clone();
        current.status = obj.status.clone();
        Ok(current.clone())
    }
}
