//! Persisted client cache records.
//!
//! A session is stored as two objects in the operator namespace, both
//! named `vso-client-cache-<cacheKey>`: a `VaultClientCache` record with
//! the identity of everything the session was built from, and a companion
//! `Secret` holding the serialized session under `secret`. When the auth
//! object names a transit key the blob is ciphertext and the secret carries
//! a `vaultTransitRef` label.

use crate::cache_key::CacheKey;
use crate::client::{Client, ClientFactory};
use crate::config::PersistenceModel;
use crate::context::RequestContext;
use crate::error::{VaultError, VaultResult};
use crate::events::{EventRecorder, Reason};
use crate::model::{
    ObjectKey, ObjectMeta, Secret, VaultClientCache, VaultClientCacheSpec, VaultClientCacheStatus,
};
use crate::secrets::VaultSecret;
use crate::store::ObjectStore;
use crate::transit::Transit;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Name prefix of cache records and companion secrets.
pub const CACHE_RECORD_PREFIX: &str = "vso-client-cache-";

/// Companion secret key holding the serialized session.
pub const SESSION_DATA_KEY: &str = "secret";

/// Label naming the auth object.
pub const LABEL_AUTH_REF: &str = "vaultAuthRef";
/// Label naming the auth object's namespace.
pub const LABEL_AUTH_REF_NAMESPACE: &str = "vaultAuthRefNamespace";
/// Label naming the connection object.
pub const LABEL_CONNECTION_REF: &str = "vaultConnectionRef";
/// Label naming the connection object's namespace.
pub const LABEL_CONNECTION_REF_NAMESPACE: &str = "vaultConnectionRefNamespace";
/// Label naming the transit object used to encrypt the session.
pub const LABEL_TRANSIT_REF: &str = "vaultTransitRef";

/// Object key of the record for `cache_key`.
#[must_use]
pub fn record_key(operator_namespace: &str, cache_key: &CacheKey) -> ObjectKey {
    ObjectKey::new(operator_namespace, format!("{CACHE_RECORD_PREFIX}{cache_key}"))
}

/// What [`CachePersistence::persist`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// A new record was created
    Created,
    /// An existing record was patched
    Patched,
    /// The persistence model ruled the session out
    Skipped,
}

/// Reads and writes persisted sessions.
#[derive(Clone)]
pub struct CachePersistence {
    store: Arc<dyn ObjectStore>,
    transit: Option<Arc<dyn Transit>>,
    events: Arc<dyn EventRecorder>,
    model: PersistenceModel,
    operator_namespace: String,
}

impl fmt::Debug for CachePersistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePersistence")
            .field("model", &self.model)
            .field("operator_namespace", &self.operator_namespace)
            .field("transit", &self.transit.is_some())
            .finish_non_exhaustive()
    }
}

impl CachePersistence {
    /// Create a persistence adapter.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        events: Arc<dyn EventRecorder>,
        model: PersistenceModel,
        operator_namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transit: None,
            events,
            model,
            operator_namespace: operator_namespace.into(),
        }
    }

    /// Encrypt sessions through `transit` when the auth names a key.
    #[must_use]
    pub fn with_transit(mut self, transit: Arc<dyn Transit>) -> Self {
        self.transit = Some(transit);
        self
    }

    /// Persistence model in effect.
    #[must_use]
    pub const fn model(&self) -> PersistenceModel {
        self.model
    }

    /// Whether sessions are persisted and restored at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.model.is_enabled()
    }

    /// Upsert the record and companion secret for `client`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Persistence`] if encryption or any store call
    /// fails; cancellation is passed through unchanged.
    #[instrument(skip_all, fields(cache_key = tracing::field::Empty))]
    pub async fn persist(
        &self,
        ctx: &RequestContext,
        client: &dyn Client,
    ) -> VaultResult<PersistOutcome> {
        if !self.model.is_enabled() {
            return Ok(PersistOutcome::Skipped);
        }
        let cache_key = client.cache_key()?;
        tracing::Span::current().record("cache_key", tracing::field::display(&cache_key));

        let auth = client.vault_auth();
        let auth_key = auth.metadata.key();
        let transit_ref = auth.transit_ref().map(str::to_string);

        if self.model.requires_encryption() && transit_ref.is_none() {
            self.events.warning(
                &auth_key,
                Reason::PersistenceForbidden,
                format!(
                    "Persistence model {} requires a transit reference on VaultAuth {auth_key}",
                    self.model
                ),
            );
            return Ok(PersistOutcome::Skipped);
        }

        let session = client.session()?;
        let mut blob = serde_json::to_vec(&session)?;
        if let Some(transit_ref) = &transit_ref {
            let transit_key = ObjectKey::parse_ref(transit_ref, &auth.metadata.namespace)
                .ok_or_else(|| {
                    persistence_error(format!("invalid transit reference {transit_ref}"))
                })?;
            let transit = self
                .transit
                .as_ref()
                .ok_or_else(|| persistence_error("no transit client configured"))?;
            blob = transit
                .encrypt(ctx, &transit_key, &blob)
                .await
                .map_err(|e| {
                    if !e.is_cancellation() {
                        self.events.warning(&auth_key, Reason::TransitEncryptError, e.to_string());
                    }
                    wrap(e)
                })?;
            self.events.normal(
                &auth_key,
                Reason::TransitEncryptSuccessful,
                format!("Encrypted client cache with VaultTransit {transit_key}"),
            );
        }

        let key = record_key(&self.operator_namespace, &cache_key);
        let labels = record_labels(client);
        let mut secret = Secret::new(&key.namespace, &key.name).with_data(SESSION_DATA_KEY, blob);
        secret.metadata.labels.clone_from(&labels);
        if let Some(transit_ref) = &transit_ref {
            secret.metadata.labels.insert(LABEL_TRANSIT_REF.to_string(), transit_ref.clone());
        }
        self.upsert_secret(ctx, &secret).await?;

        let record = self.record_for(client, &cache_key, labels);
        let outcome = self.upsert_record(ctx, &record).await?;

        info!(record = %key, action = ?outcome, "Handled VaultClientCache");
        Ok(outcome)
    }

    /// Create or patch the record for a restored `client`.
    ///
    /// The companion secret already holds the session and is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Persistence`] if any store call fails;
    /// cancellation is passed through unchanged.
    #[instrument(skip_all, fields(cache_key = tracing::field::Empty))]
    pub async fn refresh_record(
        &self,
        ctx: &RequestContext,
        client: &dyn Client,
    ) -> VaultResult<PersistOutcome> {
        if !self.model.is_enabled() {
            return Ok(PersistOutcome::Skipped);
        }
        let cache_key = client.cache_key()?;
        tracing::Span::current().record("cache_key", tracing::field::display(&cache_key));

        let record = self.record_for(client, &cache_key, record_labels(client));
        let outcome = self.upsert_record(ctx, &record).await?;
        debug!(record = %record.metadata.key(), action = ?outcome, "Refreshed VaultClientCache");
        Ok(outcome)
    }

    fn record_for(
        &self,
        client: &dyn Client,
        cache_key: &CacheKey,
        labels: BTreeMap<String, String>,
    ) -> VaultClientCache {
        let auth = client.vault_auth();
        let connection = client.vault_connection();
        let key = record_key(&self.operator_namespace, cache_key);
        let spec = VaultClientCacheSpec {
            cache_key: cache_key.to_string(),
            vault_auth_name: auth.metadata.name.clone(),
            vault_auth_namespace: auth.metadata.namespace.clone(),
            vault_auth_method: auth.spec.method.as_str().to_string(),
            vault_auth_uid: auth.metadata.uid.clone(),
            vault_auth_generation: auth.metadata.generation,
            vault_connection_uid: connection.metadata.uid.clone(),
            vault_connection_generation: connection.metadata.generation,
            credential_provider_uid: client.provider_uid().to_string(),
            vault_transit_ref: auth.transit_ref().map(str::to_string),
            target_namespace: client.target_namespace().to_string(),
        };
        let mut metadata = ObjectMeta::new(&key.namespace, &key.name);
        metadata.labels = labels;
        VaultClientCache {
            metadata,
            spec,
            status: VaultClientCacheStatus {
                cache_secret_ref: key.name,
            },
        }
    }

    async fn upsert_secret(&self, ctx: &RequestContext, secret: &Secret) -> VaultResult<()> {
        let store = self.store.as_ref();
        match ctx.run(async { store.create_secret(secret).await.map_err(VaultError::from) }).await {
            Ok(_) => Ok(()),
            Err(VaultError::Store(e)) if e.is_already_exists() => {
                ctx.run(async { store.patch_secret(secret).await.map_err(VaultError::from) })
                    .await
                    .map(|_| ())
                    .map_err(wrap)
            }
            Err(e) => Err(wrap(e)),
        }
    }

    async fn upsert_record(
        &self,
        ctx: &RequestContext,
        record: &VaultClientCache,
    ) -> VaultResult<PersistOutcome> {
        let store = self.store.as_ref();
        match ctx
            .run(async { store.create_client_cache(record).await.map_err(VaultError::from) })
            .await
        {
            Ok(_) => Ok(PersistOutcome::Created),
            Err(VaultError::Store(e)) if e.is_already_exists() => {
                let key = record.metadata.key();
                let mut current = ctx
                    .run(async { store.get_client_cache(&key).await.map_err(VaultError::from) })
                    .await
                    .map_err(wrap)?;
                current.spec = record.spec.clone();
                current.metadata.labels.clone_from(&record.metadata.labels);
                current.status = record.status.clone();
                ctx.run(async {
                    store.patch_client_cache(&current).await.map_err(VaultError::from)
                })
                .await
                .map_err(wrap)?;
                Ok(PersistOutcome::Patched)
            }
            Err(e) => Err(wrap(e)),
        }
    }

    /// Rebuild the client persisted under `cache_key`.
    ///
    /// Returns `None` when no record exists. The returned client is restored
    /// but not yet cached, and nothing is written back to the store; see
    /// [`CachePersistence::refresh_record`].
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::RestorationFailed`] if the companion secret is
    /// missing, the blob cannot be decrypted or deserialized, or the backend
    /// rejects the session. Cancellation is passed through unchanged.
    #[instrument(skip(self, ctx, factory), fields(cache_key = %cache_key))]
    pub async fn restore(
        &self,
        ctx: &RequestContext,
        factory: &dyn ClientFactory,
        cache_key: &CacheKey,
    ) -> VaultResult<Option<Arc<dyn Client>>> {
        if !self.model.is_enabled() {
            return Ok(None);
        }
        let store = self.store.as_ref();
        let key = record_key(&self.operator_namespace, cache_key);
        let record = match ctx
            .run(async { store.get_client_cache(&key).await.map_err(VaultError::from) })
            .await
        {
            Ok(record) => record,
            Err(VaultError::Store(e)) if e.is_not_found() => {
                debug!(record = %key, "No persisted client");
                return Ok(None);
            }
            Err(e) => return Err(restoration_error(e)),
        };

        let secret_name = if record.status.cache_secret_ref.is_empty() {
            key.name.clone()
        } else {
            record.status.cache_secret_ref.clone()
        };
        let secret_key = ObjectKey::new(&key.namespace, secret_name);
        let secret = ctx
            .run(async { store.get_secret(&secret_key).await.map_err(VaultError::from) })
            .await
            .map_err(restoration_error)?;

        let blob = secret.data.get(SESSION_DATA_KEY).ok_or_else(|| {
            VaultError::restoration(format!("Secret {secret_key} has no {SESSION_DATA_KEY} field"))
        })?;
        let blob = match secret.metadata.labels.get(LABEL_TRANSIT_REF).filter(|r| !r.is_empty()) {
            Some(transit_ref) => {
                let transit_key =
                    ObjectKey::parse_ref(transit_ref, &record.spec.vault_auth_namespace)
                        .ok_or_else(|| {
                            VaultError::restoration(format!(
                                "invalid transit reference {transit_ref}"
                            ))
                        })?;
                let transit = self
                    .transit
                    .as_ref()
                    .ok_or_else(|| VaultError::restoration("no transit client configured"))?;
                let auth_key =
                    ObjectKey::new(&record.spec.vault_auth_namespace, &record.spec.vault_auth_name);
                let plaintext = transit.decrypt(ctx, &transit_key, blob).await.map_err(|e| {
                    if !e.is_cancellation() {
                        self.events.warning(&auth_key, Reason::TransitDecryptError, e.to_string());
                    }
                    restoration_error(e)
                })?;
                self.events.normal(
                    &auth_key,
                    Reason::TransitDecryptSuccessful,
                    format!("Decrypted client cache with VaultTransit {transit_key}"),
                );
                plaintext
            }
            None if self.model.requires_encryption() => {
                return Err(VaultError::restoration(format!(
                    "Secret {secret_key} is not encrypted but persistence model is {}",
                    self.model
                )));
            }
            None => blob.clone(),
        };

        let session: VaultSecret = serde_json::from_slice(&blob)
            .map_err(|e| VaultError::restoration(format!("invalid persisted session: {e}")))?;

        let client = factory
            .new_client(ctx, &record.client_target())
            .await
            .map_err(restoration_error)?;
        let rebuilt_key = client.cache_key()?;
        if &rebuilt_key != cache_key {
            warn!(rebuilt = %rebuilt_key, "Persisted record no longer matches its configuration");
            return Err(VaultError::restoration(format!(
                "record {key} rebuilt with cache key {rebuilt_key}"
            )));
        }
        client
            .restore(ctx, session, &record.spec.credential_provider_uid)
            .await
            .map_err(restoration_error)?;
        Ok(Some(client))
    }
}

fn record_labels(client: &dyn Client) -> BTreeMap<String, String> {
    let auth = client.vault_auth();
    let connection = client.vault_connection();
    BTreeMap::from([
        (LABEL_AUTH_REF.to_string(), auth.metadata.name.clone()),
        (LABEL_AUTH_REF_NAMESPACE.to_string(), auth.metadata.namespace.clone()),
        (LABEL_CONNECTION_REF.to_string(), connection.metadata.name.clone()),
        (
            LABEL_CONNECTION_REF_NAMESPACE.to_string(),
            connection.metadata.namespace.clone(),
        ),
    ])
}

fn persistence_error(msg: impl Into<String>) -> VaultError {
    VaultError::Persistence(msg.into())
}

fn wrap(err: VaultError) -> VaultError {
    match err {
        VaultError::Persistence(_) | VaultError::Cancelled | VaultError::DeadlineExceeded(_) => err,
        other => persistence_error(other.to_string()),
    }
}

fn restoration_error(err: VaultError) -> VaultError {
    match err {
        VaultError::RestorationFailed(_)
        | VaultError::Cancelled
        | VaultError::DeadlineExceeded(_) => err,
        other => VaultError::restoration(other.to_string()),
    }
}
