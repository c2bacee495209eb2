//! Client cache manager.
//!
//! Maps each consumer to an authenticated client. On every call the
//! consumer's cache key is re-derived; a changed key evicts the consumer's
//! previous client, a cached healthy client is renewed and reused, a
//! persisted session is restored when possible, and otherwise a new client
//! logs in. Work for one cache key is serialized on its lock stripe.

use crate::cache::{ClientCache, ObjectKeyCache};
use crate::cache_key::{CacheKey, CacheKeyDeriver};
use crate::client::{Client, ClientFactory};
use crate::config::ClientCacheConfig;
use crate::context::RequestContext;
use crate::error::{VaultError, VaultResult};
use crate::events::{EventRecorder, Reason};
use crate::lock::StripedLock;
use crate::model::{ObjectKey, VaultConsumer};
use crate::persistence::{CachePersistence, PersistOutcome};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Owns the client and object key caches.
pub struct ClientCacheManager {
    config: ClientCacheConfig,
    clients: ClientCache,
    object_keys: ObjectKeyCache,
    locks: StripedLock,
    deriver: Arc<dyn CacheKeyDeriver>,
    factory: Arc<dyn ClientFactory>,
    persistence: CachePersistence,
    events: Arc<dyn EventRecorder>,
}

impl fmt::Debug for ClientCacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCacheManager")
            .field("clients", &self.clients.len())
            .field("object_keys", &self.object_keys.len())
            .field("stripes", &self.locks.stripes())
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

impl ClientCacheManager {
    /// Create a manager.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Config`] if the configuration is invalid.
    pub fn new(
        config: ClientCacheConfig,
        deriver: Arc<dyn CacheKeyDeriver>,
        factory: Arc<dyn ClientFactory>,
        persistence: CachePersistence,
        events: Arc<dyn EventRecorder>,
    ) -> VaultResult<Self> {
        config.validate()?;
        Ok(Self {
            clients: ClientCache::new(config.client_cache_size)?,
            object_keys: ObjectKeyCache::new(config.object_key_cache_size)?,
            locks: StripedLock::new(config.lock_stripes),
            config,
            deriver,
            factory,
            persistence,
            events,
        })
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &ClientCacheConfig {
        &self.config
    }

    /// The client cache.
    #[must_use]
    pub const fn clients(&self) -> &ClientCache {
        &self.clients
    }

    /// The object key cache.
    #[must_use]
    pub const fn object_keys(&self) -> &ObjectKeyCache {
        &self.object_keys
    }

    /// Get an authenticated client for `consumer`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Config`] if no cache key can be derived; no cache is
    ///   touched in that case.
    /// - Any error from building or logging in a new client.
    /// - [`VaultError::Persistence`] if the new or restored client could not
    ///   be persisted. The client stays cached in memory.
    /// - [`VaultError::Cancelled`] or [`VaultError::DeadlineExceeded`] if
    ///   `ctx` finishes first. When that happens while waiting for the lock,
    ///   renewing a cached client or restoring a persisted one, neither cache
    ///   is changed.
    #[instrument(
        skip_all,
        fields(consumer = %consumer.object_key(), cache_key = tracing::field::Empty)
    )]
    pub async fn get_client(
        &self,
        ctx: &RequestContext,
        consumer: &dyn VaultConsumer,
    ) -> VaultResult<Arc<dyn Client>> {
        let ctx = ctx.child_with_timeout(self.config.request_timeout);
        let object = consumer.object_key();

        let key = match self.deriver.derive(&ctx, consumer).await {
            Ok(key) if !key.is_empty() => key,
            Ok(_) => return Err(VaultError::config("client cache key cannot be empty")),
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Failed to derive client cache key");
                return Err(VaultError::config(format!("failed to derive client cache key: {e}")));
            }
        };
        tracing::Span::current().record("cache_key", tracing::field::display(&key));

        let _guard = ctx.run(async { Ok(self.locks.lock(key.as_str()).await) }).await?;

        let found = match self.clients.get(&key) {
            Some(client) => self.reuse(&ctx, client.as_ref()).await?.then_some(client),
            None => match self.restore(&ctx, &object, &key).await {
                Ok(restored) => restored,
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    self.track(&object, &key);
                    return Err(e);
                }
            },
        };

        self.track(&object, &key);
        if let Some(client) = found {
            debug!("Returning cached client");
            return Ok(client);
        }

        self.create(&ctx, consumer, &object, &key).await
    }

    /// Forget the cache key recorded for `consumer`.
    ///
    /// The client itself stays cached for other consumers sharing its key.
    pub fn remove_object(&self, consumer: &dyn VaultConsumer) -> bool {
        let object = consumer.object_key();
        let removed = self.object_keys.remove(&object);
        if removed {
            debug!(consumer = %object, "Removed object key mapping");
        }
        removed
    }

    fn track(&self, object: &ObjectKey, key: &CacheKey) {
        if let Some(previous) = self.object_keys.get(object) {
            if &previous != key && self.clients.remove(&previous) {
                info!(previous = %previous, "Cache key changed, evicted previous client");
                self.events.normal(
                    object,
                    Reason::VaultClientCacheEviction,
                    format!("Evicted client with stale cache key {previous}"),
                );
            }
        }
        self.object_keys.add(object.clone(), key.clone());
    }

    /// Whether a cached client can be handed out again. Only cancellation is
    /// returned as an error.
    async fn reuse(&self, ctx: &RequestContext, client: &dyn Client) -> VaultResult<bool> {
        match client.check_expiry(self.config.expiry_threshold) {
            Ok(true) => match client.renew(ctx).await {
                Ok(()) => Ok(true),
                Err(e) if e.is_cancellation() => Err(e),
                Err(e) => {
                    warn!(error = %e, "Failed to renew cached client");
                    Ok(false)
                }
            },
            Ok(false) => {
                debug!(
                    threshold = ?self.config.expiry_threshold,
                    "Cached client is close to expiry"
                );
                Ok(false)
            }
            Err(e) => {
                warn!(error = %e, "Cached client has no usable session");
                Ok(false)
            }
        }
    }

    /// Restoration failures fall through to a fresh login. Cancellation is
    /// returned before anything is cached; a failed record refresh is
    /// returned after the restored client is cached.
    async fn restore(
        &self,
        ctx: &RequestContext,
        object: &ObjectKey,
        key: &CacheKey,
    ) -> VaultResult<Option<Arc<dyn Client>>> {
        if !self.persistence.is_enabled() {
            return Ok(None);
        }
        let client = match self.persistence.restore(ctx, self.factory.as_ref(), key).await {
            Ok(Some(client)) => client,
            Ok(None) => return Ok(None),
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Failed to restore persisted client");
                self.events.warning(object, Reason::CacheRestorationFailed, e.to_string());
                return Ok(None);
            }
        };

        let refreshed = match self.persistence.refresh_record(ctx, client.as_ref()).await {
            Err(e) if e.is_cancellation() => return Err(e),
            other => other,
        };
        ctx.check()?;
        if let Err(e) = self.clients.add(Arc::clone(&client)) {
            warn!(error = %e, "Failed to cache restored client");
            self.events.warning(object, Reason::CacheRestorationFailed, e.to_string());
            return Ok(None);
        }
        info!("Restored cached client from storage");
        self.events.normal(
            object,
            Reason::CacheRestorationSucceeded,
            format!("Restored client with cache key {key}"),
        );

        if let Err(e) = refreshed {
            error!(error = %e, "Failed to refresh persisted client record");
            self.events.warning(object, Reason::VaultClientCacheCreation, e.to_string());
            return Err(persistence_failure(e));
        }
        Ok(Some(client))
    }

    async fn create(
        &self,
        ctx: &RequestContext,
        consumer: &dyn VaultConsumer,
        object: &ObjectKey,
        key: &CacheKey,
    ) -> VaultResult<Arc<dyn Client>> {
        let target = consumer.client_target(&self.config.operator_namespace);
        let client = self.factory.new_client(ctx, &target).await?;
        client.login(ctx).await?;

        let client_key = client.cache_key()?;
        if &client_key != key {
            warn!(client_key = %client_key, "Client was built with a different cache key");
        }
        if let Some(evicted) = self.clients.add(Arc::clone(&client))? {
            debug!(evicted = %evicted, "Client cache full, evicted least recently used client");
        }

        match self.persistence.persist(ctx, client.as_ref()).await {
            Ok(PersistOutcome::Skipped) => {}
            Ok(outcome) => {
                self.events.normal(
                    object,
                    Reason::VaultClientCacheCreation,
                    format!("Persisted client with cache key {client_key} ({outcome:?})"),
                );
            }
            Err(e) => {
                error!(error = %e, "Failed to persist client");
                self.events.warning(object, Reason::VaultClientCacheCreation, e.to_string());
                return Err(persistence_failure(e));
            }
        }

        info!("Logged in new client");
        Ok(client)
    }
}

fn persistence_failure(err: VaultError) -> VaultError {
    match err {
        VaultError::Persistence(_) => err,
        other => VaultError::Persistence(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceModel;
    use crate::events::TracingRecorder;
    use crate::model::{
        AuthMethod, ClientTarget, ObjectMeta, VaultAuth, VaultAuthSpec, VaultConnection,
        VaultConnectionSpec,
    };
    use crate::secrets::VaultSecret;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct StubClient {
        key: CacheKey,
        auth: VaultAuth,
        connection: VaultConnection,
        logins: Arc<AtomicUsize>,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl Client for StubClient {
        async fn login(&self, _ctx: &RequestContext) -> VaultResult<()> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn renew(&self, _ctx: &RequestContext) -> VaultResult<()> {
            Ok(())
        }
        async fn read(
            &self,
            _ctx: &RequestContext,
            _path: &str,
        ) -> VaultResult<Option<VaultSecret>> {
            Ok(None)
        }
        async fn write(
            &self,
            _ctx: &RequestContext,
            _path: &str,
            _body: serde_json::Value,
        ) -> VaultResult<Option<VaultSecret>> {
            Ok(None)
        }
        async fn restore(
            &self,
            _ctx: &RequestContext,
            _session: VaultSecret,
            _uid: &str,
        ) -> VaultResult<()> {
            Ok(())
        }
        fn check_expiry(&self, _offset: Duration) -> VaultResult<bool> {
            Ok(self.healthy.load(Ordering::SeqCst))
        }
        fn session(&self) -> VaultResult<VaultSecret> {
            Ok(VaultSecret::default())
        }
        fn cache_key(&self) -> VaultResult<CacheKey> {
            Ok(self.key.clone())
        }
        fn vault_auth(&self) -> &VaultAuth {
            &self.auth
        }
        fn vault_connection(&self) -> &VaultConnection {
            &self.connection
        }
        fn provider_uid(&self) -> &str {
            "provider-uid"
        }
        fn target_namespace(&self) -> &str {
            "tenant"
        }
    }

    #[derive(Default)]
    struct Shared {
        key: Mutex<CacheKey>,
        logins: Arc<AtomicUsize>,
        fail_login: AtomicBool,
    }

    struct StubDeriver(Arc<Shared>);

    #[async_trait]
    impl CacheKeyDeriver for StubDeriver {
        async fn derive(
            &self,
            _ctx: &RequestContext,
            _consumer: &dyn VaultConsumer,
        ) -> VaultResult<CacheKey> {
            Ok(self.0.key.lock().clone())
        }
    }

    struct StubFactory(Arc<Shared>);

    #[async_trait]
    impl ClientFactory for StubFactory {
        async fn new_client(
            &self,
            _ctx: &RequestContext,
            _target: &ClientTarget,
        ) -> VaultResult<Arc<dyn Client>> {
            if self.0.fail_login.load(Ordering::SeqCst) {
                return Err(VaultError::auth_failed("permission denied"));
            }
            Ok(Arc::new(StubClient {
                key: self.0.key.lock().clone(),
                auth: VaultAuth {
                    metadata: ObjectMeta::new("tenant", "default"),
                    spec: VaultAuthSpec {
                        method: AuthMethod::Kubernetes,
                        mount: "kubernetes".to_string(),
                        vault_connection_ref: String::new(),
                        namespace: None,
                        kubernetes: None,
                        app_role: None,
                        jwt: None,
                        vault_transit_ref: None,
                    },
                },
                connection: VaultConnection {
                    metadata: ObjectMeta::new("operator", "default"),
                    spec: VaultConnectionSpec::default(),
                },
                logins: Arc::clone(&self.0.logins),
                healthy: AtomicBool::new(true),
            }))
        }
    }

    struct Consumer(ObjectKey);

    impl VaultConsumer for Consumer {
        fn object_key(&self) -> ObjectKey {
            self.0.clone()
        }
        fn vault_auth_ref(&self) -> &str {
            ""
        }
    }

    fn manager(key: &str) -> (ClientCacheManager, Arc<Shared>) {
        let shared = Arc::new(Shared::default());
        *shared.key.lock() = CacheKey::new(key);
        let persistence = CachePersistence::new(
            Arc::new(MemoryStore::new()),
            Arc::new(TracingRecorder),
            PersistenceModel::None,
            "operator",
        );
        let manager = ClientCacheManager::new(
            ClientCacheConfig::new("operator"),
            Arc::new(StubDeriver(Arc::clone(&shared))),
            Arc::new(StubFactory(Arc::clone(&shared))),
            persistence,
            Arc::new(TracingRecorder),
        )
        .unwrap();
        (manager, shared)
    }

    #[tokio::test]
    async fn test_unchanged_consumer_logs_in_once() {
        let (manager, shared) = manager("kubernetes-aaa");
        let ctx = RequestContext::background();
        let consumer = Consumer(ObjectKey::new("tenant", "app"));

        let c1 = manager.get_client(&ctx, &consumer).await.unwrap();
        let c2 = manager.get_client(&ctx, &consumer).await.unwrap();
        assert_eq!(c1.cache_key().unwrap(), c2.cache_key().unwrap());
        assert_eq!(shared.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_changed_key_evicts_previous_client() {
        let (manager, shared) = manager("kubernetes-aaa");
        let ctx = RequestContext::background();
        let consumer = Consumer(ObjectKey::new("tenant", "app"));

        manager.get_client(&ctx, &consumer).await.unwrap();
        *shared.key.lock() = CacheKey::new("kubernetes-bbb");
        let client = manager.get_client(&ctx, &consumer).await.unwrap();

        assert_eq!(client.cache_key().unwrap(), CacheKey::new("kubernetes-bbb"));
        assert!(!manager.clients().contains(&CacheKey::new("kubernetes-aaa")));
        assert_eq!(shared.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_key_leaves_caches_untouched() {
        let (manager, _shared) = manager("");
        let ctx = RequestContext::background();
        let consumer = Consumer(ObjectKey::new("tenant", "app"));

        let err = manager.get_client(&ctx, &consumer).await.unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
        assert!(manager.clients().is_empty());
        assert!(manager.object_keys().is_empty());
    }

    #[tokio::test]
    async fn test_login_failure_is_propagated() {
        let (manager, shared) = manager("kubernetes-aaa");
        shared.fail_login.store(true, Ordering::SeqCst);
        let ctx = RequestContext::background();

        let err = manager
            .get_client(&ctx, &Consumer(ObjectKey::new("tenant", "app")))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::AuthenticationFailed(_)));
        assert!(manager.clients().is_empty());
    }

    #[tokio::test]
    async fn test_remove_object_keeps_shared_client() {
        let (manager, shared) = manager("kubernetes-aaa");
        let ctx = RequestContext::background();
        let first = Consumer(ObjectKey::new("tenant", "app-1"));
        let second = Consumer(ObjectKey::new("tenant", "app-2"));

        manager.get_client(&ctx, &first).await.unwrap();
        manager.get_client(&ctx, &second).await.unwrap();
        assert!(manager.remove_object(&first));
        assert!(!manager.remove_object(&first));

        manager.get_client(&ctx, &second).await.unwrap();
        assert_eq!(shared.logins.load(Ordering::SeqCst), 1);
        assert!(manager.clients().contains(&CacheKey::new("kubernetes-aaa")));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_login() {
        let (manager, shared) = manager("kubernetes-aaa");
        let manager = Arc::new(manager);
        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let consumer = Consumer(ObjectKey::new("tenant", format!("app-{i}")));
                manager.get_client(&RequestContext::background(), &consumer).await.map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(shared.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lock_wait_is_bounded_by_context() {
        let (manager, shared) = manager("kubernetes-aaa");
        let _held = manager.locks.lock("kubernetes-aaa").await;
        let ctx = RequestContext::with_timeout(Duration::from_millis(50));

        let err = manager
            .get_client(&ctx, &Consumer(ObjectKey::new("tenant", "app")))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::DeadlineExceeded(_)));
        assert!(manager.object_keys().is_empty());
        assert_eq!(shared.logins.load(Ordering::SeqCst), 0);
    }
}
