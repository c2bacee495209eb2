//! Mock implementations for testing.
//!
//! [`MockVault`] is the shared backend state: every [`MockClient`] built by
//! a [`MockClientFactory`] talks to the same instance, so tests can count
//! logins across clients and script read/write responses per path.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use vault_client_cache::client::{Client, ClientFactory};
use vault_client_cache::events::{EventRecorder, EventType, Reason};
use vault_client_cache::model::{ClientTarget, ObjectKey, VaultAuth, VaultConnection};
use vault_client_cache::secrets::SecretAuth;
use vault_client_cache::store::MemoryStore;
use vault_client_cache::transit::Transit;
use vault_client_cache::{
    CacheKey, CredentialProvider, RequestContext, VaultError, VaultResult, VaultSecret,
    compute_cache_key,
};

/// Default token TTL handed out by [`MockVault`].
pub const MOCK_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Scripted Vault backend shared by mock clients.
#[derive(Debug)]
pub struct MockVault {
    logins: AtomicUsize,
    renewals: AtomicUsize,
    restores: AtomicUsize,
    fail_login: AtomicBool,
    reject_restore: AtomicBool,
    token_ttl: Mutex<Duration>,
    reads: Mutex<HashMap<String, VaultSecret>>,
    writes: Mutex<HashMap<String, Result<VaultSecret, String>>>,
    cancelled_writes: Mutex<Vec<String>>,
    read_log: Mutex<Vec<String>>,
    write_log: Mutex<Vec<(String, serde_json::Value)>>,
}

impl Default for MockVault {
    fn default() -> Self {
        Self {
            logins: AtomicUsize::new(0),
            renewals: AtomicUsize::new(0),
            restores: AtomicUsize::new(0),
            fail_login: AtomicBool::new(false),
            reject_restore: AtomicBool::new(false),
            token_ttl: Mutex::new(MOCK_TOKEN_TTL),
            reads: Mutex::new(HashMap::new()),
            writes: Mutex::new(HashMap::new()),
            cancelled_writes: Mutex::new(Vec::new()),
            read_log: Mutex::new(Vec::new()),
            write_log: Mutex::new(Vec::new()),
        }
    }
}

impl MockVault {
    /// Create a new shared backend.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Respond to reads of `path` with `secret`.
    pub fn set_read(&self, path: &str, secret: VaultSecret) {
        self.reads.lock().insert(path.to_string(), secret);
    }

    /// Respond to writes to `path` with `secret`.
    pub fn set_write(&self, path: &str, secret: VaultSecret) {
        self.writes.lock().insert(path.to_string(), Ok(secret));
    }

    /// Fail writes to `path` with `message`.
    pub fn fail_write(&self, path: &str, message: &str) {
        self.writes.lock().insert(path.to_string(), Err(message.to_string()));
    }

    /// Cancel the caller's context from inside writes to `path`.
    pub fn cancel_write(&self, path: &str) {
        self.cancelled_writes.lock().push(path.to_string());
    }

    /// Make logins fail.
    pub fn set_fail_login(&self, fail: bool) {
        self.fail_login.store(fail, Ordering::SeqCst);
    }

    /// Make restores fail as if the persisted token had been revoked.
    pub fn set_reject_restore(&self, reject: bool) {
        self.reject_restore.store(reject, Ordering::SeqCst);
    }

    /// TTL of tokens issued from now on.
    pub fn set_token_ttl(&self, ttl: Duration) {
        *self.token_ttl.lock() = ttl;
    }

    /// Number of successful logins.
    #[must_use]
    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    /// Number of token renewals.
    #[must_use]
    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    /// Number of successful restores.
    #[must_use]
    pub fn restores(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    /// Number of reads of `path`.
    #[must_use]
    pub fn reads_of(&self, path: &str) -> usize {
        self.read_log.lock().iter().filter(|p| *p == path).count()
    }

    /// Bodies written to `path`, oldest first.
    #[must_use]
    pub fn writes_to(&self, path: &str) -> Vec<serde_json::Value> {
        self.write_log
            .lock()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, body)| body.clone())
            .collect()
    }

    fn ttl(&self) -> Duration {
        *self.token_ttl.lock()
    }
}

fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Client backed by a [`MockVault`].
#[derive(Debug)]
pub struct MockClient {
    key: CacheKey,
    auth: VaultAuth,
    connection: VaultConnection,
    provider_uid: String,
    target_namespace: String,
    vault: Arc<MockVault>,
    session: Mutex<Option<(VaultSecret, DateTime<Utc>)>>,
}

impl MockClient {
    /// Create a client that is not logged in.
    #[must_use]
    pub fn new(
        key: CacheKey,
        auth: VaultAuth,
        connection: VaultConnection,
        provider_uid: impl Into<String>,
        target_namespace: impl Into<String>,
        vault: Arc<MockVault>,
    ) -> Self {
        Self {
            key,
            auth,
            connection,
            provider_uid: provider_uid.into(),
            target_namespace: target_namespace.into(),
            vault,
            session: Mutex::new(None),
        }
    }

    fn require_session(&self) -> VaultResult<()> {
        if self.session.lock().is_some() {
            Ok(())
        } else {
            Err(VaultError::client("client is not logged in"))
        }
    }
}

#[async_trait]
impl Client for MockClient {
    async fn login(&self, _ctx: &RequestContext) -> VaultResult<()> {
        if self.vault.fail_login.load(Ordering::SeqCst) {
            return Err(VaultError::auth_failed("permission denied"));
        }
        let n = self.vault.logins.fetch_add(1, Ordering::SeqCst) + 1;
        let ttl = self.vault.ttl();
        let secret = VaultSecret {
            request_id: format!("login-{n}"),
            auth: Some(SecretAuth {
                client_token: format!("token-{n}"),
                accessor: format!("accessor-{n}"),
                lease_duration: ttl.as_secs(),
                renewable: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        *self.session.lock() = Some((secret, expiry_after(ttl)));
        Ok(())
    }

    async fn renew(&self, _ctx: &RequestContext) -> VaultResult<()> {
        let ttl = self.vault.ttl();
        let mut session = self.session.lock();
        let (_, expires_at) = session
            .as_mut()
            .ok_or_else(|| VaultError::client("client is not logged in"))?;
        *expires_at = expiry_after(ttl);
        self.vault.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, _ctx: &RequestContext, path: &str) -> VaultResult<Option<VaultSecret>> {
        self.require_session()?;
        self.vault.read_log.lock().push(path.to_string());
        Ok(self.vault.reads.lock().get(path).cloned())
    }

    async fn write(
        &self,
        ctx: &RequestContext,
        path: &str,
        body: serde_json::Value,
    ) -> VaultResult<Option<VaultSecret>> {
        self.require_session()?;
        if self.vault.cancelled_writes.lock().iter().any(|p| p == path) {
            ctx.cancel();
            ctx.check()?;
        }
        self.vault.write_log.lock().push((path.to_string(), body));
        match self.vault.writes.lock().get(path) {
            Some(Ok(secret)) => Ok(Some(secret.clone())),
            Some(Err(message)) => Err(VaultError::client(message.clone())),
            None => Ok(None),
        }
    }

    async fn restore(
        &self,
        _ctx: &RequestContext,
        session: VaultSecret,
        provider_uid: &str,
    ) -> VaultResult<()> {
        if provider_uid != self.provider_uid {
            return Err(VaultError::restoration(format!(
                "credential provider changed from {provider_uid} to {}",
                self.provider_uid
            )));
        }
        if self.vault.reject_restore.load(Ordering::SeqCst) {
            return Err(VaultError::auth_failed("token revoked"));
        }
        if session.auth.is_none() {
            return Err(VaultError::restoration("session has no token"));
        }
        *self.session.lock() = Some((session, expiry_after(self.vault.ttl())));
        self.vault.restores.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn check_expiry(&self, offset: Duration) -> VaultResult<bool> {
        let session = self.session.lock();
        let (_, expires_at) = session
            .as_ref()
            .ok_or_else(|| VaultError::client("client is not logged in"))?;
        let offset = TimeDelta::from_std(offset).map_err(|e| VaultError::config(e.to_string()))?;
        Ok(Utc::now().checked_add_signed(offset).is_some_and(|t| t < *expires_at))
    }

    fn session(&self) -> VaultResult<VaultSecret> {
        self.session
            .lock()
            .as_ref()
            .map(|(secret, _)| secret.clone())
            .ok_or_else(|| VaultError::client("client is not logged in"))
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
        &self.provider_uid
    }

    fn target_namespace(&self) -> &str {
        &self.target_namespace
    }
}

/// Factory resolving targets through a [`MemoryStore`] into [`MockClient`]s.
///
/// Cache keys are computed exactly as the production factory does, so spec
/// changes in the store produce new keys.
#[derive(Debug)]
pub struct MockClientFactory {
    store: Arc<MemoryStore>,
    vault: Arc<MockVault>,
    operator_namespace: String,
    built: AtomicUsize,
}

impl MockClientFactory {
    /// Create a factory.
    #[must_use]
    pub fn new(
        store: Arc<MemoryStore>,
        vault: Arc<MockVault>,
        operator_namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            vault,
            operator_namespace: operator_namespace.into(),
            built: AtomicUsize::new(0),
        }
    }

    /// Number of clients built so far.
    #[must_use]
    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn new_client(
        &self,
        ctx: &RequestContext,
        target: &ClientTarget,
    ) -> VaultResult<Arc<dyn Client>> {
        use vault_client_cache::store::ObjectStore;

        let auth = self.store.get_vault_auth(&target.auth).await?;
        let connection = self
            .store
            .get_vault_connection(&auth.connection_key(&self.operator_namespace))
            .await?;
        let provider_uid = CredentialProvider::resolve_uid(
            ctx,
            self.store.as_ref(),
            &auth,
            &target.target_namespace,
        )
        .await?;
        let key = compute_cache_key(&auth, &connection, &provider_uid)?;
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockClient::new(
            key,
            auth,
            connection,
            provider_uid,
            &target.target_namespace,
            Arc::clone(&self.vault),
        )))
    }
}

/// Ciphertext prefix produced by [`MockTransit`].
pub const MOCK_CIPHERTEXT_PREFIX: &str = "vault:v1:";

/// Reversible transit stand-in.
#[derive(Debug, Default)]
pub struct MockTransit {
    encrypts: AtomicUsize,
    decrypts: AtomicUsize,
    fail_encrypt: AtomicBool,
    fail_decrypt: AtomicBool,
    cancel_on_decrypt: AtomicBool,
}

impl MockTransit {
    /// Create a transit mock.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make encryption fail.
    pub fn set_fail_encrypt(&self, fail: bool) {
        self.fail_encrypt.store(fail, Ordering::SeqCst);
    }

    /// Make decryption fail.
    pub fn set_fail_decrypt(&self, fail: bool) {
        self.fail_decrypt.store(fail, Ordering::SeqCst);
    }

    /// Cancel the caller's context from inside decryption.
    pub fn set_cancel_on_decrypt(&self, cancel: bool) {
        self.cancel_on_decrypt.store(cancel, Ordering::SeqCst);
    }

    /// Number of successful encryptions.
    #[must_use]
    pub fn encrypts(&self) -> usize {
        self.encrypts.load(Ordering::SeqCst)
    }

    /// Number of successful decryptions.
    #[must_use]
    pub fn decrypts(&self) -> usize {
        self.decrypts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transit for MockTransit {
    async fn encrypt(
        &self,
        _ctx: &RequestContext,
        transit: &ObjectKey,
        plaintext: &[u8],
    ) -> VaultResult<Vec<u8>> {
        if self.fail_encrypt.load(Ordering::SeqCst) {
            return Err(VaultError::transit("encrypt", format!("key {transit} is unavailable")));
        }
        self.encrypts.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{MOCK_CIPHERTEXT_PREFIX}{}", STANDARD.encode(plaintext)).into_bytes())
    }

    async fn decrypt(
        &self,
        ctx: &RequestContext,
        transit: &ObjectKey,
        ciphertext: &[u8],
    ) -> VaultResult<Vec<u8>> {
        if self.cancel_on_decrypt.load(Ordering::SeqCst) {
            ctx.cancel();
            ctx.check()?;
        }
        if self.fail_decrypt.load(Ordering::SeqCst) {
            return Err(VaultError::transit("decrypt", format!("key {transit} is unavailable")));
        }
        let text = std::str::from_utf8(ciphertext)
            .map_err(|e| VaultError::transit("decrypt", e.to_string()))?;
        let encoded = text
            .strip_prefix(MOCK_CIPHERTEXT_PREFIX)
            .ok_or_else(|| VaultError::transit("decrypt", "invalid ciphertext"))?;
        let plaintext = STANDARD
            .decode(encoded)
            .map_err(|e| VaultError::transit("decrypt", e.to_string()))?;
        self.decrypts.fetch_add(1, Ordering::SeqCst);
        Ok(plaintext)
    }
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// Object the event was recorded against
    pub object: ObjectKey,
    /// Event type
    pub event_type: EventType,
    /// Reason
    pub reason: Reason,
    /// Message
    pub message: String,
}

/// Event recorder that keeps everything in memory.
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    /// Create a recorder.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Reasons of all events, oldest first.
    #[must_use]
    pub fn reasons(&self) -> Vec<Reason> {
        self.events.lock().iter().map(|e| e.reason).collect()
    }

    /// Number of events with `reason`.
    #[must_use]
    pub fn count(&self, reason: Reason) -> usize {
        self.events.lock().iter().filter(|e| e.reason == reason).count()
    }

    /// Forget all events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventRecorder for RecordingEvents {
    fn record(&self, object: &ObjectKey, event_type: EventType, reason: Reason, message: String) {
        self.events.lock().push(RecordedEvent {
            object: object.clone(),
            event_type,
            reason,
            message,
        });
    }
}
