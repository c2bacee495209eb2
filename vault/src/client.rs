//! Vault clients.
//!
//! A [`Client`] is one authenticated session. [`VaultClient`] talks to the
//! Vault HTTP API with reqwest; [`VaultClientFactory`] resolves the auth,
//! connection and credential provider a client is bound to.

use crate::cache_key::{CacheKey, compute_cache_key};
use crate::context::RequestContext;
use crate::error::{VaultError, VaultResult};
use crate::model::{ClientTarget, VaultAuth, VaultConnection};
use crate::provider::CredentialProvider;
use crate::secrets::VaultSecret;
use crate::store::ObjectStore;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use reqwest::{Method, StatusCode};
use rust_common::{HttpConfig, build_http_client};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// One authenticated Vault session.
#[async_trait]
pub trait Client: Send + Sync + fmt::Debug {
    /// Authenticate with the bound credential provider.
    async fn login(&self, ctx: &RequestContext) -> VaultResult<()>;

    /// Renew the session token.
    async fn renew(&self, ctx: &RequestContext) -> VaultResult<()>;

    /// Read `path`.
    async fn read(&self, ctx: &RequestContext, path: &str) -> VaultResult<Option<VaultSecret>>;

    /// Write `body` to `path`.
    async fn write(
        &self,
        ctx: &RequestContext,
        path: &str,
        body: serde_json::Value,
    ) -> VaultResult<Option<VaultSecret>>;

    /// Adopt a previously serialized session.
    ///
    /// Fails if `provider_uid` does not match this client's provider or the
    /// session is no longer valid.
    async fn restore(
        &self,
        ctx: &RequestContext,
        session: VaultSecret,
        provider_uid: &str,
    ) -> VaultResult<()>;

    /// Whether the session remains valid for longer than `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has no session.
    fn check_expiry(&self, offset: Duration) -> VaultResult<bool>;

    /// Serialized form of the current session.
    ///
    /// # Errors
    ///
    /// Returns an error if the client has no session.
    fn session(&self) -> VaultResult<VaultSecret>;

    /// Cache key, fixed for the lifetime of the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be computed.
    fn cache_key(&self) -> VaultResult<CacheKey>;

    /// Auth object the client was built from.
    fn vault_auth(&self) -> &VaultAuth;

    /// Connection object the client was built from.
    fn vault_connection(&self) -> &VaultConnection;

    /// UID of the credential provider.
    fn provider_uid(&self) -> &str;

    /// Namespace the credential provider was resolved in.
    fn target_namespace(&self) -> &str;
}

/// Builds unauthenticated clients for a target.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Build a client bound to `target`. The client is not logged in.
    async fn new_client(
        &self,
        ctx: &RequestContext,
        target: &ClientTarget,
    ) -> VaultResult<Arc<dyn Client>>;
}

struct Session {
    secret: VaultSecret,
    token: SecretString,
    expires_at: DateTime<Utc>,
    renewable: bool,
}

/// Vault HTTP client bound to one auth, connection and provider.
pub struct VaultClient {
    http: reqwest::Client,
    address: String,
    auth: VaultAuth,
    connection: VaultConnection,
    provider: CredentialProvider,
    target_namespace: String,
    cache_key: CacheKey,
    session: RwLock<Option<Session>>,
}

impl fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultClient")
            .field("address", &self.address)
            .field("auth", &self.auth.metadata.key())
            .field("cache_key", &self.cache_key)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

impl VaultClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache key cannot be computed or the HTTP
    /// client cannot be built from the connection settings.
    pub fn new(
        http: &HttpConfig,
        auth: VaultAuth,
        connection: VaultConnection,
        provider: CredentialProvider,
        target_namespace: impl Into<String>,
    ) -> VaultResult<Self> {
        let cache_key = compute_cache_key(&auth, &connection, provider.uid())?;
        let http_config = http
            .clone()
            .with_skip_tls_verify(http.skip_tls_verify || connection.spec.skip_tls_verify)
            .with_headers(connection.spec.headers.clone());
        let http = build_http_client(&http_config)?;
        let address = connection.spec.address.trim_end_matches('/').to_string();

        Ok(Self {
            http,
            address,
            auth,
            connection,
            provider,
            target_namespace: target_namespace.into(),
            cache_key,
            session: RwLock::new(None),
        })
    }

    fn token(&self) -> VaultResult<SecretString> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.token.clone())
            .ok_or_else(|| VaultError::client("client is not logged in"))
    }

    fn set_session(&self, secret: VaultSecret, ttl: u64, renewable: bool) -> VaultResult<()> {
        let token = secret
            .auth
            .as_ref()
            .map(|a| a.client_token.clone())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| VaultError::client("response carries no client token"))?;
        let expires_at = i64::try_from(ttl)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        *self.session.write() = Some(Session {
            secret,
            token: SecretString::from(token),
            expires_at,
            renewable,
        });
        Ok(())
    }

    async fn request(
        &self,
        ctx: &RequestContext,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        token: Option<&SecretString>,
    ) -> VaultResult<Option<VaultSecret>> {
        let url = format!("{}/v1/{}", self.address, path.trim_start_matches('/'));
        let mut request = self.http.request(method, &url);
        if let Some(token) = token {
            request = request.header("X-Vault-Token", token.expose_secret());
        }
        if let Some(ns) = self.auth.spec.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            request = request.header("X-Vault-Namespace", ns);
        }
        if let Some(b) = body {
            request = request.json(&b);
        }

        let response = ctx
            .run(async {
                request.send().await.map_err(|e| VaultError::unavailable(e.to_string()))
            })
            .await?;

        let status = response.status();
        match status.as_u16() {
            404 => return Err(VaultError::not_found(path)),
            403 => return Err(VaultError::PermissionDenied(path.to_string())),
            429 => return Err(VaultError::RateLimited),
            s if s >= 500 => {
                let text = response.text().await.unwrap_or_default();
                return Err(VaultError::unavailable(format!("Status {status}: {text}")));
            }
            _ if !status.is_success() => {
                let text = response.text().await.unwrap_or_default();
                return Err(VaultError::client(format!("Status {status}: {text}")));
            }
            _ => {}
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let secret = ctx
            .run(async { response.json::<VaultSecret>().await.map_err(VaultError::from) })
            .await?;
        Ok(Some(secret))
    }
}

#[async_trait]
impl Client for VaultClient {
    #[instrument(
        skip(self, ctx),
        fields(cache_key = %self.cache_key, method = %self.provider.method())
    )]
    async fn login(&self, ctx: &RequestContext) -> VaultResult<()> {
        let path = format!("auth/{}/login", self.auth.spec.mount.trim_matches('/'));
        let secret = self
            .request(ctx, Method::POST, &path, Some(self.provider.login_body()), None)
            .await
            .map_err(|e| match e {
                VaultError::Unavailable(_)
                | VaultError::RateLimited
                | VaultError::Cancelled
                | VaultError::DeadlineExceeded(_) => e,
                other => VaultError::auth_failed(other.to_string()),
            })?
            .ok_or_else(|| VaultError::auth_failed("empty login response"))?;

        let (ttl, renewable) = secret
            .auth
            .as_ref()
            .map(|a| (a.lease_duration, a.renewable))
            .ok_or_else(|| VaultError::auth_failed("login response carries no auth"))?;
        self.set_session(secret, ttl, renewable)
            .map_err(|e| VaultError::auth_failed(e.to_string()))?;

        info!(ttl_secs = ttl, "Authenticated with Vault");
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(cache_key = %self.cache_key))]
    async fn renew(&self, ctx: &RequestContext) -> VaultResult<()> {
        let renewable = self
            .session
            .read()
            .as_ref()
            .map(|s| s.renewable)
            .ok_or_else(|| VaultError::client("client is not logged in"))?;
        if !renewable {
            debug!("Vault token is not renewable, skipping renewal");
            return Ok(());
        }
        let token = self.token()?;
        let secret = self
            .request(
                ctx,
                Method::POST,
                "auth/token/renew-self",
                Some(serde_json::json!({})),
                Some(&token),
            )
            .await?
            .ok_or_else(|| VaultError::client("empty token renewal response"))?;
        let (ttl, renewable) = secret
            .auth
            .as_ref()
            .map(|a| (a.lease_duration, a.renewable))
            .ok_or_else(|| VaultError::client("token renewal response carries no auth"))?;
        self.set_session(secret, ttl, renewable)?;

        debug!(ttl_secs = ttl, "Renewed Vault token");
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(cache_key = %self.cache_key))]
    async fn read(&self, ctx: &RequestContext, path: &str) -> VaultResult<Option<VaultSecret>> {
        let token = self.token()?;
        self.request(ctx, Method::GET, path, None, Some(&token)).await
    }

    #[instrument(skip(self, ctx, body), fields(cache_key = %self.cache_key))]
    async fn write(
        &self,
        ctx: &RequestContext,
        path: &str,
        body: serde_json::Value,
    ) -> VaultResult<Option<VaultSecret>> {
        let token = self.token()?;
        self.request(ctx, Method::PUT, path, Some(body), Some(&token)).await
    }

    #[instrument(skip(self, ctx, session), fields(cache_key = %self.cache_key))]
    async fn restore(
        &self,
        ctx: &RequestContext,
        session: VaultSecret,
        provider_uid: &str,
    ) -> VaultResult<()> {
        if provider_uid != self.provider.uid() {
            return Err(VaultError::restoration(format!(
                "credential provider UID mismatch, expected={}, actual={provider_uid}",
                self.provider.uid()
            )));
        }
        let token = session
            .auth
            .as_ref()
            .map(|a| a.client_token.clone())
            .filter(|t| !t.is_empty())
            .map(SecretString::from)
            .ok_or_else(|| VaultError::restoration("persisted session carries no client token"))?;

        let lookup = self
            .request(ctx, Method::GET, "auth/token/lookup-self", None, Some(&token))
            .await
            .map_err(|e| VaultError::restoration(format!("token lookup failed: {e}")))?
            .ok_or_else(|| VaultError::restoration("empty token lookup response"))?;
        let ttl = lookup.data_u64("ttl").unwrap_or_default();
        if ttl == 0 {
            warn!("Persisted Vault token has expired");
            return Err(VaultError::restoration("persisted token has expired"));
        }
        let renewable = lookup
            .data
            .as_ref()
            .and_then(|d| d.get("renewable"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or_else(|| session.auth.as_ref().is_some_and(|a| a.renewable));

        self.set_session(session, ttl, renewable)?;
        info!(ttl_secs = ttl, "Restored Vault session");
        Ok(())
    }

    fn check_expiry(&self, offset: Duration) -> VaultResult<bool> {
        let session = self.session.read();
        let session = session
            .as_ref()
            .ok_or_else(|| VaultError::client("client is not logged in"))?;
        let offset = TimeDelta::from_std(offset).map_err(|e| VaultError::config(e.to_string()))?;
        Ok(Utc::now() + offset < session.expires_at)
    }

    fn session(&self) -> VaultResult<VaultSecret> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.secret.clone())
            .ok_or_else(|| VaultError::client("client is not logged in"))
    }

    fn cache_key(&self) -> VaultResult<CacheKey> {
        Ok(self.cache_key.clone())
    }

    fn vault_auth(&self) -> &VaultAuth {
        &self.auth
    }

    fn vault_connection(&self) -> &VaultConnection {
        &self.connection
    }

    fn provider_uid(&self) -> &str {
        self.provider.uid()
    }

    fn target_namespace(&self) -> &str {
        &self.target_namespace
    }
}

/// Factory resolving client targets through the object store.
#[derive(Clone)]
pub struct VaultClientFactory {
    store: Arc<dyn ObjectStore>,
    http: HttpConfig,
    operator_namespace: String,
}

impl fmt::Debug for VaultClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultClientFactory")
            .field("http", &self.http)
            .field("operator_namespace", &self.operator_namespace)
            .finish_non_exhaustive()
    }
}

impl VaultClientFactory {
    /// Create a factory.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        http: HttpConfig,
        operator_namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            http,
            operator_namespace: operator_namespace.into(),
        }
    }
}

#[async_trait]
impl ClientFactory for VaultClientFactory {
    #[instrument(skip(self, ctx), fields(auth = %target.auth))]
    async fn new_client(
        &self,
        ctx: &RequestContext,
        target: &ClientTarget,
    ) -> VaultResult<Arc<dyn Client>> {
        let store = self.store.as_ref();
        let auth = ctx
            .run(async { store.get_vault_auth(&target.auth).await.map_err(VaultError::from) })
            .await?;
        let conn_key = auth.connection_key(&self.operator_namespace);
        let connection = ctx
            .run(async { store.get_vault_connection(&conn_key).await.map_err(VaultError::from) })
            .await?;
        let provider =
            CredentialProvider::resolve(ctx, store, &auth, &target.target_namespace).await?;

        let client =
            VaultClient::new(&self.http, auth, connection, provider, &target.target_namespace)?;
        debug!(cache_key = %client.cache_key, "Built Vault client");
        Ok(Arc::new(client))
    }
}
