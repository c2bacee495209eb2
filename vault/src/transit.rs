//! Transit encryption of persisted sessions.

use crate::client::ClientFactory;
use crate::context::RequestContext;
use crate::error::{VaultError, VaultResult};
use crate::model::{ClientTarget, DEFAULT_REF_NAME, ObjectKey};
use crate::secrets::{TransitDecryptData, TransitEncryptData, VaultSecret};
use crate::store::ObjectStore;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Encrypts and decrypts with a named transit key.
#[async_trait]
pub trait Transit: Send + Sync {
    /// Encrypt `plaintext` with the key configured on `transit`.
    async fn encrypt(
        &self,
        ctx: &RequestContext,
        transit: &ObjectKey,
        plaintext: &[u8],
    ) -> VaultResult<Vec<u8>>;

    /// Decrypt `ciphertext` with the key configured on `transit`.
    async fn decrypt(
        &self,
        ctx: &RequestContext,
        transit: &ObjectKey,
        ciphertext: &[u8],
    ) -> VaultResult<Vec<u8>>;
}

/// [`Transit`] backed by the Vault transit secrets engine.
///
/// Each call logs in a dedicated client for the transit object's auth.
/// These clients never enter the client cache, so encrypting from inside
/// `get_client` cannot contend on the manager's locks.
#[derive(Clone)]
pub struct VaultTransitClient {
    store: Arc<dyn ObjectStore>,
    factory: Arc<dyn ClientFactory>,
    operator_namespace: String,
}

impl fmt::Debug for VaultTransitClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultTransitClient")
            .field("operator_namespace", &self.operator_namespace)
            .finish_non_exhaustive()
    }
}

impl VaultTransitClient {
    /// Create a transit client.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        factory: Arc<dyn ClientFactory>,
        operator_namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            factory,
            operator_namespace: operator_namespace.into(),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        ctx: &RequestContext,
        transit: &ObjectKey,
        operation: &'static str,
        body: serde_json::Value,
    ) -> VaultResult<T> {
        let store = self.store.as_ref();
        let obj = ctx
            .run(async { store.get_vault_transit(transit).await.map_err(VaultError::from) })
            .await?;

        let auth = ObjectKey::parse_ref(&obj.spec.vault_auth_ref, &obj.metadata.namespace)
            .unwrap_or_else(|| ObjectKey::new(&self.operator_namespace, DEFAULT_REF_NAME));
        let target = ClientTarget {
            auth,
            target_namespace: obj.metadata.namespace.clone(),
        };
        let client = self.factory.new_client(ctx, &target).await?;
        client.login(ctx).await?;

        let path = format!(
            "{}/{operation}/{}",
            obj.spec.mount.trim_matches('/'),
            obj.spec.key
        );
        let response = client
            .write(ctx, &path, body)
            .await?
            .ok_or_else(|| VaultError::transit(operation, format!("empty response from {path}")))?;
        decode_data(operation, response)
    }
}

fn decode_data<T: DeserializeOwned>(
    operation: &'static str,
    response: VaultSecret,
) -> VaultResult<T> {
    let data = response
        .data
        .ok_or_else(|| VaultError::transit(operation, "response carries no data"))?;
    serde_json::from_value(serde_json::Value::Object(data))
        .map_err(|e| VaultError::transit(operation, e.to_string()))
}

#[async_trait]
impl Transit for VaultTransitClient {
    #[instrument(skip(self, ctx, plaintext), fields(transit = %transit, bytes = plaintext.len()))]
    async fn encrypt(
        &self,
        ctx: &RequestContext,
        transit: &ObjectKey,
        plaintext: &[u8],
    ) -> VaultResult<Vec<u8>> {
        let body = json!({ "plaintext": STANDARD.encode(plaintext) });
        let data: TransitEncryptData = self
            .call(ctx, transit, "encrypt", body)
            .await
            .map_err(|e| as_transit_error("encrypt", e))?;
        debug!("Encrypted with transit");
        Ok(data.ciphertext.into_bytes())
    }

    #[instrument(skip(self, ctx, ciphertext), fields(transit = %transit, bytes = ciphertext.len()))]
    async fn decrypt(
        &self,
        ctx: &RequestContext,
        transit: &ObjectKey,
        ciphertext: &[u8],
    ) -> VaultResult<Vec<u8>> {
        let ciphertext = std::str::from_utf8(ciphertext)
            .map_err(|e| VaultError::transit("decrypt", e.to_string()))?;
        let body = json!({ "ciphertext": ciphertext });
        let data: TransitDecryptData = self
            .call(ctx, transit, "decrypt", body)
            .await
            .map_err(|e| as_transit_error("decrypt", e))?;
        let plaintext = STANDARD
            .decode(data.plaintext.as_bytes())
            .map_err(|e| VaultError::transit("decrypt", e.to_string()))?;
        debug!("Decrypted with transit");
        Ok(plaintext)
    }
}

fn as_transit_error(operation: &'static str, err: VaultError) -> VaultError {
    match err {
        VaultError::Transit { .. } | VaultError::Cancelled | VaultError::DeadlineExceeded(_) => err,
        other => VaultError::transit(operation, other.to_string()),
    }
}
