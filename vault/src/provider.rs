//! Credential providers for the supported auth methods.
//!
//! The provider UID is part of the cache key: a recreated service account
//! or a replaced AppRole secret yields a new key and therefore a new session.

use crate::context::RequestContext;
use crate::error::{VaultError, VaultResult};
use crate::model::{AuthMethod, ObjectKey, VaultAuth};
use crate::store::ObjectStore;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::fmt;

/// Secret key holding the AppRole secret ID.
pub const APPROLE_SECRET_ID_KEY: &str = "id";

/// Secret key holding an externally issued JWT.
pub const JWT_TOKEN_KEY: &str = "jwt";

/// Login credentials for one auth method.
#[derive(Clone)]
pub enum CredentialProvider {
    /// Kubernetes service account token
    Kubernetes {
        /// Vault role
        role: String,
        /// Service account UID
        uid: String,
        /// Requested service account token
        token: SecretString,
    },
    /// AppRole role ID and secret ID
    AppRole {
        /// Role ID
        role_id: String,
        /// UID of the secret holding the secret ID
        uid: String,
        /// Secret ID
        secret_id: SecretString,
    },
    /// JWT from a secret
    Jwt {
        /// Vault role
        role: String,
        /// UID of the secret holding the token
        uid: String,
        /// Token
        token: SecretString,
    },
}

impl fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialProvider")
            .field("method", &self.method())
            .field("uid", &self.uid())
            .finish_non_exhaustive()
    }
}

impl CredentialProvider {
    /// Resolve the provider for `auth` in `target_namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Config`] when the auth spec lacks the settings
    /// for its method, or a store error when a referenced object is missing.
    pub async fn resolve(
        ctx: &RequestContext,
        store: &dyn ObjectStore,
        auth: &VaultAuth,
        target_namespace: &str,
    ) -> VaultResult<Self> {
        let missing = |what: &str| {
            VaultError::config(format!(
                "VaultAuth {} uses method {} but has no {what} settings",
                auth.metadata.key(),
                auth.spec.method
            ))
        };

        match auth.spec.method {
            AuthMethod::Kubernetes => {
                let k8s = auth.spec.kubernetes.as_ref().ok_or_else(|| missing("kubernetes"))?;
                let sa_key = ObjectKey::new(target_namespace, &k8s.service_account);
                let sa = ctx
                    .run(async {
                        store.get_service_account(&sa_key).await.map_err(VaultError::from)
                    })
                    .await?;
                let token = ctx
                    .run(async {
                        store
                            .create_service_account_token(&sa_key, &k8s.audiences)
                            .await
                            .map_err(VaultError::from)
                    })
                    .await?;
                Ok(Self::Kubernetes {
                    role: k8s.role.clone(),
                    uid: sa.metadata.uid,
                    token: SecretString::from(token),
                })
            }
            AuthMethod::AppRole => {
                let app_role = auth.spec.app_role.as_ref().ok_or_else(|| missing("appRole"))?;
                let (uid, secret_id) = secret_field(
                    ctx,
                    store,
                    target_namespace,
                    &app_role.secret_ref,
                    APPROLE_SECRET_ID_KEY,
                )
                .await?;
                Ok(Self::AppRole {
                    role_id: app_role.role_id.clone(),
                    uid,
                    secret_id,
                })
            }
            AuthMethod::Jwt => {
                let jwt = auth.spec.jwt.as_ref().ok_or_else(|| missing("jwt"))?;
                let (uid, token) =
                    secret_field(ctx, store, target_namespace, &jwt.secret_ref, JWT_TOKEN_KEY)
                        .await?;
                Ok(Self::Jwt {
                    role: jwt.role.clone(),
                    uid,
                    token,
                })
            }
        }
    }

    /// UID of the object backing the credentials, without minting a token.
    ///
    /// # Errors
    ///
    /// Same as [`CredentialProvider::resolve`].
    pub async fn resolve_uid(
        ctx: &RequestContext,
        store: &dyn ObjectStore,
        auth: &VaultAuth,
        target_namespace: &str,
    ) -> VaultResult<String> {
        let name = match auth.spec.method {
            AuthMethod::Kubernetes => {
                let k8s = auth.spec.kubernetes.as_ref().ok_or_else(|| {
                    VaultError::config(format!(
                        "VaultAuth {} has no kubernetes settings",
                        auth.metadata.key()
                    ))
                })?;
                let sa_key = ObjectKey::new(target_namespace, &k8s.service_account);
                let sa = ctx
                    .run(async {
                        store.get_service_account(&sa_key).await.map_err(VaultError::from)
                    })
                    .await?;
                return Ok(sa.metadata.uid);
            }
            AuthMethod::AppRole => auth.spec.app_role.as_ref().map(|a| a.secret_ref.as_str()),
            AuthMethod::Jwt => auth.spec.jwt.as_ref().map(|j| j.secret_ref.as_str()),
        }
        .ok_or_else(|| {
            VaultError::config(format!(
                "VaultAuth {} has no {} settings",
                auth.metadata.key(),
                auth.spec.method
            ))
        })?;
        let key = ObjectKey::new(target_namespace, name);
        let secret = ctx
            .run(async { store.get_secret(&key).await.map_err(VaultError::from) })
            .await?;
        Ok(secret.metadata.uid)
    }

    /// Auth method this provider logs in with.
    #[must_use]
    pub const fn method(&self) -> AuthMethod {
        match self {
            Self::Kubernetes { .. } => AuthMethod::Kubernetes,
            Self::AppRole { .. } => AuthMethod::AppRole,
            Self::Jwt { .. } => AuthMethod::Jwt,
        }
    }

    /// UID of the object backing these credentials.
    #[must_use]
    pub fn uid(&self) -> &str {
        match self {
            Self::Kubernetes { uid, .. } | Self::AppRole { uid, .. } | Self::Jwt { uid, .. } => uid,
        }
    }

    /// Request body for `auth/<mount>/login`.
    #[must_use]
    pub fn login_body(&self) -> serde_json::Value {
        match self {
            Self::Kubernetes { role, token, .. } | Self::Jwt { role, token, .. } => json!({
                "role": role,
                "jwt": token.expose_secret(),
            }),
            Self::AppRole {
                role_id, secret_id, ..
            } => json!({
                "role_id": role_id,
                "secret_id": secret_id.expose_secret(),
            }),
        }
    }
}

async fn secret_field(
    ctx: &RequestContext,
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
    field: &str,
) -> VaultResult<(String, SecretString)> {
    let key = ObjectKey::new(namespace, name);
    let secret = ctx.run(async { store.get_secret(&key).await.map_err(VaultError::from) }).await?;
    let value = secret
        .data
        .get(field)
        .ok_or_else(|| VaultError::config(format!("Secret {key} has no {field} field")))?;
    let value = String::from_utf8(value.clone())
        .map_err(|e| VaultError::config(format!("Secret {key} field {field}: {e}")))?;
    Ok((secret.metadata.uid, SecretString::from(value.trim().to_string())))
}
