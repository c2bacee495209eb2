//! Kubernetes-side object model.
//!
//! These are the operator's custom resources as far as the client cache
//! needs to see them: identity and generation metadata plus the handful of
//! spec fields that determine how a Vault session is built.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the auth/connection object used when a reference is empty.
pub const DEFAULT_REF_NAME: &str = "default";

/// Namespaced object identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Create an object key.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a reference of the form `namespace/name` or `name`.
    ///
    /// Bare names resolve relative to `default_namespace`. Returns `None`
    /// for an empty reference.
    #[must_use]
    pub fn parse_ref(reference: &str, default_namespace: &str) -> Option<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return None;
        }
        match reference.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Some(Self::new(ns, name)),
            Some(_) => None,
            None => Some(Self::new(default_namespace, reference)),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Server-assigned UID
    #[serde(default)]
    pub uid: String,
    /// Spec generation
    #[serde(default)]
    pub generation: i64,
    /// Labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create metadata with a name and namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Object key for this metadata.
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }
}

/// Supported Vault auth methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthMethod {
    /// Kubernetes service account JWT
    Kubernetes,
    /// AppRole role ID + secret ID
    AppRole,
    /// Externally issued JWT
    Jwt,
}

impl AuthMethod {
    /// Method name as used in cache keys and records.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Kubernetes => "kubernetes",
            Self::AppRole => "appRole",
            Self::Jwt => "jwt",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes auth settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesAuth {
    /// Vault role
    pub role: String,
    /// Service account in the consumer's namespace
    pub service_account: String,
    /// Token audiences
    #[serde(default)]
    pub audiences: Vec<String>,
}

/// AppRole auth settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRoleAuth {
    /// AppRole role ID
    pub role_id: String,
    /// Secret holding the secret ID under key `id`
    pub secret_ref: String,
}

/// JWT auth settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtAuth {
    /// Vault role
    pub role: String,
    /// Secret holding the token under key `jwt`
    pub secret_ref: String,
}

/// `VaultAuth` spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultAuthSpec {
    /// Auth method
    pub method: AuthMethod,
    /// Auth mount path
    pub mount: String,
    /// Connection reference; empty selects the default connection
    #[serde(default)]
    pub vault_connection_ref: String,
    /// Vault enterprise namespace
    #[serde(default)]
    pub namespace: Option<String>,
    /// Kubernetes settings
    #[serde(default)]
    pub kubernetes: Option<KubernetesAuth>,
    /// AppRole settings
    #[serde(default)]
    pub app_role: Option<AppRoleAuth>,
    /// JWT settings
    #[serde(default)]
    pub jwt: Option<JwtAuth>,
    /// `VaultTransit` object used to encrypt persisted sessions
    #[serde(default)]
    pub vault_transit_ref: Option<String>,
}

/// `VaultAuth` custom resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultAuth {
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: VaultAuthSpec,
}

impl VaultAuth {
    /// Connection referenced by this auth object.
    ///
    /// An empty reference selects `default` in the operator namespace;
    /// bare names resolve in the auth object's own namespace.
    #[must_use]
    pub fn connection_key(&self, operator_namespace: &str) -> ObjectKey {
        ObjectKey::parse_ref(&self.spec.vault_connection_ref, &self.metadata.namespace)
            .unwrap_or_else(|| ObjectKey::new(operator_namespace, DEFAULT_REF_NAME))
    }

    /// Transit reference, if one is configured.
    #[must_use]
    pub fn transit_ref(&self) -> Option<&str> {
        self.spec.vault_transit_ref.as_deref().filter(|r| !r.trim().is_empty())
    }
}

/// `VaultConnection` spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConnectionSpec {
    /// Vault address, e.g. `https://vault.vault.svc:8200`
    pub address: String,
    /// Skip TLS verification
    #[serde(default)]
    pub skip_tls_verify: bool,
    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// `VaultConnection` custom resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConnection {
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: VaultConnectionSpec,
}

/// `VaultTransit` spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultTransitSpec {
    /// Transit secrets engine mount
    pub mount: String,
    /// Transit key name
    pub key: String,
    /// Auth used to talk to the transit engine
    #[serde(default)]
    pub vault_auth_ref: String,
}

/// `VaultTransit` custom resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultTransit {
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: VaultTransitSpec,
}

/// `VaultClientCache` spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultClientCacheSpec {
    pub cache_key: String,
    pub vault_auth_name: String,
    pub vault_auth_namespace: String,
    pub vault_auth_method: String,
    #[serde(rename = "vaultAuthUID")]
    pub vault_auth_uid: String,
    pub vault_auth_generation: i64,
    #[serde(rename = "vaultConnectionUID")]
    pub vault_connection_uid: String,
    pub vault_connection_generation: i64,
    #[serde(rename = "credentialProviderUID")]
    pub credential_provider_uid: String,
    #[serde(default)]
    pub vault_transit_ref: Option<String>,
    /// Namespace the credential provider was resolved in
    pub target_namespace: String,
}

/// `VaultClientCache` status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultClientCacheStatus {
    /// Companion secret holding the serialized session
    #[serde(default)]
    pub cache_secret_ref: String,
}

/// `VaultClientCache` custom resource: the persisted cache record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultClientCache {
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: VaultClientCacheSpec,
    /// Status
    #[serde(default)]
    pub status: VaultClientCacheStatus,
}

impl VaultClientCache {
    /// Target needed to rebuild a client for this record.
    #[must_use]
    pub fn client_target(&self) -> ClientTarget {
        ClientTarget {
            auth: ObjectKey::new(&self.spec.vault_auth_namespace, &self.spec.vault_auth_name),
            target_namespace: self.spec.target_namespace.clone(),
        }
    }
}

/// Kubernetes `Secret`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    /// Metadata
    pub metadata: ObjectMeta,
    /// Raw data
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    /// Create an empty secret.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            data: BTreeMap::new(),
        }
    }

    /// Add a data field.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Kubernetes `ServiceAccount`, metadata only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccount {
    /// Metadata
    pub metadata: ObjectMeta,
}

/// What a client factory needs to build a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientTarget {
    /// `VaultAuth` object
    pub auth: ObjectKey,
    /// Namespace in which the credential provider is resolved
    pub target_namespace: String,
}

/// An object that needs a Vault client.
pub trait VaultConsumer: Send + Sync {
    /// Identity of the consumer.
    fn object_key(&self) -> ObjectKey;

    /// `VaultAuth` reference; empty selects the default auth.
    fn vault_auth_ref(&self) -> &str;

    /// Client target for this consumer.
    fn client_target(&self, operator_namespace: &str) -> ClientTarget {
        let key = self.object_key();
        let auth = ObjectKey::parse_ref(self.vault_auth_ref(), &key.namespace)
            .unwrap_or_else(|| ObjectKey::new(operator_namespace, DEFAULT_REF_NAME));
        ClientTarget {
            auth,
            target_namespace: key.namespace,
        }
    }
}
