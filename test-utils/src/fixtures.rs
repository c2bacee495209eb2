//! Test fixtures with sample data.
//!
//! [`Fixture`] seeds a [`MemoryStore`] with the objects a consumer in
//! [`TENANT_NAMESPACE`] needs to log in through the default auth: a
//! `VaultConnection` and `VaultAuth` named `default` in the operator
//! namespace, and the service account the auth impersonates.

use std::sync::Arc;
use vault_client_cache::model::{
    AuthMethod, KubernetesAuth, ServiceAccount, VaultAuth, VaultAuthSpec, VaultConnection,
    VaultConnectionSpec, VaultTransit, VaultTransitSpec,
};
use vault_client_cache::store::MemoryStore;
use vault_client_cache::{
    DynamicSecret, DynamicSecretSpec, ObjectKey, ObjectMeta, VaultConsumer, VaultSecret,
};

/// Operator namespace used by fixtures.
pub const OPERATOR_NAMESPACE: &str = "vault-secrets-operator-system";

/// Namespace consumers live in.
pub const TENANT_NAMESPACE: &str = "tenant";

/// Service account the default auth logs in as.
pub const SERVICE_ACCOUNT: &str = "app";

/// Name of the default auth, connection and transit objects.
pub const DEFAULT_NAME: &str = "default";

/// A seeded store.
#[derive(Debug, Clone)]
pub struct Fixture {
    /// The store
    pub store: Arc<MemoryStore>,
    /// Default auth
    pub auth: VaultAuth,
    /// Default connection
    pub connection: VaultConnection,
    /// Service account in the tenant namespace
    pub service_account: ServiceAccount,
}

impl Fixture {
    /// Seed a store with a default Kubernetes auth pointed at `address`.
    #[must_use]
    pub fn new(address: &str) -> Self {
        let store = Arc::new(MemoryStore::new());
        let connection =
            store.put_vault_connection(vault_connection(OPERATOR_NAMESPACE, DEFAULT_NAME, address));
        let auth = store.put_vault_auth(kubernetes_auth(
            OPERATOR_NAMESPACE,
            DEFAULT_NAME,
            SERVICE_ACCOUNT,
        ));
        let service_account =
            store.put_service_account(service_account(TENANT_NAMESPACE, SERVICE_ACCOUNT));

        Self {
            store,
            auth,
            connection,
            service_account,
        }
    }

    /// Key of the default auth.
    #[must_use]
    pub fn auth_key(&self) -> ObjectKey {
        self.auth.metadata.key()
    }

    /// Point the default auth at a `VaultTransit` named `default`.
    #[must_use]
    pub fn with_transit(self) -> Self {
        self.store.put_vault_transit(VaultTransit {
            metadata: ObjectMeta::new(OPERATOR_NAMESPACE, DEFAULT_NAME),
            spec: VaultTransitSpec {
                mount: "transit".to_string(),
                key: "vso-client-cache".to_string(),
                vault_auth_ref: DEFAULT_NAME.to_string(),
            },
        });
        self.store.update_vault_auth(&self.auth_key(), |auth| {
            auth.spec.vault_transit_ref = Some(DEFAULT_NAME.to_string());
        });
        self.refresh()
    }

    /// Bump the default auth's generation.
    pub fn bump_auth_generation(&self) {
        self.store.update_vault_auth(&self.auth_key(), |_| {});
    }

    fn refresh(mut self) -> Self {
        if let Some(auth) = self.store.vault_auth(&self.auth_key()) {
            self.auth = auth;
        }
        self
    }
}

/// Kubernetes auth logging in as `service_account`.
#[must_use]
pub fn kubernetes_auth(namespace: &str, name: &str, service_account: &str) -> VaultAuth {
    VaultAuth {
        metadata: ObjectMeta::new(namespace, name),
        spec: VaultAuthSpec {
            method: AuthMethod::Kubernetes,
            mount: "kubernetes".to_string(),
            vault_connection_ref: String::new(),
            namespace: None,
            kubernetes: Some(KubernetesAuth {
                role: "app".to_string(),
                service_account: service_account.to_string(),
                audiences: vec!["vault".to_string()],
            }),
            app_role: None,
            jwt: None,
            vault_transit_ref: None,
        },
    }
}

/// Connection to `address`.
#[must_use]
pub fn vault_connection(namespace: &str, name: &str, address: &str) -> VaultConnection {
    VaultConnection {
        metadata: ObjectMeta::new(namespace, name),
        spec: VaultConnectionSpec {
            address: address.to_string(),
            ..Default::default()
        },
    }
}

/// Service account without any secrets.
#[must_use]
pub fn service_account(namespace: &str, name: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta::new(namespace, name),
    }
}

/// Consumer identified only by its key, using the default auth.
#[derive(Debug, Clone)]
pub struct TestConsumer {
    key: ObjectKey,
    auth_ref: String,
}

impl TestConsumer {
    /// Consumer `name` in the tenant namespace.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            key: ObjectKey::new(TENANT_NAMESPACE, name),
            auth_ref: String::new(),
        }
    }

    /// Use the auth named by `reference`.
    #[must_use]
    pub fn with_auth_ref(mut self, reference: &str) -> Self {
        self.auth_ref = reference.to_string();
        self
    }
}

impl VaultConsumer for TestConsumer {
    fn object_key(&self) -> ObjectKey {
        self.key.clone()
    }

    fn vault_auth_ref(&self) -> &str {
        &self.auth_ref
    }
}

/// Dynamic secret issuing `database/creds/app` in the tenant namespace.
#[must_use]
pub fn dynamic_secret(name: &str) -> DynamicSecret {
    DynamicSecret::new(
        ObjectMeta::new(TENANT_NAMESPACE, name),
        DynamicSecretSpec {
            mount: "database".to_string(),
            role: "app".to_string(),
            vault_auth_ref: String::new(),
        },
    )
}

/// Leased credentials as returned by a secrets engine.
#[must_use]
pub fn lease_response(lease_id: &str, lease_duration: u64, renewable: bool) -> VaultSecret {
    let mut data = serde_json::Map::new();
    data.insert("username".to_string(), serde_json::Value::from("v-app-1"));
    data.insert("password".to_string(), serde_json::Value::from("s3cr3t"));
    VaultSecret {
        request_id: format!("req-{lease_id}"),
        lease_id: lease_id.to_string(),
        lease_duration,
        renewable,
        data: Some(data),
        ..Default::default()
    }
}
