//! Client cache and lease scheduler configuration.
//!
//! Both configurations can be loaded from the operator environment and
//! validated at startup, or built programmatically with `with_*` methods.

use crate::cache::{DEFAULT_CLIENT_CACHE_SIZE, DEFAULT_OBJECT_KEY_CACHE_SIZE};
use crate::error::{VaultError, VaultResult};
use crate::lock::DEFAULT_LOCK_STRIPES;
use rust_common::{HttpConfig, PlatformError};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Namespace used when `OPERATOR_NAMESPACE` is unset.
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "vault-secrets-operator-system";

/// Default remaining-validity threshold for cached clients.
pub const DEFAULT_EXPIRY_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Default percentage of a lease's duration after which it is renewed.
pub const DEFAULT_RENEWAL_PERCENT: u8 = 67;

/// Upper bound for the renewal percentage.
pub const MAX_RENEWAL_PERCENT: u8 = 90;

/// How client sessions are persisted across operator restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceModel {
    /// Never persist or restore.
    #[default]
    None,
    /// Persist sessions, encrypted when the auth names a transit key.
    DirectUnencrypted,
    /// Persist only sessions that can be encrypted.
    DirectEncrypted,
}

impl PersistenceModel {
    /// Name used in configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::DirectUnencrypted => "direct-unencrypted",
            Self::DirectEncrypted => "direct-encrypted",
        }
    }

    /// Whether sessions are persisted at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether persisted sessions must be encrypted.
    #[must_use]
    pub const fn requires_encryption(&self) -> bool {
        matches!(self, Self::DirectEncrypted)
    }
}

impl FromStr for PersistenceModel {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "direct-unencrypted" => Ok(Self::DirectUnencrypted),
            "direct-encrypted" => Ok(Self::DirectEncrypted),
            other => Err(VaultError::config(format!("Invalid persistence model: {other}"))),
        }
    }
}

impl fmt::Display for PersistenceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether renewal is skipped after the operator pod changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenewalStrategy {
    /// Always renew when the horizon is reached.
    Always,
    /// Skip renewal while the lease is still valid after a pod change.
    #[default]
    SuppressOnPodChange,
}

impl RenewalStrategy {
    /// Name used in configuration.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::SuppressOnPodChange => "suppress-on-pod-change",
        }
    }
}

impl FromStr for RenewalStrategy {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "" | "suppress-on-pod-change" => Ok(Self::SuppressOnPodChange),
            other => Err(VaultError::config(format!("Invalid renewal strategy: {other}"))),
        }
    }
}

/// Client cache manager configuration.
#[derive(Debug, Clone)]
pub struct ClientCacheConfig {
    /// Namespace holding default auth/connection objects and cache records
    pub operator_namespace: String,
    /// Client cache capacity
    pub client_cache_size: usize,
    /// Object key cache capacity
    pub object_key_cache_size: usize,
    /// Minimum remaining validity for a cached client to be reused
    pub expiry_threshold: Duration,
    /// Number of lock stripes; one gives a single global lock
    pub lock_stripes: usize,
    /// Deadline applied to each `get_client` call
    pub request_timeout: Duration,
    /// Session persistence model
    pub persistence_model: PersistenceModel,
    /// HTTP settings for Vault clients
    pub http: HttpConfig,
}

impl Default for ClientCacheConfig {
    fn default() -> Self {
        Self {
            operator_namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            client_cache_size: DEFAULT_CLIENT_CACHE_SIZE,
            object_key_cache_size: DEFAULT_OBJECT_KEY_CACHE_SIZE,
            expiry_threshold: DEFAULT_EXPIRY_THRESHOLD,
            lock_stripes: DEFAULT_LOCK_STRIPES,
            request_timeout: Duration::from_secs(30),
            persistence_model: PersistenceModel::None,
            http: HttpConfig::default(),
        }
    }
}

impl ClientCacheConfig {
    /// Create a configuration for `operator_namespace`.
    #[must_use]
    pub fn new(operator_namespace: impl Into<String>) -> Self {
        Self {
            operator_namespace: operator_namespace.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but invalid.
    pub fn from_env() -> VaultResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> VaultResult<Self> {
        let mut config = Self::default();
        if let Some(ns) = lookup("OPERATOR_NAMESPACE").filter(|ns| !ns.trim().is_empty()) {
            config.operator_namespace = ns.trim().to_string();
        }
        if let Some(size) = lookup("VSO_CLIENT_CACHE_SIZE") {
            config.client_cache_size = parse_var("VSO_CLIENT_CACHE_SIZE", &size)?;
        }
        if let Some(model) = lookup("VSO_CLIENT_CACHE_PERSISTENCE_MODEL") {
            config.persistence_model = model.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Config`] for zero cache sizes or an empty
    /// operator namespace.
    pub fn validate(&self) -> VaultResult<()> {
        if self.operator_namespace.is_empty() {
            return Err(VaultError::config("operator namespace must not be empty"));
        }
        if self.client_cache_size == 0 || self.object_key_cache_size == 0 {
            return Err(VaultError::config("cache sizes must be greater than zero"));
        }
        Ok(())
    }

    /// Set the client cache capacity.
    #[must_use]
    pub const fn with_client_cache_size(mut self, size: usize) -> Self {
        self.client_cache_size = size;
        self
    }

    /// Set the object key cache capacity.
    #[must_use]
    pub const fn with_object_key_cache_size(mut self, size: usize) -> Self {
        self.object_key_cache_size = size;
        self
    }

    /// Set the reuse threshold.
    #[must_use]
    pub const fn with_expiry_threshold(mut self, threshold: Duration) -> Self {
        self.expiry_threshold = threshold;
        self
    }

    /// Set the number of lock stripes.
    #[must_use]
    pub const fn with_lock_stripes(mut self, stripes: usize) -> Self {
        self.lock_stripes = stripes;
        self
    }

    /// Set the per-call deadline.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the persistence model.
    #[must_use]
    pub const fn with_persistence_model(mut self, model: PersistenceModel) -> Self {
        self.persistence_model = model;
        self
    }

    /// Set the HTTP settings for Vault clients.
    #[must_use]
    pub fn with_http(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }
}

/// Lease scheduler configuration.
#[derive(Debug, Clone)]
pub struct LeaseSchedulerConfig {
    /// Renewal suppression strategy
    pub strategy: RenewalStrategy,
    /// Percentage of the lease duration after which to renew (1-90)
    pub renewal_percent: u8,
    /// Name of the pod running this operator instance
    pub runtime_pod_name: String,
}

impl Default for LeaseSchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: RenewalStrategy::default(),
            renewal_percent: DEFAULT_RENEWAL_PERCENT,
            runtime_pod_name: String::new(),
        }
    }
}

impl LeaseSchedulerConfig {
    /// Configuration for the pod named `runtime_pod_name`.
    #[must_use]
    pub fn new(runtime_pod_name: impl Into<String>) -> Self {
        Self {
            runtime_pod_name: runtime_pod_name.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but invalid.
    pub fn from_env() -> VaultResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> VaultResult<Self> {
        let mut config = Self::default();
        if let Some(pod) = lookup("OPERATOR_POD_NAME") {
            config.runtime_pod_name = pod.trim().to_string();
        }
        if let Some(strategy) = lookup("VSO_RENEWAL_STRATEGY") {
            config.strategy = strategy.parse()?;
        }
        if let Some(percent) = lookup("VSO_RENEWAL_PERCENT") {
            config = config.with_renewal_percent(parse_var("VSO_RENEWAL_PERCENT", &percent)?);
        }
        Ok(config)
    }

    /// Set the suppression strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: RenewalStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the renewal percentage (clamped to 1-90).
    #[must_use]
    pub fn with_renewal_percent(mut self, percent: u8) -> Self {
        self.renewal_percent = percent.clamp(1, MAX_RENEWAL_PERCENT);
        self
    }

    /// Set the runtime pod name.
    #[must_use]
    pub fn with_runtime_pod_name(mut self, name: impl Into<String>) -> Self {
        self.runtime_pod_name = name.into();
        self
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> VaultResult<T>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| VaultError::from(PlatformError::invalid_config(name, e.to_string())))
}
