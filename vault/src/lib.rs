//! Vault client cache for the secrets operator.
//!
//! Keeps one authenticated Vault session per distinct auth/connection/provider
//! combination, shares it between every object that resolves to the same
//! cache key, optionally persists sessions across restarts, and schedules
//! dynamic secret lease renewal.

pub mod cache;
pub mod cache_key;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod lease;
pub mod lock;
pub mod manager;
pub mod model;
pub mod persistence;
pub mod provider;
pub mod secrets;
pub mod store;
pub mod transit;

pub use cache::{BoundedCache, ClientCache, ObjectKeyCache};
pub use cache_key::{CacheKey, CacheKeyDeriver, ObjectCacheKeyDeriver, compute_cache_key};
pub use client::{Client, ClientFactory, VaultClient, VaultClientFactory};
pub use config::{ClientCacheConfig, LeaseSchedulerConfig, PersistenceModel, RenewalStrategy};
pub use context::RequestContext;
pub use error::{VaultError, VaultResult};
pub use events::{EventRecorder, EventType, Reason, TracingRecorder};
pub use lease::{
    DynamicSecret, DynamicSecretSpec, DynamicSecretStatus, LeaseScheduler, SecretLease,
    SyncOutcome, compute_horizon_with_jitter,
};
pub use lock::StripedLock;
pub use manager::ClientCacheManager;
pub use model::{ClientTarget, ObjectKey, ObjectMeta, VaultConsumer};
pub use persistence::{CachePersistence, PersistOutcome};
pub use provider::CredentialProvider;
pub use secrets::VaultSecret;
pub use store::{MemoryStore, ObjectStore, StoreError};
pub use transit::{Transit, VaultTransitClient};
