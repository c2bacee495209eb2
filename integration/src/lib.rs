//! Harness for end-to-end tests of the Vault client cache.
//!
//! A [`Harness`] wires the real manager, deriver, persistence adapter and
//! lease scheduler to the mocks in `test-utils`. [`Harness::restart`]
//! builds a second manager over the same store and backend, standing in
//! for an operator restart.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rust_common::{TracingConfig, init_tracing};
use std::sync::{Arc, Once};
use test_utils::{
    Fixture, MockClientFactory, MockTransit, MockVault, OPERATOR_NAMESPACE, RecordingEvents,
};
use vault_client_cache::config::{ClientCacheConfig, LeaseSchedulerConfig, PersistenceModel};
use vault_client_cache::{
    CachePersistence, ClientCacheManager, LeaseScheduler, ObjectCacheKeyDeriver, VaultResult,
};

/// Address stored on the default connection.
pub const VAULT_ADDRESS: &str = "http://vault.vault.svc:8200";

static TRACING: Once = Once::new();

/// Install a test subscriber once per process. `RUST_LOG` overrides the
/// default `warn` filter.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let config = TracingConfig::default()
            .with_service_name("vault-client-cache-e2e")
            .with_log_level("warn");
        // A subscriber may already be installed by the test binary.
        let _ = init_tracing(&config);
    });
}

/// Everything a test needs.
#[derive(Debug)]
pub struct Harness {
    /// Seeded store
    pub fixture: Fixture,
    /// Shared backend
    pub vault: Arc<MockVault>,
    /// Transit used for encrypted persistence
    pub transit: Arc<MockTransit>,
    /// Recorded events
    pub events: Arc<RecordingEvents>,
    /// Factory behind the manager
    pub factory: Arc<MockClientFactory>,
    /// Manager under test
    pub manager: ClientCacheManager,
    model: PersistenceModel,
    config: ClientCacheConfig,
}

impl Harness {
    /// Harness over a fresh store.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(model: PersistenceModel) -> VaultResult<Self> {
        Self::with_fixture(
            Fixture::new(VAULT_ADDRESS),
            model,
            ClientCacheConfig::new(OPERATOR_NAMESPACE),
        )
    }

    /// Harness over `fixture` with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_fixture(
        fixture: Fixture,
        model: PersistenceModel,
        config: ClientCacheConfig,
    ) -> VaultResult<Self> {
        init_test_tracing();
        let vault = MockVault::new();
        let transit = MockTransit::new();
        let events = RecordingEvents::new();
        let config = config.with_persistence_model(model);
        let (factory, manager) = build(&fixture, &vault, &transit, &events, &config)?;
        Ok(Self {
            fixture,
            vault,
            transit,
            events,
            factory,
            manager,
            model,
            config,
        })
    }

    /// A second manager over the same store, backend and transit, with
    /// empty in-memory caches and a fresh event log.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn restart(&self) -> VaultResult<Self> {
        let events = RecordingEvents::new();
        let (factory, manager) =
            build(&self.fixture, &self.vault, &self.transit, &events, &self.config)?;
        Ok(Self {
            fixture: self.fixture.clone(),
            vault: Arc::clone(&self.vault),
            transit: Arc::clone(&self.transit),
            events,
            factory,
            manager,
            model: self.model,
            config: self.config.clone(),
        })
    }

    /// Persistence model in effect.
    #[must_use]
    pub const fn model(&self) -> PersistenceModel {
        self.model
    }

    /// Lease scheduler recording into this harness.
    #[must_use]
    pub fn scheduler(&self, config: LeaseSchedulerConfig) -> LeaseScheduler {
        LeaseScheduler::new(config, self.events.clone())
    }
}

fn build(
    fixture: &Fixture,
    vault: &Arc<MockVault>,
    transit: &Arc<MockTransit>,
    events: &Arc<RecordingEvents>,
    config: &ClientCacheConfig,
) -> VaultResult<(Arc<MockClientFactory>, ClientCacheManager)> {
    let factory = Arc::new(MockClientFactory::new(
        Arc::clone(&fixture.store),
        Arc::clone(vault),
        OPERATOR_NAMESPACE,
    ));
    let persistence = CachePersistence::new(
        fixture.store.clone(),
        events.clone(),
        config.persistence_model,
        OPERATOR_NAMESPACE,
    )
    .with_transit(transit.clone());
    let manager = ClientCacheManager::new(
        config.clone(),
        Arc::new(ObjectCacheKeyDeriver::new(fixture.store.clone(), OPERATOR_NAMESPACE)),
        factory.clone(),
        persistence,
        events.clone(),
    )?;
    Ok((factory, manager))
}
