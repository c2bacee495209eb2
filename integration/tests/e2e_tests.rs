//! End-to-end tests for the Vault client cache and lease scheduler.

use chrono::Utc;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use test_utils::{
    Fixture, MockClient, OPERATOR_NAMESPACE, TestConsumer, dynamic_secret, lease_duration_strategy,
    lease_response,
};
use vault_client_cache::cache::ClientCache;
use vault_client_cache::config::{
    ClientCacheConfig, LeaseSchedulerConfig, PersistenceModel, RenewalStrategy,
};
use vault_client_cache::lease::LEASE_RENEW_PATH;
use vault_client_cache::persistence::{
    LABEL_AUTH_REF, LABEL_CONNECTION_REF, LABEL_TRANSIT_REF, SESSION_DATA_KEY, record_key,
};
use vault_client_cache::{
    CacheKey, Client, ObjectStore, Reason, RequestContext, VaultError, compute_horizon_with_jitter,
};
use vault_client_cache_integration_tests::{Harness, VAULT_ADDRESS};

const CREDS_PATH: &str = "database/creds/app";

fn ctx() -> RequestContext {
    RequestContext::background()
}

// Client cache manager

#[tokio::test]
async fn test_unchanged_consumer_reuses_client() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    let consumer = TestConsumer::new("db");

    let first = h.manager.get_client(&ctx(), &consumer).await.unwrap();
    let second = h.manager.get_client(&ctx(), &consumer).await.unwrap();

    assert_eq!(first.cache_key().unwrap(), second.cache_key().unwrap());
    assert_eq!(h.vault.logins(), 1);
    assert_eq!(h.vault.renewals(), 1);
}

#[tokio::test]
async fn test_auth_change_evicts_and_logs_in_again() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    let consumer = TestConsumer::new("db");

    let before = h.manager.get_client(&ctx(), &consumer).await.unwrap().cache_key().unwrap();
    h.fixture.bump_auth_generation();
    let after = h.manager.get_client(&ctx(), &consumer).await.unwrap().cache_key().unwrap();

    assert_ne!(before, after);
    assert!(!h.manager.clients().contains(&before));
    assert!(h.manager.clients().contains(&after));
    assert_eq!(h.manager.object_keys().get(&consumer_key("db")), Some(after));
    assert_eq!(h.vault.logins(), 2);
    assert_eq!(h.events.count(Reason::VaultClientCacheEviction), 1);
}

fn consumer_key(name: &str) -> vault_client_cache::ObjectKey {
    vault_client_cache::ObjectKey::new(test_utils::TENANT_NAMESPACE, name)
}

#[tokio::test]
async fn test_nearly_expired_client_is_not_reused() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    h.vault.set_token_ttl(Duration::from_secs(60));
    let consumer = TestConsumer::new("db");

    h.manager.get_client(&ctx(), &consumer).await.unwrap();
    let client = h.manager.get_client(&ctx(), &consumer).await.unwrap();

    assert_eq!(h.vault.logins(), 2);
    assert_eq!(h.vault.renewals(), 0);
    assert!(!client.check_expiry(Duration::from_secs(300)).unwrap());
    assert_eq!(h.manager.clients().len(), 1);
}

#[tokio::test]
async fn test_unresolvable_auth_is_config_error_without_side_effects() {
    let h = Harness::new(PersistenceModel::DirectUnencrypted).unwrap();
    let consumer = TestConsumer::new("db").with_auth_ref("missing");

    let err = h.manager.get_client(&ctx(), &consumer).await.unwrap_err();

    assert!(matches!(err, VaultError::Config(_)));
    assert!(h.manager.clients().is_empty());
    assert!(h.manager.object_keys().is_empty());
    assert!(h.events.events().is_empty());
    assert_eq!(h.fixture.store.client_cache_count(), 0);
    assert_eq!(h.factory.built(), 0);
}

#[tokio::test]
async fn test_cancelled_context_leaves_caches_untouched() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    let ctx = RequestContext::background();
    ctx.cancel();

    let err = h.manager.get_client(&ctx, &TestConsumer::new("db")).await.unwrap_err();

    assert!(matches!(err, VaultError::Cancelled));
    assert!(h.manager.clients().is_empty());
    assert!(h.manager.object_keys().is_empty());
    assert_eq!(h.vault.logins(), 0);
}

#[tokio::test]
async fn test_login_failure_is_propagated() {
    let h = Harness::new(PersistenceModel::DirectUnencrypted).unwrap();
    h.vault.set_fail_login(true);

    let err = h.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap_err();

    assert!(matches!(err, VaultError::AuthenticationFailed(_)));
    assert!(h.manager.clients().is_empty());
    assert_eq!(h.fixture.store.client_cache_count(), 0);
}

#[tokio::test]
async fn test_remove_object_keeps_shared_client() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    let first = TestConsumer::new("db-1");
    let second = TestConsumer::new("db-2");

    h.manager.get_client(&ctx(), &first).await.unwrap();
    h.manager.get_client(&ctx(), &second).await.unwrap();
    assert!(h.manager.remove_object(&first));
    assert!(!h.manager.remove_object(&first));

    h.manager.get_client(&ctx(), &second).await.unwrap();
    assert_eq!(h.vault.logins(), 1);
    assert_eq!(h.manager.clients().len(), 1);
    assert!(h.manager.object_keys().get(&consumer_key("db-1")).is_none());
    assert!(h.manager.object_keys().get(&consumer_key("db-2")).is_some());
}

#[tokio::test]
async fn test_concurrent_consumers_share_one_login() {
    let h = Arc::new(Harness::new(PersistenceModel::None).unwrap());
    let mut handles = Vec::new();
    for i in 0..16 {
        let h = Arc::clone(&h);
        handles.push(tokio::spawn(async move {
            let consumer = TestConsumer::new(&format!("db-{i}"));
            h.manager.get_client(&ctx(), &consumer).await.map(|_| ())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(h.vault.logins(), 1);
    assert_eq!(h.manager.clients().len(), 1);
    assert_eq!(h.manager.object_keys().len(), 16);
}

#[tokio::test]
async fn test_single_stripe_still_serves_every_consumer() {
    let config = ClientCacheConfig::new(OPERATOR_NAMESPACE).with_lock_stripes(1);
    let h =
        Harness::with_fixture(Fixture::new(VAULT_ADDRESS), PersistenceModel::None, config).unwrap();

    for i in 0..4 {
        h.manager.get_client(&ctx(), &TestConsumer::new(&format!("db-{i}"))).await.unwrap();
    }
    assert_eq!(h.vault.logins(), 1);
}

#[test]
fn test_client_cache_evicts_least_recently_used() {
    let fixture = Fixture::new(VAULT_ADDRESS);
    let vault = test_utils::MockVault::new();
    let client = |key: &str| -> Arc<dyn Client> {
        Arc::new(MockClient::new(
            CacheKey::new(key),
            fixture.auth.clone(),
            fixture.connection.clone(),
            "provider",
            "tenant",
            Arc::clone(&vault),
        ))
    };
    let cache = ClientCache::new(2).unwrap();

    assert_eq!(cache.add(client("k1")).unwrap(), None);
    assert_eq!(cache.add(client("k2")).unwrap(), None);
    assert_eq!(cache.add(client("k3")).unwrap(), Some(CacheKey::new("k1")));

    assert!(cache.get(&CacheKey::new("k1")).is_none());
    assert!(cache.get(&CacheKey::new("k2")).is_some());
    assert!(cache.get(&CacheKey::new("k3")).is_some());
}

#[test]
fn test_client_cache_rejects_empty_key() {
    let fixture = Fixture::new(VAULT_ADDRESS);
    let cache = ClientCache::new(2).unwrap();
    let client = Arc::new(MockClient::new(
        CacheKey::default(),
        fixture.auth.clone(),
        fixture.connection.clone(),
        "provider",
        "tenant",
        test_utils::MockVault::new(),
    ));

    assert!(matches!(cache.add(client), Err(VaultError::Config(_))));
    assert!(cache.is_empty());
}

// Persistence

#[tokio::test]
async fn test_new_client_is_persisted() {
    let h = Harness::new(PersistenceModel::DirectUnencrypted).unwrap();
    let client = h.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();
    let key = record_key(OPERATOR_NAMESPACE, &client.cache_key().unwrap());

    let record = h.fixture.store.client_cache(&key).unwrap();
    assert_eq!(record.spec.cache_key, client.cache_key().unwrap().to_string());
    assert_eq!(record.spec.vault_auth_uid, h.fixture.auth.metadata.uid);
    assert_eq!(record.spec.vault_connection_uid, h.fixture.connection.metadata.uid);
    assert_eq!(record.spec.credential_provider_uid, h.fixture.service_account.metadata.uid);
    assert_eq!(record.status.cache_secret_ref, key.name);
    assert_eq!(record.metadata.labels.get(LABEL_AUTH_REF).map(String::as_str), Some("default"));

    let secret = h.fixture.store.secret(&key).unwrap();
    assert!(secret.data.contains_key(SESSION_DATA_KEY));
    assert!(!secret.metadata.labels.contains_key(LABEL_TRANSIT_REF));
    assert_eq!(h.events.count(Reason::VaultClientCacheCreation), 1);
}

#[tokio::test]
async fn test_persistence_disabled_writes_nothing() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    h.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();
    assert_eq!(h.fixture.store.client_cache_count(), 0);
}

#[tokio::test]
async fn test_restart_restores_persisted_session() {
    let h = Harness::new(PersistenceModel::DirectUnencrypted).unwrap();
    let original = h.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();

    let restarted = h.restart().unwrap();
    let restored = restarted.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();

    assert_eq!(restored.cache_key().unwrap(), original.cache_key().unwrap());
    assert_eq!(restored.session().unwrap(), original.session().unwrap());
    assert_eq!(h.vault.logins(), 1);
    assert_eq!(h.vault.restores(), 1);
    assert_eq!(restarted.events.count(Reason::CacheRestorationSucceeded), 1);
    assert_eq!(restarted.events.count(Reason::VaultClientCacheCreation), 0);
}

#[tokio::test]
async fn test_missing_companion_secret_falls_back_to_login() {
    let h = Harness::new(PersistenceModel::DirectUnencrypted).unwrap();
    let client = h.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();
    let key = record_key(OPERATOR_NAMESPACE, &client.cache_key().unwrap());
    assert!(h.fixture.store.delete_secret(&key));

    let restarted = h.restart().unwrap();
    let fresh = restarted.manager.get_client(&ctx(), &TestConsumer::new("db")).await;

    assert!(fresh.is_ok());
    assert_eq!(h.vault.logins(), 2);
    assert_eq!(h.vault.restores(), 0);
    assert_eq!(restarted.events.count(Reason::CacheRestorationFailed), 1);
    assert!(h.fixture.store.secret(&key).is_some());
}

#[tokio::test]
async fn test_missing_record_is_a_silent_miss() {
    let h = Harness::new(PersistenceModel::DirectUnencrypted).unwrap();
    let client = h.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();
    let key = record_key(OPERATOR_NAMESPACE, &client.cache_key().unwrap());
    assert!(h.fixture.store.delete_client_cache(&key));

    let restarted = h.restart().unwrap();
    restarted.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();

    assert_eq!(h.vault.logins(), 2);
    assert_eq!(restarted.events.count(Reason::CacheRestorationFailed), 0);
}

#[tokio::test]
async fn test_revoked_session_falls_back_to_login() {
    let h = Harness::new(PersistenceModel::DirectUnencrypted).unwrap();
    h.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();
    h.vault.set_reject_restore(true);

    let restarted = h.restart().unwrap();
    restarted.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();

    assert_eq!(h.vault.logins(), 2);
    assert_eq!(restarted.events.count(Reason::CacheRestorationFailed), 1);
}

#[tokio::test]
async fn test_encrypted_session_round_trip() {
    let fixture = Fixture::new(VAULT_ADDRESS).with_transit();
    let config = ClientCacheConfig::new(OPERATOR_NAMESPACE);
    let h = Harness::with_fixture(fixture, PersistenceModel::DirectEncrypted, config).unwrap();
    let client = h.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();
    let key = record_key(OPERATOR_NAMESPACE, &client.cache_key().unwrap());

    let secret = h.fixture.store.secret(&key).unwrap();
    assert_eq!(secret.metadata.labels.get(LABEL_TRANSIT_REF).map(String::as_str), Some("default"));
    let blob = secret.data.get(SESSION_DATA_KEY).unwrap();
    assert!(blob.starts_with(test_utils::MOCK_CIPHERTEXT_PREFIX.as_bytes()));
    assert_eq!(h.transit.encrypts(), 1);
    assert_eq!(h.events.count(Reason::TransitEncryptSuccessful), 1);

    let restarted = h.restart().unwrap();
    restarted.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();
    assert_eq!(h.transit.decrypts(), 1);
    assert_eq!(h.vault.logins(), 1);
    assert_eq!(restarted.events.count(Reason::TransitDecryptSuccessful), 1);
}

#[tokio::test]
async fn test_undecryptable_session_falls_back_to_login() {
    let fixture = Fixture::new(VAULT_ADDRESS).with_transit();
    let config = ClientCacheConfig::new(OPERATOR_NAMESPACE);
    let h = Harness::with_fixture(fixture, PersistenceModel::DirectEncrypted, config).unwrap();
    h.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();
    h.transit.set_fail_decrypt(true);

    let restarted = h.restart().unwrap();
    let client = restarted.manager.get_client(&ctx(), &TestConsumer::new("db")).await;

    assert!(client.is_ok());
    assert_eq!(h.vault.logins(), 2);
    assert_eq!(restarted.events.count(Reason::TransitDecryptError), 1);
    assert_eq!(restarted.events.count(Reason::CacheRestorationFailed), 1);
}

fn encrypted_harness() -> Harness {
    let fixture = Fixture::new(VAULT_ADDRESS).with_transit();
    let config = ClientCacheConfig::new(OPERATOR_NAMESPACE);
    Harness::with_fixture(fixture, PersistenceModel::DirectEncrypted, config).unwrap()
}

#[tokio::test]
async fn test_cancellation_during_restore_leaves_caches_untouched() {
    let h = encrypted_harness();
    h.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();
    h.transit.set_cancel_on_decrypt(true);

    let restarted = h.restart().unwrap();
    let err = restarted.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap_err();

    assert!(matches!(err, VaultError::Cancelled));
    assert!(restarted.manager.clients().is_empty());
    assert!(restarted.manager.object_keys().is_empty());
    assert_eq!(h.vault.logins(), 1);
    assert_eq!(h.vault.restores(), 0);
    assert_eq!(restarted.events.count(Reason::CacheRestorationFailed), 0);
    assert_eq!(restarted.events.count(Reason::TransitDecryptError), 0);
}

#[tokio::test]
async fn test_cancellation_during_restore_keeps_previous_client() {
    let h = encrypted_harness();
    let consumer = TestConsumer::new("db");
    h.manager.get_client(&ctx(), &consumer).await.unwrap();

    let restarted = h.restart().unwrap();
    let before = restarted
        .manager
        .get_client(&ctx(), &consumer)
        .await
        .unwrap()
        .cache_key()
        .unwrap();

    // The first manager persists a session for the new key.
    h.fixture.bump_auth_generation();
    let after = h.manager.get_client(&ctx(), &consumer).await.unwrap().cache_key().unwrap();
    assert_ne!(before, after);
    h.transit.set_cancel_on_decrypt(true);

    let err = restarted.manager.get_client(&ctx(), &consumer).await.unwrap_err();

    assert!(matches!(err, VaultError::Cancelled));
    assert_eq!(restarted.manager.object_keys().get(&consumer_key("db")), Some(before.clone()));
    assert!(restarted.manager.clients().contains(&before));
    assert!(!restarted.manager.clients().contains(&after));
    assert_eq!(restarted.events.count(Reason::VaultClientCacheEviction), 0);
}

#[tokio::test]
async fn test_restore_refreshes_stale_record() {
    let h = Harness::new(PersistenceModel::DirectUnencrypted).unwrap();
    let client = h.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();
    let key = record_key(OPERATOR_NAMESPACE, &client.cache_key().unwrap());

    let mut record = h.fixture.store.client_cache(&key).unwrap();
    record.metadata.labels.insert(LABEL_AUTH_REF.to_string(), "stale".to_string());
    record.metadata.labels.remove(LABEL_CONNECTION_REF);
    h.fixture.store.patch_client_cache(&record).await.unwrap();

    let restarted = h.restart().unwrap();
    restarted.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();

    let refreshed = h.fixture.store.client_cache(&key).unwrap();
    assert_eq!(refreshed.metadata.labels.get(LABEL_AUTH_REF).map(String::as_str), Some("default"));
    assert!(refreshed.metadata.labels.contains_key(LABEL_CONNECTION_REF));
    assert_eq!(refreshed.spec.cache_key, client.cache_key().unwrap().to_string());
    assert_eq!(h.vault.logins(), 1);
    assert_eq!(h.vault.restores(), 1);
    assert_eq!(restarted.events.count(Reason::CacheRestorationSucceeded), 1);
}

#[tokio::test]
async fn test_encrypted_model_without_transit_refuses_to_persist() {
    let h = Harness::new(PersistenceModel::DirectEncrypted).unwrap();
    let client = h.manager.get_client(&ctx(), &TestConsumer::new("db")).await;

    assert!(client.is_ok());
    assert_eq!(h.fixture.store.client_cache_count(), 0);
    assert_eq!(h.events.count(Reason::PersistenceForbidden), 1);
    assert_eq!(h.transit.encrypts(), 0);
}

#[tokio::test]
async fn test_encrypt_failure_surfaces_but_keeps_client_cached() {
    let fixture = Fixture::new(VAULT_ADDRESS).with_transit();
    let config = ClientCacheConfig::new(OPERATOR_NAMESPACE);
    let h = Harness::with_fixture(fixture, PersistenceModel::DirectEncrypted, config).unwrap();
    h.transit.set_fail_encrypt(true);

    let err = h.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap_err();

    assert!(matches!(err, VaultError::Persistence(_)));
    assert_eq!(h.manager.clients().len(), 1);
    assert_eq!(h.fixture.store.client_cache_count(), 0);
    assert_eq!(h.events.count(Reason::TransitEncryptError), 1);

    h.transit.set_fail_encrypt(false);
    h.manager.get_client(&ctx(), &TestConsumer::new("db")).await.unwrap();
    assert_eq!(h.vault.logins(), 1);
}

// Lease scheduling

fn requeue(outcome: &vault_client_cache::SyncOutcome) -> Duration {
    outcome.requeue_after.unwrap()
}

#[tokio::test]
async fn test_new_dynamic_secret_is_synced() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    h.vault.set_read(CREDS_PATH, lease_response("database/creds/app/1", 600, true));
    let scheduler = h.scheduler(LeaseSchedulerConfig::new("pod-a"));
    let mut secret = dynamic_secret("db");
    let now = Utc::now();

    let outcome = scheduler.reconcile(&ctx(), &h.manager, &mut secret, now).await.unwrap();

    assert_eq!(outcome.reason, Reason::SecretSynced);
    assert!(!outcome.rotated);
    assert!(outcome.data.is_some());
    let horizon = requeue(&outcome);
    assert!(horizon <= Duration::from_secs(402));
    assert!(horizon >= Duration::from_secs(361));
    assert_eq!(secret.status.secret_lease.id, "database/creds/app/1");
    assert_eq!(secret.status.last_renewal_time, now.timestamp());
    assert_eq!(secret.status.last_runtime_pod_name, "pod-a");
    assert_eq!(h.vault.reads_of(CREDS_PATH), 1);
}

#[tokio::test]
async fn test_renewable_lease_is_renewed() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    h.vault.set_read(CREDS_PATH, lease_response("database/creds/app/1", 600, true));
    h.vault.set_write(LEASE_RENEW_PATH, lease_response("database/creds/app/1", 600, true));
    let scheduler = h.scheduler(LeaseSchedulerConfig::new("pod-a"));
    let mut secret = dynamic_secret("db");

    scheduler.reconcile(&ctx(), &h.manager, &mut secret, Utc::now()).await.unwrap();
    let later = Utc::now() + chrono::TimeDelta::seconds(400);
    let outcome = scheduler.reconcile(&ctx(), &h.manager, &mut secret, later).await.unwrap();

    assert_eq!(outcome.reason, Reason::SecretLeaseRenewal);
    assert!(!outcome.rotated);
    assert!(outcome.data.is_none());
    assert!(requeue(&outcome) <= Duration::from_secs(402));
    assert_eq!(secret.status.last_renewal_time, later.timestamp());
    assert_eq!(h.vault.reads_of(CREDS_PATH), 1);
    assert_eq!(
        h.vault.writes_to(LEASE_RENEW_PATH),
        vec![serde_json::json!({"lease_id": "database/creds/app/1", "increment": 600})]
    );
}

#[tokio::test]
async fn test_renewal_mismatch_is_fatal_and_keeps_status() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    h.vault.set_read(CREDS_PATH, lease_response("database/creds/app/1", 600, true));
    h.vault.set_write(LEASE_RENEW_PATH, lease_response("database/creds/app/2", 600, true));
    let scheduler = h.scheduler(LeaseSchedulerConfig::new("pod-a"));
    let mut secret = dynamic_secret("db");

    scheduler.reconcile(&ctx(), &h.manager, &mut secret, Utc::now()).await.unwrap();
    let before = secret.status.clone();
    let err = scheduler.reconcile(&ctx(), &h.manager, &mut secret, Utc::now()).await.unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(err, VaultError::LeaseRenewalMismatch { .. }));
    assert_eq!(secret.status, before);
    assert_eq!(h.events.count(Reason::Unrecoverable), 1);
    assert_eq!(h.vault.reads_of(CREDS_PATH), 1);
}

#[tokio::test]
async fn test_renewal_failure_rotates_credentials() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    h.vault.set_read(CREDS_PATH, lease_response("database/creds/app/1", 600, true));
    h.vault.fail_write(LEASE_RENEW_PATH, "lease not found");
    let scheduler = h.scheduler(LeaseSchedulerConfig::new("pod-a"));
    let mut secret = dynamic_secret("db");

    scheduler.reconcile(&ctx(), &h.manager, &mut secret, Utc::now()).await.unwrap();
    h.vault.set_read(CREDS_PATH, lease_response("database/creds/app/2", 600, true));
    let outcome = scheduler.reconcile(&ctx(), &h.manager, &mut secret, Utc::now()).await.unwrap();

    assert!(outcome.rotated);
    assert_eq!(outcome.reason, Reason::SecretRotated);
    assert!(outcome.data.is_some());
    assert_eq!(secret.status.secret_lease.id, "database/creds/app/2");
    assert_eq!(h.events.count(Reason::SecretLeaseRenewalError), 1);
    assert_eq!(h.events.count(Reason::SecretRotated), 1);
}

#[tokio::test]
async fn test_cancelled_renewal_does_not_rotate() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    h.vault.set_read(CREDS_PATH, lease_response("database/creds/app/1", 600, true));
    let scheduler = h.scheduler(LeaseSchedulerConfig::new("pod-a"));
    let mut secret = dynamic_secret("db");
    scheduler.reconcile(&ctx(), &h.manager, &mut secret, Utc::now()).await.unwrap();
    let status = secret.status.clone();

    h.vault.cancel_write(LEASE_RENEW_PATH);
    let ctx = ctx();
    let err = scheduler.reconcile(&ctx, &h.manager, &mut secret, Utc::now()).await.unwrap_err();

    assert!(matches!(err, VaultError::Cancelled));
    assert_eq!(secret.status, status);
    assert_eq!(h.vault.reads_of(CREDS_PATH), 1);
    assert_eq!(h.events.count(Reason::SecretLeaseRenewalError), 0);
    assert_eq!(h.events.count(Reason::SecretRotated), 0);
}

#[tokio::test]
async fn test_non_renewable_lease_is_not_rescheduled() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    h.vault.set_read(CREDS_PATH, lease_response("database/creds/app/1", 600, false));
    let scheduler = h.scheduler(LeaseSchedulerConfig::new("pod-a"));
    let mut secret = dynamic_secret("db");

    let outcome = scheduler.reconcile(&ctx(), &h.manager, &mut secret, Utc::now()).await.unwrap();

    assert_eq!(outcome.requeue_after, None);
    assert_eq!(outcome.reason, Reason::SecretSynced);
    assert!(!secret.status.secret_lease.renewable);
    assert_eq!(secret.status.secret_lease.id, "database/creds/app/1");
}

#[tokio::test]
async fn test_renewal_reporting_non_renewable_stops_scheduling() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    h.vault.set_read(CREDS_PATH, lease_response("database/creds/app/1", 600, true));
    h.vault.set_write(LEASE_RENEW_PATH, lease_response("database/creds/app/1", 600, false));
    let scheduler = h.scheduler(LeaseSchedulerConfig::new("pod-a"));
    let mut secret = dynamic_secret("db");

    scheduler.reconcile(&ctx(), &h.manager, &mut secret, Utc::now()).await.unwrap();
    let outcome = scheduler.reconcile(&ctx(), &h.manager, &mut secret, Utc::now()).await.unwrap();

    assert_eq!(outcome.requeue_after, None);
    assert_eq!(outcome.reason, Reason::SecretLeaseRenewal);
    assert!(
        h.events
            .events()
            .iter()
            .any(|e| e.reason == Reason::SecretLeaseRenewal && e.message.contains("not renewable"))
    );
}

#[tokio::test]
async fn test_new_pod_suppresses_renewal_within_lease() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    h.vault.set_read(CREDS_PATH, lease_response("database/creds/app/1", 600, true));
    h.vault.set_write(LEASE_RENEW_PATH, lease_response("database/creds/app/1", 600, true));
    let mut secret = dynamic_secret("db");
    let issued = Utc::now();
    h.scheduler(LeaseSchedulerConfig::new("pod-a"))
        .reconcile(&ctx(), &h.manager, &mut secret, issued)
        .await
        .unwrap();

    let now = issued + chrono::TimeDelta::seconds(100);
    let outcome = h
        .scheduler(LeaseSchedulerConfig::new("pod-b"))
        .reconcile(&ctx(), &h.manager, &mut secret, now)
        .await
        .unwrap();

    assert_eq!(outcome.reason, Reason::SecretLeaseRenewal);
    let horizon = requeue(&outcome);
    assert!(horizon <= Duration::from_secs(500));
    assert!(horizon >= Duration::from_secs(450));
    assert_eq!(secret.status.last_runtime_pod_name, "pod-b");
    assert_eq!(secret.status.last_renewal_time, issued.timestamp());
    assert!(h.vault.writes_to(LEASE_RENEW_PATH).is_empty());
}

#[tokio::test]
async fn test_always_strategy_renews_after_pod_change() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    h.vault.set_read(CREDS_PATH, lease_response("database/creds/app/1", 600, true));
    h.vault.set_write(LEASE_RENEW_PATH, lease_response("database/creds/app/1", 600, true));
    let mut secret = dynamic_secret("db");
    h.scheduler(LeaseSchedulerConfig::new("pod-a"))
        .reconcile(&ctx(), &h.manager, &mut secret, Utc::now())
        .await
        .unwrap();

    let config = LeaseSchedulerConfig::new("pod-b").with_strategy(RenewalStrategy::Always);
    h.scheduler(config).reconcile(&ctx(), &h.manager, &mut secret, Utc::now()).await.unwrap();

    assert_eq!(h.vault.writes_to(LEASE_RENEW_PATH).len(), 1);
    assert_eq!(secret.status.last_runtime_pod_name, "pod-b");
}

#[tokio::test]
async fn test_expired_lease_on_new_pod_is_renewed() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    h.vault.set_read(CREDS_PATH, lease_response("database/creds/app/1", 60, true));
    h.vault.set_write(LEASE_RENEW_PATH, lease_response("database/creds/app/1", 60, true));
    let mut secret = dynamic_secret("db");
    let issued = Utc::now();
    h.scheduler(LeaseSchedulerConfig::new("pod-a"))
        .reconcile(&ctx(), &h.manager, &mut secret, issued)
        .await
        .unwrap();

    let later = issued + chrono::TimeDelta::seconds(120);
    h.scheduler(LeaseSchedulerConfig::new("pod-b"))
        .reconcile(&ctx(), &h.manager, &mut secret, later)
        .await
        .unwrap();

    assert_eq!(h.vault.writes_to(LEASE_RENEW_PATH).len(), 1);
}

#[tokio::test]
async fn test_client_config_error_is_reported() {
    let h = Harness::new(PersistenceModel::None).unwrap();
    let scheduler = h.scheduler(LeaseSchedulerConfig::new("pod-a"));
    let mut secret = dynamic_secret("db");
    secret.spec.vault_auth_ref = "missing".to_string();

    let err = scheduler.reconcile(&ctx(), &h.manager, &mut secret, Utc::now()).await.unwrap_err();

    assert!(matches!(err, VaultError::Config(_)));
    assert_eq!(h.events.count(Reason::VaultClientConfigError), 1);
    assert_eq!(secret.status, Default::default());
}

proptest! {
    #[test]
    fn prop_horizon_within_bounds(d in lease_duration_strategy()) {
        let h = compute_horizon_with_jitter(d).unwrap();
        prop_assert!(h > Duration::ZERO);
        prop_assert!(h <= d);
    }
}
