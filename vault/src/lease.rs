//! Dynamic secret lease scheduling.
//!
//! Nothing here sleeps. Each [`LeaseScheduler::reconcile`] call decides
//! whether to renew, rotate or stop, and returns when it wants to be
//! called again.

use crate::client::Client;
use crate::config::{LeaseSchedulerConfig, RenewalStrategy};
use crate::context::RequestContext;
use crate::error::{VaultError, VaultResult};
use crate::events::{EventRecorder, Reason};
use crate::manager::ClientCacheManager;
use crate::model::{ObjectKey, ObjectMeta, VaultConsumer};
use crate::secrets::VaultSecret;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Path used to renew leases.
pub const LEASE_RENEW_PATH: &str = "sys/leases/renew";

/// Shrink `duration` by a random amount of up to 10%.
///
/// The result lies in `(0, duration]` and differs between calls, so leases
/// issued together do not come due together.
///
/// # Errors
///
/// Returns [`VaultError::InvalidHorizon`] for a zero duration.
pub fn compute_horizon_with_jitter(duration: Duration) -> VaultResult<Duration> {
    if duration.is_zero() {
        return Err(VaultError::InvalidHorizon("duration must be positive".to_string()));
    }
    let max_jitter = duration.as_nanos() / 10;
    if max_jitter == 0 {
        return Ok(duration);
    }
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    let nanos = duration.as_nanos() - jitter;
    let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
    let subsec = u32::try_from(nanos % 1_000_000_000).unwrap_or(0);
    Ok(Duration::new(secs, subsec))
}

/// Lease metadata kept on the consumer's status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretLease {
    /// Lease ID
    #[serde(rename = "id")]
    pub id: String,
    /// Lease duration in seconds
    pub lease_duration: u64,
    /// Whether the lease can be renewed
    pub renewable: bool,
    /// Request that issued the lease
    #[serde(rename = "requestID")]
    pub request_id: String,
}

impl From<&VaultSecret> for SecretLease {
    fn from(secret: &VaultSecret) -> Self {
        Self {
            id: secret.lease_id.clone(),
            lease_duration: secret.lease_duration,
            renewable: secret.renewable,
            request_id: secret.request_id.clone(),
        }
    }
}

/// `VaultDynamicSecret` spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSecretSpec {
    /// Secrets engine mount
    pub mount: String,
    /// Role to issue credentials for
    pub role: String,
    /// `VaultAuth` reference; empty selects the default auth
    #[serde(default)]
    pub vault_auth_ref: String,
}

/// `VaultDynamicSecret` status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSecretStatus {
    /// Current lease
    #[serde(default)]
    pub secret_lease: SecretLease,
    /// Unix time of the last renewal or issuance
    #[serde(default)]
    pub last_renewal_time: i64,
    /// Pod that last renewed or issued the lease
    #[serde(default)]
    pub last_runtime_pod_name: String,
}

/// `VaultDynamicSecret` custom resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicSecret {
    /// Metadata
    pub metadata: ObjectMeta,
    /// Spec
    pub spec: DynamicSecretSpec,
    /// Status
    #[serde(default)]
    pub status: DynamicSecretStatus,
}

impl DynamicSecret {
    /// Create a dynamic secret with an empty status.
    #[must_use]
    pub fn new(metadata: ObjectMeta, spec: DynamicSecretSpec) -> Self {
        Self {
            metadata,
            spec,
            status: DynamicSecretStatus::default(),
        }
    }

    /// Path credentials are issued from.
    #[must_use]
    pub fn creds_path(&self) -> String {
        format!("{}/creds/{}", self.spec.mount.trim_matches('/'), self.spec.role)
    }
}

impl VaultConsumer for DynamicSecret {
    fn object_key(&self) -> ObjectKey {
        self.metadata.key()
    }

    fn vault_auth_ref(&self) -> &str {
        &self.spec.vault_auth_ref
    }
}

/// Result of one reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    /// When to reconcile again; `None` stops automatic scheduling
    pub requeue_after: Option<Duration>,
    /// Reason of the event recorded for this cycle
    pub reason: Reason,
    /// Whether credentials were re-issued after a failed renewal
    pub rotated: bool,
    /// Newly issued secret data, if any
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
}

impl SyncOutcome {
    fn renewal(requeue_after: Option<Duration>) -> Self {
        Self {
            requeue_after,
            reason: Reason::SecretLeaseRenewal,
            rotated: false,
            data: None,
        }
    }
}

/// Renews, rotates and schedules dynamic secret leases.
pub struct LeaseScheduler {
    config: LeaseSchedulerConfig,
    events: Arc<dyn EventRecorder>,
}

impl std::fmt::Debug for LeaseScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseScheduler").field("config", &self.config).finish_non_exhaustive()
    }
}

impl LeaseScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(config: LeaseSchedulerConfig, events: Arc<dyn EventRecorder>) -> Self {
        Self { config, events }
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &LeaseSchedulerConfig {
        &self.config
    }

    /// Horizon for a lease of `lease_duration` seconds.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidHorizon`] for a zero duration.
    pub fn renewal_horizon(&self, lease_duration: u64) -> VaultResult<Duration> {
        let scaled = Duration::from_secs(lease_duration)
            .checked_mul(u32::from(self.config.renewal_percent))
            .unwrap_or(Duration::MAX)
            / 100;
        compute_horizon_with_jitter(scaled)
    }

    /// Reconcile `secret`, updating its status on success.
    ///
    /// # Errors
    ///
    /// - [`VaultError::LeaseRenewalMismatch`] if Vault renewed a different
    ///   lease; the status is left untouched.
    /// - Any error from obtaining a client or issuing credentials.
    /// - [`VaultError::Cancelled`] or [`VaultError::DeadlineExceeded`] if
    ///   `ctx` finishes first; no rotation is attempted.
    #[instrument(
        skip_all,
        fields(secret = %secret.metadata.key(), lease_id = %secret.status.secret_lease.id)
    )]
    pub async fn reconcile(
        &self,
        ctx: &RequestContext,
        manager: &ClientCacheManager,
        secret: &mut DynamicSecret,
        now: DateTime<Utc>,
    ) -> VaultResult<SyncOutcome> {
        let object = secret.metadata.key();
        let lease_id = secret.status.secret_lease.id.clone();
        let mut rotated = false;

        if !lease_id.is_empty() {
            if let Some(outcome) = self.suppress(&object, secret, now) {
                return Ok(outcome);
            }

            let client = self.client(ctx, manager, secret, &object).await?;
            match self.renew(ctx, client.as_ref(), secret).await {
                Ok(lease) => {
                    if !self.check_renewable(&object, &lease) {
                        return Ok(SyncOutcome::renewal(None));
                    }
                    if lease.id != lease_id {
                        let err = VaultError::LeaseRenewalMismatch {
                            expected: lease_id,
                            actual: lease.id,
                        };
                        self.events.warning(&object, Reason::Unrecoverable, err.to_string());
                        return Err(err);
                    }

                    let duration = lease.lease_duration;
                    self.update_status(secret, lease, now);
                    let horizon = self.horizon(&object, duration);
                    self.events.normal(
                        &object,
                        Reason::SecretLeaseRenewal,
                        format!("Renewed lease, lease_id={lease_id}, horizon={horizon:?}"),
                    );
                    return Ok(SyncOutcome::renewal(horizon));
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    rotated = true;
                    warn!(error = %e, "Lease renewal failed, issuing new credentials");
                    self.events.warning(
                        &object,
                        Reason::SecretLeaseRenewalError,
                        format!("Could not renew lease, lease_id={lease_id}, err={e}"),
                    );
                }
            }
        }

        let client = self.client(ctx, manager, secret, &object).await?;
        let path = secret.creds_path();
        let response = client
            .read(ctx, &path)
            .await?
            .ok_or_else(|| VaultError::client(format!("nil response from vault for path {path}")))?;

        let lease = SecretLease::from(&response);
        let new_lease_id = lease.id.clone();
        let duration = lease.lease_duration;
        let renewable = lease.renewable;
        self.update_status(secret, lease, now);

        let reason = if rotated {
            Reason::SecretRotated
        } else {
            Reason::SecretSynced
        };
        let requeue_after = if renewable {
            let horizon = self.horizon(&object, duration);
            self.events.normal(
                &object,
                reason,
                format!("Secret synced, lease_id={new_lease_id}, horizon={horizon:?}"),
            );
            horizon
        } else {
            self.check_renewable(&object, &secret.status.secret_lease);
            None
        };

        Ok(SyncOutcome {
            requeue_after,
            reason,
            rotated,
            data: response.data,
        })
    }

    fn suppress(
        &self,
        object: &ObjectKey,
        secret: &mut DynamicSecret,
        now: DateTime<Utc>,
    ) -> Option<SyncOutcome> {
        let pod = &self.config.runtime_pod_name;
        if self.config.strategy != RenewalStrategy::SuppressOnPodChange
            || pod.is_empty()
            || *pod == secret.status.last_runtime_pod_name
        {
            return None;
        }

        let duration = i64::try_from(secret.status.secret_lease.lease_duration).unwrap_or(i64::MAX);
        let remaining = secret
            .status
            .last_renewal_time
            .saturating_add(duration)
            .saturating_sub(now.timestamp());
        if remaining <= 0 {
            return None;
        }

        let remaining = Duration::from_secs(remaining.unsigned_abs());
        match compute_horizon_with_jitter(remaining) {
            Ok(horizon) => {
                secret.status.last_runtime_pod_name.clone_from(pod);
                self.events.normal(
                    object,
                    Reason::SecretLeaseRenewal,
                    format!(
                        "Not in renewal window after transitioning to a new leader/pod, lease_id={}, horizon={horizon:?}",
                        secret.status.secret_lease.id
                    ),
                );
                Some(SyncOutcome::renewal(Some(horizon)))
            }
            Err(e) => {
                warn!(error = %e, "Failed to compute the new horizon");
                None
            }
        }
    }

    async fn client(
        &self,
        ctx: &RequestContext,
        manager: &ClientCacheManager,
        secret: &DynamicSecret,
        object: &ObjectKey,
    ) -> VaultResult<Arc<dyn Client>> {
        manager.get_client(ctx, secret).await.map_err(|e| {
            if e.is_cancellation() {
                return e;
            }
            self.events.warning(
                object,
                Reason::VaultClientConfigError,
                format!(
                    "Failed to get Vault client: {e}, lease_id={}",
                    secret.status.secret_lease.id
                ),
            );
            e
        })
    }

    async fn renew(
        &self,
        ctx: &RequestContext,
        client: &dyn Client,
        secret: &DynamicSecret,
    ) -> VaultResult<SecretLease> {
        let lease = &secret.status.secret_lease;
        let body = serde_json::json!({
            "lease_id": lease.id,
            "increment": lease.lease_duration,
        });
        let response = client
            .write(ctx, LEASE_RENEW_PATH, body)
            .await
            .map_err(|e| {
                if e.is_cancellation() {
                    e
                } else {
                    VaultError::LeaseRenewalFailed(e.to_string())
                }
            })?
            .ok_or_else(|| VaultError::LeaseRenewalFailed("empty renewal response".to_string()))?;
        debug!(lease_id = %response.lease_id, "Renewed lease");
        Ok(SecretLease::from(&response))
    }

    fn check_renewable(&self, object: &ObjectKey, lease: &SecretLease) -> bool {
        if !lease.renewable {
            self.events.warning(
                object,
                Reason::SecretLeaseRenewal,
                format!("Lease is not renewable, lease_id={}", lease.id),
            );
        }
        lease.renewable
    }

    fn horizon(&self, object: &ObjectKey, lease_duration: u64) -> Option<Duration> {
        match self.renewal_horizon(lease_duration) {
            Ok(horizon) => Some(horizon),
            Err(e) => {
                self.events.warning(object, Reason::InvalidHorizon, e.to_string());
                None
            }
        }
    }

    fn update_status(&self, secret: &mut DynamicSecret, lease: SecretLease, now: DateTime<Utc>) {
        secret.status.secret_lease = lease;
        secret.status.last_renewal_time = now.timestamp();
        secret.status.last_runtime_pod_name.clone_from(&self.config.runtime_pod_name);
    }
}
