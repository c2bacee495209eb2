//! Shared proptest generators.

use proptest::prelude::*;
use std::time::Duration;
use vault_client_cache::model::AuthMethod;
use vault_client_cache::{CacheKey, ObjectKey};

/// Generate Kubernetes namespace names.
pub fn namespace_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{2,20}"
}

/// Generate Kubernetes object names.
pub fn object_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,30}"
}

/// Generate namespaced object keys.
pub fn object_key_strategy() -> impl Strategy<Value = ObjectKey> {
    (namespace_strategy(), object_name_strategy()).prop_map(|(ns, name)| ObjectKey::new(ns, name))
}

/// Generate object UIDs.
pub fn uid_strategy() -> impl Strategy<Value = String> {
    "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}"
}

/// Generate auth methods.
pub fn auth_method_strategy() -> impl Strategy<Value = AuthMethod> {
    prop_oneof![
        Just(AuthMethod::Kubernetes),
        Just(AuthMethod::AppRole),
        Just(AuthMethod::Jwt),
    ]
}

/// Generate cache keys shaped like derived ones.
pub fn cache_key_strategy() -> impl Strategy<Value = CacheKey> {
    (auth_method_strategy(), "[0-9a-f]{22}")
        .prop_map(|(method, digest)| CacheKey::new(format!("{method}-{digest}")))
}

/// Generate lease durations (1 second to 32 days).
pub fn lease_duration_strategy() -> impl Strategy<Value = Duration> {
    (1u64..2_764_800).prop_map(Duration::from_secs)
}

/// Generate sub-second durations, down to a single nanosecond.
pub fn tiny_duration_strategy() -> impl Strategy<Value = Duration> {
    (1u64..1_000_000_000).prop_map(Duration::from_nanos)
}

/// Generate renewal percentages, including out-of-range values.
pub fn renewal_percent_strategy() -> impl Strategy<Value = u8> {
    any::<u8>()
}
