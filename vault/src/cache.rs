//! Bounded LRU caches.
//!
//! Both caches are safe to share between workers; every operation takes a
//! short `parking_lot` lock around the underlying [`LruCache`].

use crate::cache_key::CacheKey;
use crate::client::Client;
use crate::error::{VaultError, VaultResult};
use crate::model::ObjectKey;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

/// Default capacity of the client cache.
pub const DEFAULT_CLIENT_CACHE_SIZE: usize = 10_000;

/// Default capacity of the object key cache.
pub const DEFAULT_OBJECT_KEY_CACHE_SIZE: usize = 10_000;

/// Fixed-capacity, least-recently-used map.
#[derive(Debug)]
pub struct BoundedCache<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> BoundedCache<K, V> {
    /// Create a cache holding at most `capacity` entries.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Config`] for a zero capacity.
    pub fn new(capacity: usize) -> VaultResult<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| VaultError::config("cache capacity must be greater than zero"))?;
        Ok(Self {
            inner: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Look up a value and mark it as recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    /// Insert or replace a value.
    ///
    /// Returns the entry evicted to make room, if any. Replacing the value
    /// of an existing key is not an eviction.
    pub fn put(&self, key: K, value: V) -> Option<(K, V)> {
        let mut inner = self.inner.lock();
        match inner.push(key.clone(), value) {
            Some((old_key, _)) if old_key == key => None,
            evicted => evicted,
        }
    }

    /// Remove a value, returning it if it was present.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().pop(key)
    }

    /// Whether `key` is present, without touching its recency.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().iter().map(|(k, _)| k.clone()).collect()
    }
}

/// Cache of authenticated clients by cache key.
#[derive(Debug)]
pub struct ClientCache {
    entries: BoundedCache<CacheKey, Arc<dyn Client>>,
}

impl ClientCache {
    /// Create a client cache.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Config`] for a zero capacity.
    pub fn new(capacity: usize) -> VaultResult<Self> {
        Ok(Self {
            entries: BoundedCache::new(capacity)?,
        })
    }

    /// Look up a client.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<dyn Client>> {
        self.entries.get(key)
    }

    /// Add a client under its own cache key.
    ///
    /// Returns the key of the client evicted to make room, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot report a cache key.
    pub fn add(&self, client: Arc<dyn Client>) -> VaultResult<Option<CacheKey>> {
        let key = client.cache_key()?;
        if key.is_empty() {
            return Err(VaultError::config("client reported an empty cache key"));
        }
        let evicted = self.entries.put(key, client).map(|(k, _)| k);
        if let Some(evicted) = &evicted {
            debug!(cache_key = %evicted, "Evicted client from cache");
        }
        Ok(evicted)
    }

    /// Remove a client, returning whether it was cached.
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Whether a client is cached under `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains(key)
    }

    /// Number of cached clients.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached keys from most to least recently used.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.keys()
    }
}

/// Cache of the most recent cache key per consumer.
#[derive(Debug)]
pub struct ObjectKeyCache {
    entries: BoundedCache<ObjectKey, CacheKey>,
}

impl ObjectKeyCache {
    /// Create an object key cache.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Config`] for a zero capacity.
    pub fn new(capacity: usize) -> VaultResult<Self> {
        Ok(Self {
            entries: BoundedCache::new(capacity)?,
        })
    }

    /// Key most recently derived for `object`.
    pub fn get(&self, object: &ObjectKey) -> Option<CacheKey> {
        self.entries.get(object)
    }

    /// Record `key` as the current key for `object`.
    pub fn add(&self, object: ObjectKey, key: CacheKey) -> Option<ObjectKey> {
        self.entries.put(object, key).map(|(o, _)| o)
    }

    /// Forget `object`, returning whether a mapping existed.
    pub fn remove(&self, object: &ObjectKey) -> bool {
        self.entries.remove(object).is_some()
    }

    /// Number of tracked consumers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no consumers are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
