//! Striped per-key locking.
//!
//! Keys hash onto a fixed set of async mutexes. Two keys on the same stripe
//! serialize; a single stripe is equivalent to one global lock.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};

/// Default number of lock stripes.
pub const DEFAULT_LOCK_STRIPES: usize = 64;

/// Fixed set of async mutexes indexed by key hash.
#[derive(Debug)]
pub struct StripedLock {
    stripes: Vec<Mutex<()>>,
}

impl StripedLock {
    /// Create a lock with `stripes` stripes; zero is treated as one.
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        let stripes = (0..stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self { stripes }
    }

    /// Number of stripes.
    #[must_use]
    pub fn stripes(&self) -> usize {
        self.stripes.len()
    }

    /// Stripe index for `key`.
    #[must_use]
    pub fn stripe_for<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        // truncation is fine, only the low bits pick the stripe
        #[allow(clippy::cast_possible_truncation)]
        let hash = hasher.finish() as usize;
        hash % self.stripes.len()
    }

    /// Acquire the stripe guarding `key`.
    pub async fn lock<K: Hash + ?Sized>(&self, key: &K) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_for(key)].lock().await
    }
}

impl Default for StripedLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_STRIPES)
    }
}
