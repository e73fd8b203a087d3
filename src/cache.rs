//! Duplicate-suppression cache for unique events.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;

/// Default ceiling on distinct uniqueness keys tracked at once.
pub const MAX_UNIQUE_EVENTS: usize = 1024;

/// Capacity-bounded key-to-expiry store.
///
/// Entries expire after their suppression window; at capacity the least
/// recently used key is evicted, so memory stays bounded no matter how many
/// distinct unique keys are seen. Suppression is best-effort and
/// time-windowed, not exactly-once.
pub struct DedupCache {
    entries: Mutex<LruCache<String, Instant>>,
}

impl DedupCache {
    /// Allocate a cache tracking up to `capacity` outstanding keys.
    ///
    /// Returns `None` for a zero capacity.
    pub fn new(capacity: usize) -> Option<Self> {
        let capacity = NonZeroUsize::new(capacity)?;
        Some(Self {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// True if `key` is present and its window has not yet expired.
    ///
    /// Expired entries are dropped on lookup.
    pub fn get(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(expires_at) if *expires_at > Instant::now() => true,
            Some(_) => {
                entries.pop(key);
                false
            }
            None => false,
        }
    }

    /// Record `key`, suppressing duplicates for `window` from now.
    pub fn set(&self, key: &str, window: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.put(key.to_string(), Instant::now() + window);
    }

    /// Record `key` unless it is already present and unexpired, under one
    /// lock acquisition so concurrent callers cannot both claim the key.
    ///
    /// Returns true if the key was inserted, false on a live duplicate.
    pub fn insert_if_absent(&self, key: &str, window: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(expires_at) = entries.get(key) {
            if *expires_at > now {
                return false;
            }
        }
        entries.put(key.to_string(), now + window);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
