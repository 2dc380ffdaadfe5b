//! Size-bounded LRU caches for resolved keyspace ids.
//!
//! [`KeyspaceIdCache`] wraps an [`lru::LruCache`] in a mutex for sharing
//! across request tasks; the lock is held only for in-memory list updates.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use lru::LruCache;
use serde::Serialize;

/// Point-in-time cache counters for one vindex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries currently cached.
    pub length: u64,
    /// Maximum number of entries.
    pub capacity: u64,
    /// Entries dropped to make room for newer ones.
    pub evictions: u64,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that had to go to the store.
    pub misses: u64,
}

/// Shared cache from canonical value keys to keyspace ids.
///
/// A capacity of zero stores nothing.
pub struct KeyspaceIdCache {
    /// `None` when the capacity is zero.
    entries: Option<Mutex<LruCache<String, Vec<u8>>>>,
    /// Configured entry bound.
    capacity: usize,
    /// Lookups that found an entry.
    hits: AtomicU64,
    /// Lookups that found nothing.
    misses: AtomicU64,
    /// Entries pushed out by newer ones.
    evictions: AtomicU64,
}

impl KeyspaceIdCache {
    pub fn new(capacity: usize) -> Self {
        // `LruCache::new` preallocates the full bound.
        let entries = NonZeroUsize::new(capacity).map(|bound| {
            let mut cache = LruCache::unbounded();
            cache.resize(bound);
            Mutex::new(cache)
        });
        Self {
            entries,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, LruCache<String, Vec<u8>>>> {
        self.entries
            .as_ref()
            .map(|entries| entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Looks up a key, counting the hit or miss. A hit becomes the most
    /// recently used entry.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let found = self.lock().and_then(|mut cache| cache.get(key).cloned());
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Inserts or replaces an entry, evicting the least recently used one
    /// when full.
    pub fn set(&self, key: String, ksid: Vec<u8>) {
        let Some(mut cache) = self.lock() else {
            return;
        };
        if let Some((displaced, _)) = cache.push(key.clone(), ksid) {
            if displaced != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map_or(0, |cache| cache.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sorted copy of the cached entries.
    pub fn items(&self) -> BTreeMap<String, Vec<u8>> {
        self.lock()
            .map(|cache| {
                cache
                    .iter()
                    .map(|(key, ksid)| (key.clone(), ksid.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            length: self.len() as u64,
            capacity: self.capacity as u64,
            evictions: self.evictions.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
