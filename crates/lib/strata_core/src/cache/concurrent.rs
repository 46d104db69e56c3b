//! Thread-safe keyed cache with per-entry TTL.

use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::CacheRecord;

/// A concurrent map from key to [`CacheRecord`].
///
/// Every operation takes the shard lock for its key only, so a reader never
/// observes a half-applied upsert and callers need no external lock.
#[derive(Debug)]
pub struct ConcurrentCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, CacheRecord<V>>,
    ttl: Duration,
}

impl<K, V> ConcurrentCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a live value, or `None` on a miss or an expired entry.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).and_then(|rec| rec.get().cloned())
    }

    /// Insert or replace the value for `key`, restarting its TTL.
    pub fn upsert(&self, key: K, value: V) {
        self.entries.insert(key, CacheRecord::new(value, self.ttl));
    }

    /// Insert `value`, or merge it into the live existing value.
    ///
    /// `merge(existing, incoming)` runs under the entry lock. An expired
    /// existing value is replaced rather than merged.
    pub fn upsert_with<F>(&self, key: K, value: V, merge: F)
    where
        F: FnOnce(&V, V) -> V,
    {
        match self.entries.entry(key) {
            Entry::Occupied(mut occ) => {
                let next = match occ.get().get() {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                occ.insert(CacheRecord::new(next, self.ttl));
            }
            Entry::Vacant(vac) => {
                vac.insert(CacheRecord::new(value, self.ttl));
            }
        }
    }

    /// Remove `key`, returning the previous value even if it had expired.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, rec)| rec.into_value())
    }

    /// The last value seen for `key`, expired or not.
    pub fn peek_stale(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|rec| rec.stale().clone())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry whose key matches `pred`.
    pub fn remove_where<F>(&self, pred: F)
    where
        F: Fn(&K) -> bool,
    {
        self.entries.retain(|k, _| !pred(k));
    }

    /// Drop expired entries.
    pub fn evict_expired(&self) {
        self.entries.retain(|_, rec| rec.is_live());
    }
}
