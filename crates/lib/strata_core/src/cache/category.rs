//! Category listings with a shared completeness watermark.
//!
//! A category (for example "clusters owned by group G") is only answered
//! from cache while its watermark is in the future. Inserting a member
//! never moves the watermark; only [`CategoryCache::replace_all`], called
//! after a complete store-backed listing, does. A cached list is therefore
//! never claimed complete on the strength of partial data.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug)]
struct Category<K, V> {
    members: HashMap<K, V>,
    watermark: Option<Instant>,
}

impl<K, V> Default for Category<K, V> {
    fn default() -> Self {
        Self {
            members: HashMap::new(),
            watermark: None,
        }
    }
}

/// Maps a category key to the set of members cached for it.
#[derive(Debug)]
pub struct CategoryCache<C, K, V>
where
    C: Eq + Hash,
{
    categories: DashMap<C, Category<K, V>>,
    ttl: Duration,
}

/// The whole-table form: one category, one global watermark.
pub type TableCache<K, V> = CategoryCache<(), K, V>;

impl<C, K, V> CategoryCache<C, K, V>
where
    C: Eq + Hash + Clone,
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            categories: DashMap::new(),
            ttl,
        }
    }

    /// All members of `category`, if a complete listing is still fresh.
    pub fn list(&self, category: &C) -> Option<Vec<V>> {
        let cat = self.categories.get(category)?;
        match cat.watermark {
            Some(w) if Instant::now() < w => Some(cat.members.values().cloned().collect()),
            _ => None,
        }
    }

    /// Add or replace one member without touching the watermark.
    pub fn insert(&self, category: C, key: K, value: V) {
        self.categories
            .entry(category)
            .or_default()
            .members
            .insert(key, value);
    }

    /// Remove one member, returning it.
    pub fn remove(&self, category: &C, key: &K) -> Option<V> {
        self.categories
            .get_mut(category)
            .and_then(|mut cat| cat.members.remove(key))
    }

    /// Install a complete listing and advance the watermark.
    pub fn replace_all<I>(&self, category: C, members: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let fresh = Category {
            members: members.into_iter().collect(),
            watermark: Some(Instant::now() + self.ttl),
        };
        self.categories.insert(category, fresh);
    }

    /// Forget a category entirely.
    pub fn remove_category(&self, category: &C) {
        self.categories.remove(category);
    }

    /// Remove `key` from every category it appears in.
    pub fn remove_everywhere(&self, key: &K) {
        for mut cat in self.categories.iter_mut() {
            cat.members.remove(key);
        }
    }

    /// Forget every category that has `key` as a member.
    ///
    /// Used when a member changed in a way the cache cannot follow, so no
    /// listing keeps serving the stale copy.
    pub fn remove_categories_containing(&self, key: &K) {
        self.categories.retain(|_, cat| !cat.members.contains_key(key));
    }

    /// Whether the listing for `category` is currently complete.
    pub fn is_complete(&self, category: &C) -> bool {
        self.categories
            .get(category)
            .and_then(|cat| cat.watermark)
            .is_some_and(|w| Instant::now() < w)
    }

    pub fn clear(&self) {
        self.categories.clear();
    }
}
