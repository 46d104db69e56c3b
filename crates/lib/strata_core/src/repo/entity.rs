//! Generic cache-coherent repository for one entity kind.
//!
//! Writes go to the store first; caches change only after the store
//! accepted the write. Reads try the cache, then the store, and populate
//! every cache the fetched value belongs in.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, trace};

use super::{CatalogError, CatalogResult};
use crate::cache::{CacheStats, CategoryCache, ConcurrentCache, TableCache};
use crate::config::CacheTtls;
use crate::store::{Item, ItemKey, Query, RecordStore, TableSpec};

/// A secondary lookup: `(index name, attribute value)`.
pub type IndexKey = (&'static str, String);

/// A catalog entity stored as the primary item of its id.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Human-readable kind for logs and errors.
    const KIND: &'static str;

    /// Attributes that ordinary updates must not overwrite because they
    /// are changed only through conditional writes.
    const MANAGED_ATTRS: &'static [&'static str] = &[];

    fn table() -> &'static TableSpec;

    fn id(&self) -> &str;

    /// Reject the entity before it is written.
    fn validate(&self) -> CatalogResult<()> {
        Ok(())
    }

    /// Indexes whose value identifies at most one entity.
    fn unique_keys(&self) -> Vec<IndexKey> {
        Vec::new()
    }

    /// Indexes that group entities into listable categories.
    fn category_keys(&self) -> Vec<IndexKey> {
        Vec::new()
    }

    /// Copy the managed attributes of `previous` into `self`.
    fn keep_managed(&mut self, _previous: &Self) {}
}

/// Store access plus the caches for one entity kind.
pub struct EntityRepository<T: Entity> {
    store: Arc<dyn RecordStore>,
    stats: Arc<CacheStats>,
    by_id: ConcurrentCache<String, T>,
    unique: ConcurrentCache<IndexKey, T>,
    categories: CategoryCache<IndexKey, String, T>,
    all: TableCache<String, T>,
}

impl<T: Entity> EntityRepository<T> {
    pub fn new(store: Arc<dyn RecordStore>, stats: Arc<CacheStats>, ttls: CacheTtls) -> Self {
        Self {
            store,
            stats,
            by_id: ConcurrentCache::new(ttls.record),
            unique: ConcurrentCache::new(ttls.record),
            categories: CategoryCache::new(ttls.listing),
            all: TableCache::new(ttls.listing),
        }
    }

    pub fn table_name(&self) -> &'static str {
        T::table().name
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Write a new entity.
    pub async fn add(&self, entity: &T) -> CatalogResult<()> {
        entity.validate()?;
        let item = Item::from_value(ItemKey::primary(entity.id()), entity)?;
        if let Err(e) = self.store.put_item(self.table_name(), &item).await {
            error!(kind = T::KIND, id = entity.id(), error = %e, "failed to add record");
            return Err(e.into());
        }
        self.cache_insert(entity);
        Ok(())
    }

    /// Fetch by id.
    pub async fn get(&self, id: &str) -> CatalogResult<Option<T>> {
        if let Some(hit) = self.by_id.get(&id.to_string()) {
            self.stats.record_hit();
            trace!(kind = T::KIND, id, "cache hit");
            return Ok(Some(hit));
        }
        self.stats.record_miss();

        let item = self
            .store
            .get_item(self.table_name(), &ItemKey::primary(id))
            .await
            .inspect_err(|e| error!(kind = T::KIND, id, error = %e, "failed to fetch record"))?;
        match item {
            Some(item) => {
                let entity: T = item.to_value()?;
                self.cache_insert(&entity);
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// Re-read `id` from the store, replacing whatever is cached.
    pub async fn refresh(&self, id: &str) -> CatalogResult<Option<T>> {
        let item = self
            .store
            .get_item(self.table_name(), &ItemKey::primary(id))
            .await?;
        match item {
            Some(item) => {
                let entity: T = item.to_value()?;
                self.cache_insert(&entity);
                Ok(Some(entity))
            }
            None => {
                self.evict(id, None);
                Ok(None)
            }
        }
    }

    /// Fetch by id, treating absence as an error.
    pub async fn require(&self, id: &str) -> CatalogResult<T> {
        self.get(id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("{} {id}", T::KIND)))
    }

    /// Fetch the single entity whose `index` attribute equals `value`.
    pub async fn find_unique(&self, index: &'static str, value: &str) -> CatalogResult<Option<T>> {
        let key = (index, value.to_string());
        if let Some(hit) = self.unique.get(&key) {
            self.stats.record_hit();
            return Ok(Some(hit));
        }
        self.stats.record_miss();

        let items = self
            .store
            .query_all(self.table_name(), &Query::Index { index, value })
            .await
            .inspect_err(|e| error!(kind = T::KIND, index, error = %e, "index query failed"))?;
        let mut matches = items.into_iter().filter(|i| i.key.is_primary());
        let Some(first) = matches.next() else {
            return Ok(None);
        };
        if matches.next().is_some() {
            error!(kind = T::KIND, index, value, "unique index returned several records");
            return Err(CatalogError::Integrity(format!(
                "{} index {index} has several records for '{value}'",
                T::KIND
            )));
        }
        let entity: T = first.to_value()?;
        self.cache_insert(&entity);
        Ok(Some(entity))
    }

    /// Overwrite the attributes of an existing entity.
    ///
    /// [`Entity::MANAGED_ATTRS`] are left untouched in the store.
    pub async fn update(&self, entity: &T) -> CatalogResult<()> {
        entity.validate()?;
        let mut item = Item::from_value(ItemKey::primary(entity.id()), entity)?;
        for attr in T::MANAGED_ATTRS {
            item.attrs.remove(*attr);
        }
        let previous = self.by_id.peek_stale(&entity.id().to_string());

        let updated = self
            .store
            .update_item(self.table_name(), &item.key, &item.attrs, None)
            .await
            .inspect_err(|e| error!(kind = T::KIND, id = entity.id(), error = %e, "failed to update record"))?;
        if !updated {
            return Err(CatalogError::NotFound(format!("{} {}", T::KIND, entity.id())));
        }

        if let Some(prev) = &previous {
            self.evict_secondary(prev);
        }
        match (T::MANAGED_ATTRS.is_empty(), self.by_id.get(&entity.id().to_string())) {
            (true, _) => self.cache_insert(entity),
            (false, Some(live)) => {
                let mut merged = entity.clone();
                merged.keep_managed(&live);
                self.cache_insert(&merged);
            }
            // the managed attributes are unknown; let the next read fetch them
            (false, None) => self.invalidate(entity),
        }
        Ok(())
    }

    /// Delete the entity and every item in its partition.
    ///
    /// Returns the removed entity.
    pub async fn remove(&self, id: &str) -> CatalogResult<T> {
        let items = self
            .store
            .query_all(self.table_name(), &Query::Partition(id))
            .await
            .inspect_err(|e| error!(kind = T::KIND, id, error = %e, "failed to list record items"))?;
        let Some(primary) = items.iter().find(|i| i.key.is_primary()) else {
            return Err(CatalogError::NotFound(format!("{} {id}", T::KIND)));
        };
        let stored: T = primary.to_value()?;

        // ancillary items first so a failure never leaves orphans behind a
        // missing primary record
        for item in items.iter().filter(|i| !i.key.is_primary()) {
            self.store
                .delete_item(self.table_name(), &item.key, None)
                .await
                .inspect_err(|e| error!(kind = T::KIND, id, error = %e, "failed to delete item"))?;
        }
        self.store
            .delete_item(self.table_name(), &primary.key, None)
            .await
            .inspect_err(|e| error!(kind = T::KIND, id, error = %e, "failed to delete record"))?;

        let cached = self.by_id.peek_stale(&id.to_string());
        self.evict(id, Some(cached.as_ref().unwrap_or(&stored)));
        if cached.as_ref().is_some_and(|c| !same_keys(c, &stored)) {
            self.evict_secondary(&stored);
        }
        Ok(stored)
    }

    /// Every entity of this kind.
    pub async fn list_all(&self) -> CatalogResult<Vec<T>> {
        if let Some(hit) = self.all.list(&()) {
            self.stats.record_hit();
            return Ok(sorted(hit));
        }
        self.stats.record_miss();

        let items = self
            .store
            .scan_all(self.table_name(), None)
            .await
            .inspect_err(|e| error!(kind = T::KIND, error = %e, "table scan failed"))?;
        let entities = decode_primary::<T>(items)?;
        for e in &entities {
            self.cache_insert(e);
        }
        self.all.replace_all(
            (),
            entities.iter().map(|e| (e.id().to_string(), e.clone())),
        );
        Ok(sorted(entities))
    }

    /// Every entity whose `index` attribute equals `value`.
    pub async fn list_by(&self, index: &'static str, value: &str) -> CatalogResult<Vec<T>> {
        let category = (index, value.to_string());
        if let Some(hit) = self.categories.list(&category) {
            self.stats.record_hit();
            return Ok(sorted(hit));
        }
        self.stats.record_miss();

        let items = self
            .store
            .query_all(self.table_name(), &Query::Index { index, value })
            .await
            .inspect_err(|e| error!(kind = T::KIND, index, error = %e, "index query failed"))?;
        let entities = decode_primary::<T>(items)?;
        for e in &entities {
            self.cache_insert(e);
        }
        self.categories.replace_all(
            category,
            entities.iter().map(|e| (e.id().to_string(), e.clone())),
        );
        Ok(sorted(entities))
    }

    /// Record a value known to match the store in every cache.
    pub fn cache_insert(&self, entity: &T) {
        let id = entity.id().to_string();
        self.by_id.upsert(id.clone(), entity.clone());
        for key in entity.unique_keys() {
            self.unique.upsert(key, entity.clone());
        }
        for category in entity.category_keys() {
            self.categories.insert(category, id.clone(), entity.clone());
        }
        self.all.insert((), id, entity.clone());
    }

    /// Drop `id` from every cache. `known` supplies the secondary keys; when
    /// it is `None` every category is searched.
    pub fn evict(&self, id: &str, known: Option<&T>) {
        let id = id.to_string();
        let previous = self.by_id.remove(&id);
        match known.or(previous.as_ref()) {
            Some(entity) => self.evict_secondary(entity),
            None => self.categories.remove_everywhere(&id),
        }
        self.all.remove(&(), &id);
    }

    /// Apply `change` to the cached copy of `id` after a targeted store
    /// write. Without a live copy, every cache that may hold one is dropped.
    pub fn modify_cached<F>(&self, id: &str, change: F)
    where
        F: FnOnce(&mut T),
    {
        match self.by_id.get(&id.to_string()) {
            Some(mut entity) => {
                change(&mut entity);
                self.cache_insert(&entity);
            }
            None => {
                if let Some(stale) = self.by_id.remove(&id.to_string()) {
                    self.invalidate(&stale);
                } else {
                    self.categories.remove_categories_containing(&id.to_string());
                    self.all.remove_category(&());
                }
            }
        }
    }

    /// Drop `entity` from the record caches and forget every listing that
    /// contains it. Unlike [`EntityRepository::evict`] the entity still
    /// exists, so listings cannot just lose the member.
    fn invalidate(&self, entity: &T) {
        let id = entity.id().to_string();
        self.by_id.remove(&id);
        for key in entity.unique_keys() {
            self.unique.remove(&key);
        }
        for category in entity.category_keys() {
            self.categories.remove_category(&category);
        }
        self.categories.remove_categories_containing(&id);
        self.all.remove_category(&());
    }

    fn evict_secondary(&self, entity: &T) {
        let id = entity.id().to_string();
        for key in entity.unique_keys() {
            // only drop the unique entry if it still points at this entity
            if self.unique.peek_stale(&key).is_some_and(|e| e.id() == id) {
                self.unique.remove(&key);
            }
        }
        for category in entity.category_keys() {
            self.categories.remove(&category, &id);
        }
    }

    /// Forget everything cached for this kind.
    pub fn clear(&self) {
        self.by_id.clear();
        self.unique.clear();
        self.categories.clear();
        self.all.clear();
    }
}

fn same_keys<T: Entity>(a: &T, b: &T) -> bool {
    a.unique_keys() == b.unique_keys() && a.category_keys() == b.category_keys()
}

fn decode_primary<T: Entity>(items: Vec<Item>) -> CatalogResult<Vec<T>> {
    items
        .into_iter()
        .filter(|i| i.key.is_primary())
        .map(|i| i.to_value::<T>().map_err(CatalogError::from))
        .collect()
}

fn sorted<T: Entity>(mut v: Vec<T>) -> Vec<T> {
    v.sort_by(|a, b| a.id().cmp(b.id()));
    v
}
