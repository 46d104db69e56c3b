//! In-process record store.
//!
//! Holds tables in ordered maps keyed by `(id, sort_key)` so pagination
//! follows the same order as the Postgres store. Used by the test suites and
//! for running the catalog without a database. A few knobs make failure
//! paths reachable: a small page size forces multi-page listings, write
//! failures can be injected, and new indexes can be made to report "not
//! ready" for a number of polls.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{
    Attributes, Condition, IndexDescription, IndexSpec, Item, ItemKey, Page, Query, RecordStore,
    StoreError, StoreResult, TableDescription, TableSpec,
};

/// Default number of items per page.
const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug)]
struct MemIndex {
    desc: IndexDescription,
    polls_until_ready: u32,
}

#[derive(Debug, Default)]
struct MemTable {
    indexes: Vec<MemIndex>,
    items: BTreeMap<(String, String), Attributes>,
}

impl MemTable {
    fn index_key(&self, table: &str, index: &str) -> StoreResult<String> {
        let idx = self
            .indexes
            .iter()
            .find(|i| i.desc.name == index)
            .ok_or_else(|| StoreError::Unavailable(format!("index '{index}' not found on '{table}'")))?;
        if !idx.desc.ready {
            return Err(StoreError::Unavailable(format!(
                "index '{index}' on '{table}' is still building"
            )));
        }
        Ok(idx.desc.key.clone())
    }
}

/// Operation counters for a [`MemoryRecordStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub reads: u64,
    pub writes: u64,
}

/// A [`RecordStore`] kept entirely in memory.
#[derive(Debug)]
pub struct MemoryRecordStore {
    tables: RwLock<HashMap<String, MemTable>>,
    page_size: usize,
    index_build_polls: u32,
    fail_writes: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
            index_build_polls: 0,
            fail_writes: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Create a store whose pages hold at most `page_size` items.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            ..Self::new()
        }
    }

    /// Newly created indexes report not-ready for `polls` describe calls.
    pub fn set_index_build_polls(&mut self, polls: u32) {
        self.index_build_polls = polls;
    }

    /// Make every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
        }
    }

    /// Install an index exactly as described, creating the table if needed.
    ///
    /// Lets callers reproduce an index left behind by an older deployment.
    pub fn seed_index(&self, table: &str, desc: IndexDescription) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let t = tables.entry(table.to_string()).or_default();
        t.indexes.retain(|i| i.desc.name != desc.name);
        t.indexes.push(MemIndex {
            desc,
            polls_until_ready: 0,
        });
    }

    /// Number of items currently stored in `table`.
    pub fn item_count(&self, table: &str) -> usize {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.get(table).map_or(0, |t| t.items.len())
    }

    fn check_writable(&self) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn new_index(&self, spec: &IndexSpec) -> MemIndex {
        MemIndex {
            desc: IndexDescription {
                name: spec.name.to_string(),
                key: spec.key.to_string(),
                projection: spec.projection.iter().map(|s| s.to_string()).collect(),
                ready: self.index_build_polls == 0,
            },
            polls_until_ready: self.index_build_polls,
        }
    }

    fn page<'a, I>(&self, matching: I, start_after: Option<&ItemKey>) -> StoreResult<Page>
    where
        I: Iterator<Item = (&'a (String, String), &'a Attributes)>,
    {
        let start = start_after.map(|k| (k.id.clone(), k.sort_key()));
        let mut rows: Vec<_> = matching
            .filter(|(k, _)| start.as_ref().is_none_or(|s| *k > s))
            .take(self.page_size + 1)
            .collect();
        let more = rows.len() > self.page_size;
        rows.truncate(self.page_size);

        let items = rows
            .into_iter()
            .map(|((id, sort), attrs)| Ok(Item::new(ItemKey::decode(id, sort)?, attrs.clone())))
            .collect::<StoreResult<Vec<_>>>()?;
        let next = if more {
            items.last().map(|i| i.key.clone())
        } else {
            None
        };
        Ok(Page { items, next })
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown(table: &str) -> StoreError {
    StoreError::UnknownTable(table.to_string())
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn describe_table(&self, table: &str) -> StoreResult<Option<TableDescription>> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let Some(t) = tables.get_mut(table) else {
            return Ok(None);
        };
        for idx in &mut t.indexes {
            if idx.polls_until_ready > 0 {
                idx.polls_until_ready -= 1;
            }
            if idx.polls_until_ready == 0 {
                idx.desc.ready = true;
            }
        }
        Ok(Some(TableDescription {
            name: table.to_string(),
            ready: true,
            indexes: t.indexes.iter().map(|i| i.desc.clone()).collect(),
        }))
    }

    async fn create_table(&self, spec: &TableSpec) -> StoreResult<()> {
        let indexes = spec.indexes.iter().map(|i| self.new_index(i)).collect();
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.entry(spec.name.to_string()).or_insert(MemTable {
            indexes,
            items: BTreeMap::new(),
        });
        Ok(())
    }

    async fn create_index(&self, table: &str, index: &IndexSpec) -> StoreResult<()> {
        let idx = self.new_index(index);
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let t = tables.get_mut(table).ok_or_else(|| unknown(table))?;
        if !t.indexes.iter().any(|i| i.desc.name == index.name) {
            t.indexes.push(idx);
        }
        Ok(())
    }

    async fn drop_index(&self, table: &str, index: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let t = tables.get_mut(table).ok_or_else(|| unknown(table))?;
        t.indexes.retain(|i| i.desc.name != index);
        Ok(())
    }

    async fn get_item(&self, table: &str, key: &ItemKey) -> StoreResult<Option<Item>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let t = tables.get(table).ok_or_else(|| unknown(table))?;
        Ok(t
            .items
            .get(&(key.id.clone(), key.sort_key()))
            .map(|attrs| Item::new(key.clone(), attrs.clone())))
    }

    async fn put_item(&self, table: &str, item: &Item) -> StoreResult<()> {
        self.check_writable()?;
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let t = tables.get_mut(table).ok_or_else(|| unknown(table))?;
        t.items
            .insert((item.key.id.clone(), item.key.sort_key()), item.attrs.clone());
        Ok(())
    }

    async fn update_item(
        &self,
        table: &str,
        key: &ItemKey,
        changes: &Attributes,
        condition: Option<&Condition>,
    ) -> StoreResult<bool> {
        self.check_writable()?;
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let t = tables.get_mut(table).ok_or_else(|| unknown(table))?;
        let Some(attrs) = t.items.get_mut(&(key.id.clone(), key.sort_key())) else {
            return Ok(false);
        };
        if condition.is_some_and(|c| !c.matches(attrs)) {
            return Ok(false);
        }
        for (k, v) in changes {
            attrs.insert(k.clone(), v.clone());
        }
        Ok(true)
    }

    async fn delete_item(
        &self,
        table: &str,
        key: &ItemKey,
        condition: Option<&Condition>,
    ) -> StoreResult<bool> {
        self.check_writable()?;
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let t = tables.get_mut(table).ok_or_else(|| unknown(table))?;
        let k = (key.id.clone(), key.sort_key());
        match t.items.get(&k) {
            Some(attrs) if condition.is_none_or(|c| c.matches(attrs)) => {
                t.items.remove(&k);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn query_page(
        &self,
        table: &str,
        query: &Query<'_>,
        start_after: Option<&ItemKey>,
    ) -> StoreResult<Page> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let t = tables.get(table).ok_or_else(|| unknown(table))?;
        match *query {
            Query::Partition(id) => {
                let matching = t.items.iter().filter(|((item_id, _), _)| item_id == id);
                self.page(matching, start_after)
            }
            Query::Index { index, value } => {
                let attr = t.index_key(table, index)?;
                let matching = t
                    .items
                    .iter()
                    .filter(|(_, attrs)| attrs.get(&attr).and_then(|v| v.as_str()) == Some(value));
                self.page(matching, start_after)
            }
        }
    }

    async fn scan_page(
        &self,
        table: &str,
        filter: Option<&Condition>,
        start_after: Option<&ItemKey>,
    ) -> StoreResult<Page> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let t = tables.get(table).ok_or_else(|| unknown(table))?;
        let matching = t
            .items
            .iter()
            .filter(|(_, attrs)| filter.is_none_or(|c| c.matches(attrs)));
        self.page(matching, start_after)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const THINGS: TableSpec = TableSpec {
        name: "things",
        indexes: &[IndexSpec {
            name: "ByName",
            key: "name",
            projection: &[],
        }],
    };

    fn attrs(v: serde_json::Value) -> Attributes {
        v.as_object().cloned().unwrap()
    }

    async fn seeded(page_size: usize, n: usize) -> MemoryRecordStore {
        let store = MemoryRecordStore::with_page_size(page_size);
        store.create_table(&THINGS).await.unwrap();
        for i in 0..n {
            let item = Item::new(
                ItemKey::primary(format!("T_{i:03}")),
                attrs(json!({"name": if i % 2 == 0 { "even" } else { "odd" }})),
            );
            store.put_item("things", &item).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn scan_all_follows_every_page() {
        let store = seeded(3, 10).await;
        let first = store.scan_page("things", None, None).await.unwrap();
        assert_eq!(first.items.len(), 3);
        assert!(first.next.is_some());

        let all = store.scan_all("things", None).await.unwrap();
        assert_eq!(all.len(), 10);
        // 4 pages of 3 + the explicit first page above
        assert_eq!(store.stats().reads, 5);
    }

    #[tokio::test]
    async fn index_query_pages_match_only() {
        let store = seeded(2, 9).await;
        let even = store
            .query_all(
                "things",
                &Query::Index {
                    index: "ByName",
                    value: "even",
                },
            )
            .await
            .unwrap();
        assert_eq!(even.len(), 5);
        assert!(even.iter().all(|i| i.attr_str("name") == Some("even")));
    }

    #[tokio::test]
    async fn partition_query_returns_ancillary_items() {
        let store = seeded(10, 1).await;
        let cfg = Item::new(ItemKey::config("T_000"), attrs(json!({"config": "x"})));
        store.put_item("things", &cfg).await.unwrap();
        let items = store
            .query_all("things", &Query::Partition("T_000"))
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].key.is_primary());
    }

    #[tokio::test]
    async fn conditional_update_and_delete() {
        let store = seeded(10, 0).await;
        let key = ItemKey::primary("T_x");
        store
            .put_item("things", &Item::new(key.clone(), attrs(json!({"inUse": false}))))
            .await
            .unwrap();

        let guard = Condition::new().eq("inUse", false);
        let set = attrs(json!({"inUse": true}));
        assert!(store.update_item("things", &key, &set, Some(&guard)).await.unwrap());
        assert!(!store.update_item("things", &key, &set, Some(&guard)).await.unwrap());
        assert!(!store.delete_item("things", &key, Some(&guard)).await.unwrap());
        assert!(store.delete_item("things", &key, None).await.unwrap());
        assert!(store.get_item("things", &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_of_missing_item_reports_false() {
        let store = seeded(10, 0).await;
        let changed = store
            .update_item("things", &ItemKey::primary("nope"), &Attributes::new(), None)
            .await
            .unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn injected_failures_block_writes() {
        let store = seeded(10, 0).await;
        store.set_fail_writes(true);
        let item = Item::new(ItemKey::primary("T_1"), Attributes::new());
        assert!(store.put_item("things", &item).await.is_err());
        store.set_fail_writes(false);
        assert!(store.put_item("things", &item).await.is_ok());
    }

    #[tokio::test]
    async fn building_index_rejects_queries_until_ready() {
        let mut store = MemoryRecordStore::new();
        store.set_index_build_polls(2);
        store.create_table(&THINGS).await.unwrap();
        let q = Query::Index {
            index: "ByName",
            value: "x",
        };
        assert!(store.query_page("things", &q, None).await.is_err());
        let d = store.describe_table("things").await.unwrap().unwrap();
        assert!(!d.all_ready());
        let d = store.describe_table("things").await.unwrap().unwrap();
        assert!(d.all_ready());
        assert!(store.query_page("things", &q, None).await.is_ok());
    }
}
