//! Durable record store abstraction.
//!
//! Every entity kind lives in its own table of items addressed by
//! [`ItemKey`]. Tables expose secondary indexes on the attributes callers
//! look things up by (name, owning group, cluster, token, ...). Listing
//! operations hide pagination: `query_all`/`scan_all` follow continuation
//! keys until the store reports no more pages.

mod keys;
pub mod memory;
pub mod postgres;
pub mod schema;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

pub use keys::{ItemKey, KeySuffix};
pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

/// JSON object holding an item's attributes.
pub type Attributes = serde_json::Map<String, Value>;

/// Errors raised by record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid item key: {0}")]
    Key(String),

    #[error("Table '{table}' item {key} is missing attribute '{attribute}'")]
    MissingAttribute {
        table: String,
        key: String,
        attribute: String,
    },

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Data integrity violation: {0}")]
    Integrity(String),

    #[error("Table '{0}' not ready after {1:?}")]
    NotReady(String, Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for record store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One stored item.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub key: ItemKey,
    pub attrs: Attributes,
}

impl Item {
    pub fn new(key: ItemKey, attrs: Attributes) -> Self {
        Self { key, attrs }
    }

    /// Build an item whose attributes are the serde form of `value`.
    pub fn from_value<T: Serialize>(key: ItemKey, value: &T) -> StoreResult<Self> {
        match serde_json::to_value(value)? {
            Value::Object(attrs) => Ok(Self { key, attrs }),
            other => Err(StoreError::Key(format!(
                "item {key} must serialize to an object, got {other}"
            ))),
        }
    }

    /// Decode the attributes into `T`.
    pub fn to_value<T: DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(serde_json::from_value(Value::Object(self.attrs.clone()))?)
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(Value::as_str)
    }

    /// A string attribute that must exist on this item.
    pub fn require_str(&self, table: &str, name: &str) -> StoreResult<&str> {
        self.attr_str(name).ok_or_else(|| StoreError::MissingAttribute {
            table: table.to_string(),
            key: self.key.to_string(),
            attribute: name.to_string(),
        })
    }
}

/// A conjunction of attribute-equals predicates.
///
/// Used as the guard of conditional writes and as a scan filter. An empty
/// condition matches every item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Condition {
    equals: Attributes,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `name == value`.
    pub fn eq(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.equals.insert(name.to_string(), value.into());
        self
    }

    pub fn matches(&self, attrs: &Attributes) -> bool {
        self.equals
            .iter()
            .all(|(k, v)| attrs.get(k).is_some_and(|actual| actual == v))
    }

    /// The predicate as a JSON object (used for JSONB containment).
    pub fn to_json(&self) -> Value {
        Value::Object(self.equals.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }
}

/// Which items a query selects.
#[derive(Debug, Clone, Copy)]
pub enum Query<'a> {
    /// Every item sharing an entity id (primary, ancillary and edges).
    Partition(&'a str),
    /// Items whose indexed attribute equals `value`.
    Index { index: &'a str, value: &'a str },
}

/// One page of results plus the key to continue after.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Item>,
    pub next: Option<ItemKey>,
}

/// Declared secondary index of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    /// Attribute the index is keyed on.
    pub key: &'static str,
    /// Attributes the index must carry besides the key.
    pub projection: &'static [&'static str],
}

/// Declared table layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub indexes: &'static [IndexSpec],
}

impl TableSpec {
    pub fn index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// An index as the store currently reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescription {
    pub name: String,
    pub key: String,
    pub projection: Vec<String>,
    pub ready: bool,
}

impl IndexDescription {
    /// Whether this index carries every attribute `spec` requires.
    pub fn covers(&self, spec: &IndexSpec) -> bool {
        self.key == spec.key
            && spec
                .projection
                .iter()
                .all(|attr| self.projection.iter().any(|p| p == attr))
    }
}

/// A table as the store currently reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescription {
    pub name: String,
    pub ready: bool,
    pub indexes: Vec<IndexDescription>,
}

impl TableDescription {
    pub fn index(&self, name: &str) -> Option<&IndexDescription> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Table and every index are usable.
    pub fn all_ready(&self) -> bool {
        self.ready && self.indexes.iter().all(|i| i.ready)
    }
}

/// The durable backing store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Describe a table, or `None` if it does not exist.
    async fn describe_table(&self, table: &str) -> StoreResult<Option<TableDescription>>;

    /// Create a table together with all its declared indexes.
    async fn create_table(&self, spec: &TableSpec) -> StoreResult<()>;

    async fn create_index(&self, table: &str, index: &IndexSpec) -> StoreResult<()>;

    async fn drop_index(&self, table: &str, index: &str) -> StoreResult<()>;

    async fn get_item(&self, table: &str, key: &ItemKey) -> StoreResult<Option<Item>>;

    /// Insert or overwrite an item.
    async fn put_item(&self, table: &str, item: &Item) -> StoreResult<()>;

    /// Merge `changes` into an existing item.
    ///
    /// Returns `false` when the item does not exist or `condition` does not
    /// hold at the moment of the write.
    async fn update_item(
        &self,
        table: &str,
        key: &ItemKey,
        changes: &Attributes,
        condition: Option<&Condition>,
    ) -> StoreResult<bool>;

    /// Delete an item. Returns `false` when nothing matched.
    async fn delete_item(
        &self,
        table: &str,
        key: &ItemKey,
        condition: Option<&Condition>,
    ) -> StoreResult<bool>;

    async fn query_page(
        &self,
        table: &str,
        query: &Query<'_>,
        start_after: Option<&ItemKey>,
    ) -> StoreResult<Page>;

    async fn scan_page(
        &self,
        table: &str,
        filter: Option<&Condition>,
        start_after: Option<&ItemKey>,
    ) -> StoreResult<Page>;

    /// Run a query to exhaustion.
    async fn query_all(&self, table: &str, query: &Query<'_>) -> StoreResult<Vec<Item>> {
        let mut items = Vec::new();
        let mut start: Option<ItemKey> = None;
        loop {
            let page = self.query_page(table, query, start.as_ref()).await?;
            items.extend(page.items);
            match page.next {
                Some(next) => start = Some(next),
                None => return Ok(items),
            }
        }
    }

    /// Scan a table to exhaustion.
    async fn scan_all(&self, table: &str, filter: Option<&Condition>) -> StoreResult<Vec<Item>> {
        let mut items = Vec::new();
        let mut start: Option<ItemKey> = None;
        loop {
            let page = self.scan_page(table, filter, start.as_ref()).await?;
            items.extend(page.items);
            match page.next {
                Some(next) => start = Some(next),
                None => return Ok(items),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Thing {
        name: String,
        count: u32,
    }

    #[test]
    fn item_value_roundtrip() {
        let thing = Thing {
            name: "a".into(),
            count: 3,
        };
        let item = Item::from_value(ItemKey::primary("X_1"), &thing).unwrap();
        assert_eq!(item.attr_str("name"), Some("a"));
        assert_eq!(item.to_value::<Thing>().unwrap(), thing);
    }

    #[test]
    fn non_object_values_are_rejected() {
        assert!(Item::from_value(ItemKey::primary("X_1"), &42).is_err());
    }

    #[test]
    fn require_str_reports_missing_attribute() {
        let item = Item::new(ItemKey::primary("X_1"), Attributes::new());
        let err = item.require_str("things", "name").unwrap_err();
        assert!(matches!(err, StoreError::MissingAttribute { .. }));
    }

    #[test]
    fn condition_matches_all_predicates() {
        let attrs = json!({"inUse": false, "revoked": false, "k": "v"});
        let attrs = attrs.as_object().unwrap();
        assert!(Condition::new().matches(attrs));
        assert!(Condition::new().eq("inUse", false).eq("revoked", false).matches(attrs));
        assert!(!Condition::new().eq("inUse", true).matches(attrs));
        assert!(!Condition::new().eq("missing", "x").matches(attrs));
    }

    #[test]
    fn index_description_covers_required_projection() {
        let spec = IndexSpec {
            name: "ByName",
            key: "name",
            projection: &["id", "owningGroup"],
        };
        let mut desc = IndexDescription {
            name: "ByName".into(),
            key: "name".into(),
            projection: vec!["id".into()],
            ready: true,
        };
        assert!(!desc.covers(&spec));
        desc.projection.push("owningGroup".into());
        assert!(desc.covers(&spec));
    }
}
