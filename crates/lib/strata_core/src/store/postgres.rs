//! PostgreSQL-backed record store.
//!
//! Each entity table has the layout
//!
//! ```sql
//! CREATE TABLE "<table>" (
//!     id       TEXT  NOT NULL,
//!     sort_key TEXT  NOT NULL,
//!     attrs    JSONB NOT NULL DEFAULT '{}'::jsonb,
//!     PRIMARY KEY (id, sort_key)
//! );
//! ```
//!
//! Attributes used by a secondary index (as key or projection) are mirrored
//! into stored generated columns named `a_<attr>`. A secondary index is a
//! btree on the key column with the projected columns in its `INCLUDE` list,
//! so the index's attribute projection can be read back from
//! `pg_get_indexdef` and compared with what the code currently requires.
//!
//! Table and attribute names only ever come from the static [`TableSpec`]s
//! registered at construction; anything else is rejected before SQL is
//! built.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use super::{
    Attributes, Condition, IndexDescription, IndexSpec, Item, ItemKey, Page, Query, RecordStore,
    StoreError, StoreResult, TableDescription, TableSpec,
};

/// Default number of rows fetched per page.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// A [`RecordStore`] over a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    tables: HashMap<&'static str, TableSpec>,
    page_size: usize,
}

type Row = (String, String, Value);

impl PgRecordStore {
    /// Wrap `pool`, allowing operations on the given tables only.
    pub fn new(pool: PgPool, tables: &[TableSpec]) -> Self {
        Self {
            pool,
            tables: tables.iter().map(|t| (t.name, *t)).collect(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn spec(&self, table: &str) -> StoreResult<&TableSpec> {
        self.tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    /// Add the generated column mirroring `attr`, if missing.
    async fn ensure_column(&self, table: &str, attr: &str) -> StoreResult<()> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} TEXT \
             GENERATED ALWAYS AS (attrs->>'{}') STORED",
            quote_ident(table),
            quote_ident(&column_name(attr)),
            attr.replace('\'', "''"),
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    fn page_size_limit(&self) -> i64 {
        (self.page_size + 1) as i64
    }

    fn rows_to_page(&self, table: &str, rows: Vec<Row>) -> StoreResult<Page> {
        let more = rows.len() > self.page_size;
        let items = rows
            .into_iter()
            .take(self.page_size)
            .map(|(id, sort_key, attrs)| row_to_item(table, &id, &sort_key, attrs))
            .collect::<StoreResult<Vec<_>>>()?;
        let next = if more {
            items.last().map(|i| i.key.clone())
        } else {
            None
        };
        Ok(Page { items, next })
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn describe_table(&self, table: &str) -> StoreResult<Option<TableDescription>> {
        self.spec(table)?;
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        if !exists {
            return Ok(None);
        }

        let rows = sqlx::query_as::<_, (String, bool, String)>(
            r#"
            SELECT c.relname::text,
                   (i.indisvalid AND i.indisready) AS ready,
                   pg_get_indexdef(i.indexrelid) AS def
            FROM pg_index i
            JOIN pg_class c ON c.oid = i.indexrelid
            JOIN pg_class t ON t.oid = i.indrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            WHERE t.relname = $1
              AND n.nspname = current_schema()
              AND NOT i.indisprimary
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let prefix = format!("{table}_");
        let indexes = rows
            .into_iter()
            .filter_map(|(relname, ready, def)| {
                let name = relname.strip_prefix(&prefix)?.to_string();
                let (key, projection) = parse_index_def(&def)?;
                Some(IndexDescription {
                    name,
                    key,
                    projection,
                    ready,
                })
            })
            .collect();

        Ok(Some(TableDescription {
            name: table.to_string(),
            ready: true,
            indexes,
        }))
    }

    async fn create_table(&self, spec: &TableSpec) -> StoreResult<()> {
        self.spec(spec.name)?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ( \
               id TEXT NOT NULL, \
               sort_key TEXT NOT NULL, \
               attrs JSONB NOT NULL DEFAULT '{{}}'::jsonb, \
               PRIMARY KEY (id, sort_key) \
             )",
            quote_ident(spec.name)
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        for index in spec.indexes {
            self.create_index(spec.name, index).await?;
        }
        Ok(())
    }

    async fn create_index(&self, table: &str, index: &IndexSpec) -> StoreResult<()> {
        self.spec(table)?;
        self.ensure_column(table, index.key).await?;
        for attr in index.projection {
            self.ensure_column(table, attr).await?;
        }
        let include = if index.projection.is_empty() {
            String::new()
        } else {
            let cols: Vec<String> = index
                .projection
                .iter()
                .map(|a| quote_ident(&column_name(a)))
                .collect();
            format!(" INCLUDE ({})", cols.join(", "))
        };
        // CONCURRENTLY keeps the table writable while the index builds;
        // readiness is observed through pg_index by the schema bootstrap.
        let sql = format!(
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS {} ON {} ({}){include}",
            quote_ident(&index_name(table, index.name)),
            quote_ident(table),
            quote_ident(&column_name(index.key)),
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn drop_index(&self, table: &str, index: &str) -> StoreResult<()> {
        self.spec(table)?;
        let sql = format!(
            "DROP INDEX CONCURRENTLY IF EXISTS {}",
            quote_ident(&index_name(table, index))
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn get_item(&self, table: &str, key: &ItemKey) -> StoreResult<Option<Item>> {
        self.spec(table)?;
        let sql = format!(
            "SELECT attrs FROM {} WHERE id = $1 AND sort_key = $2",
            quote_ident(table)
        );
        let attrs = sqlx::query_scalar::<_, Value>(&sql)
            .bind(&key.id)
            .bind(key.sort_key())
            .fetch_optional(&self.pool)
            .await?;
        attrs
            .map(|a| row_to_item(table, &key.id, &key.sort_key(), a))
            .transpose()
    }

    async fn put_item(&self, table: &str, item: &Item) -> StoreResult<()> {
        self.spec(table)?;
        let sql = format!(
            "INSERT INTO {} (id, sort_key, attrs) VALUES ($1, $2, $3) \
             ON CONFLICT (id, sort_key) DO UPDATE SET attrs = EXCLUDED.attrs",
            quote_ident(table)
        );
        sqlx::query(&sql)
            .bind(&item.key.id)
            .bind(item.key.sort_key())
            .bind(Value::Object(item.attrs.clone()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_item(
        &self,
        table: &str,
        key: &ItemKey,
        changes: &Attributes,
        condition: Option<&Condition>,
    ) -> StoreResult<bool> {
        self.spec(table)?;
        let sql = format!(
            "UPDATE {} SET attrs = attrs || $3 \
             WHERE id = $1 AND sort_key = $2 AND attrs @> $4",
            quote_ident(table)
        );
        let result = sqlx::query(&sql)
            .bind(&key.id)
            .bind(key.sort_key())
            .bind(Value::Object(changes.clone()))
            .bind(condition_json(condition))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_item(
        &self,
        table: &str,
        key: &ItemKey,
        condition: Option<&Condition>,
    ) -> StoreResult<bool> {
        self.spec(table)?;
        let sql = format!(
            "DELETE FROM {} WHERE id = $1 AND sort_key = $2 AND attrs @> $3",
            quote_ident(table)
        );
        let result = sqlx::query(&sql)
            .bind(&key.id)
            .bind(key.sort_key())
            .bind(condition_json(condition))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query_page(
        &self,
        table: &str,
        query: &Query<'_>,
        start_after: Option<&ItemKey>,
    ) -> StoreResult<Page> {
        let spec = self.spec(table)?;
        let (after_id, after_sort) = start_after
            .map(|k| (k.id.clone(), k.sort_key()))
            .unwrap_or_default();

        let rows = match *query {
            Query::Partition(id) => {
                let sql = format!(
                    "SELECT id, sort_key, attrs FROM {} \
                     WHERE id = $1 AND sort_key > $2 \
                     ORDER BY sort_key LIMIT $3",
                    quote_ident(table)
                );
                sqlx::query_as::<_, Row>(&sql)
                    .bind(id)
                    .bind(&after_sort)
                    .bind(self.page_size_limit())
                    .fetch_all(&self.pool)
                    .await?
            }
            Query::Index { index, value } => {
                let idx = spec.index(index).ok_or_else(|| {
                    StoreError::Unavailable(format!("index '{index}' not declared on '{table}'"))
                })?;
                let sql = format!(
                    "SELECT id, sort_key, attrs FROM {} \
                     WHERE {} = $1 AND (id, sort_key) > ($2, $3) \
                     ORDER BY id, sort_key LIMIT $4",
                    quote_ident(table),
                    quote_ident(&column_name(idx.key)),
                );
                sqlx::query_as::<_, Row>(&sql)
                    .bind(value)
                    .bind(&after_id)
                    .bind(&after_sort)
                    .bind(self.page_size_limit())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        self.rows_to_page(table, rows)
    }

    async fn scan_page(
        &self,
        table: &str,
        filter: Option<&Condition>,
        start_after: Option<&ItemKey>,
    ) -> StoreResult<Page> {
        self.spec(table)?;
        let (after_id, after_sort) = start_after
            .map(|k| (k.id.clone(), k.sort_key()))
            .unwrap_or_default();
        let sql = format!(
            "SELECT id, sort_key, attrs FROM {} \
             WHERE attrs @> $1 AND (id, sort_key) > ($2, $3) \
             ORDER BY id, sort_key LIMIT $4",
            quote_ident(table)
        );
        let rows = sqlx::query_as::<_, Row>(&sql)
            .bind(condition_json(filter))
            .bind(&after_id)
            .bind(&after_sort)
            .bind(self.page_size_limit())
            .fetch_all(&self.pool)
            .await?;
        self.rows_to_page(table, rows)
    }
}

// ---------------------------------------------------------------------------
// SQL helpers
// ---------------------------------------------------------------------------

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_name(attr: &str) -> String {
    format!("a_{attr}")
}

fn index_name(table: &str, index: &str) -> String {
    format!("{table}_{index}")
}

fn condition_json(condition: Option<&Condition>) -> Value {
    condition.map_or_else(|| Value::Object(Attributes::new()), Condition::to_json)
}

fn row_to_item(table: &str, id: &str, sort_key: &str, attrs: Value) -> StoreResult<Item> {
    let key = ItemKey::decode(id, sort_key)?;
    match attrs {
        Value::Object(map) => Ok(Item::new(key, map)),
        _ => Err(StoreError::Integrity(format!(
            "attributes of {key} in '{table}' are not an object"
        ))),
    }
}

/// Split a column list from `pg_get_indexdef` into attribute names.
fn parse_columns(list: &str) -> Vec<String> {
    list.split(',')
        .map(|c| c.trim().trim_matches('"'))
        .map(|c| c.strip_prefix("a_").unwrap_or(c).to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Extract `(key, projection)` from an index definition such as
/// `CREATE INDEX "users_ByName" ON public.users USING btree ("a_name") INCLUDE ("a_email")`.
fn parse_index_def(def: &str) -> Option<(String, Vec<String>)> {
    let after_using = &def[def.find(" USING ")?..];
    let open = after_using.find('(')?;
    let close = open + after_using[open..].find(')')?;
    let key = parse_columns(&after_using[open + 1..close])
        .into_iter()
        .next()?;

    let rest = &after_using[close + 1..];
    let projection = match rest.find("INCLUDE (") {
        Some(start) => {
            let body = &rest[start + "INCLUDE (".len()..];
            let end = body.find(')')?;
            parse_columns(&body[..end])
        }
        None => Vec::new(),
    };
    Some((key, projection))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_index_with_projection() {
        let def = r#"CREATE INDEX "clusters_ByOwner" ON public.clusters USING btree ("a_owningGroup") INCLUDE ("a_name", "a_owningOrganization")"#;
        let (key, projection) = parse_index_def(def).unwrap();
        assert_eq!(key, "owningGroup");
        assert_eq!(projection, vec!["name", "owningOrganization"]);
    }

    #[test]
    fn parses_index_without_projection() {
        let def = "CREATE INDEX users_ByToken ON public.users USING btree (a_token)";
        let (key, projection) = parse_index_def(def).unwrap();
        assert_eq!(key, "token");
        assert!(projection.is_empty());
    }

    #[test]
    fn rejects_unparseable_definition() {
        assert!(parse_index_def("garbage").is_none());
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(column_name("owningGroup"), "a_owningGroup");
        assert_eq!(index_name("clusters", "ByName"), "clusters_ByName");
    }

    #[test]
    fn missing_condition_is_empty_containment() {
        assert_eq!(condition_json(None), serde_json::json!({}));
        let c = Condition::new().eq("inUse", false);
        assert_eq!(condition_json(Some(&c)), serde_json::json!({"inUse": false}));
    }

    #[test]
    fn non_object_attributes_are_integrity_errors() {
        let err = row_to_item("t", "X_1", "X_1", Value::Null).unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }
}
