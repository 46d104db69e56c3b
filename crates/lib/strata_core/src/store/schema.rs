//! Idempotent schema bootstrap.
//!
//! Safe to run on every start: missing tables are created with all their
//! indexes, missing indexes are added, and an index whose projection lacks
//! an attribute the code now requires is dropped and rebuilt. The call then
//! polls until every table and index reports ready, bounded by
//! [`SchemaConfig::max_wait`] and a cancellation token.

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RecordStore, StoreError, StoreResult, TableSpec};

/// Default interval between readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default bound on waiting for one table to become ready.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(600);

/// Polling behaviour of the schema bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

/// Bring every table in `tables` to its declared shape and wait for it.
pub async fn ensure_schema(
    store: &dyn RecordStore,
    tables: &[TableSpec],
    config: &SchemaConfig,
    cancel: &CancellationToken,
) -> StoreResult<()> {
    for spec in tables {
        ensure_table(store, spec, config, cancel).await?;
    }
    info!(tables = tables.len(), "schema ready");
    Ok(())
}

async fn ensure_table(
    store: &dyn RecordStore,
    spec: &TableSpec,
    config: &SchemaConfig,
    cancel: &CancellationToken,
) -> StoreResult<()> {
    match store.describe_table(spec.name).await? {
        None => {
            info!(table = spec.name, "creating table");
            store.create_table(spec).await?;
        }
        Some(desc) => {
            for index in spec.indexes {
                match desc.index(index.name) {
                    Some(existing) if existing.covers(index) => {
                        debug!(table = spec.name, index = index.name, "index up to date");
                    }
                    Some(existing) => {
                        warn!(
                            table = spec.name,
                            index = index.name,
                            have = ?existing.projection,
                            want = ?index.projection,
                            "index projection incomplete, rebuilding"
                        );
                        store.drop_index(spec.name, index.name).await?;
                        store.create_index(spec.name, index).await?;
                    }
                    None => {
                        info!(table = spec.name, index = index.name, "adding missing index");
                        store.create_index(spec.name, index).await?;
                    }
                }
            }
        }
    }
    wait_until_ready(store, spec, config, cancel).await
}

async fn wait_until_ready(
    store: &dyn RecordStore,
    spec: &TableSpec,
    config: &SchemaConfig,
    cancel: &CancellationToken,
) -> StoreResult<()> {
    let deadline = Instant::now() + config.max_wait;
    loop {
        let desc = store
            .describe_table(spec.name)
            .await?
            .ok_or_else(|| StoreError::UnknownTable(spec.name.to_string()))?;

        let ready = desc.ready
            && spec
                .indexes
                .iter()
                .all(|want| desc.index(want.name).is_some_and(|have| have.ready));
        if ready {
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(StoreError::NotReady(spec.name.to_string(), config.max_wait));
        }
        debug!(table = spec.name, "waiting for table and indexes to become ready");

        tokio::select! {
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            _ = sleep(config.poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IndexDescription, IndexSpec, MemoryRecordStore};

    const WIDGETS: TableSpec = TableSpec {
        name: "widgets",
        indexes: &[
            IndexSpec {
                name: "ByName",
                key: "name",
                projection: &["owner"],
            },
            IndexSpec {
                name: "ByOwner",
                key: "owner",
                projection: &[],
            },
        ],
    };

    fn fast() -> SchemaConfig {
        SchemaConfig {
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn creates_missing_table_with_indexes() {
        let store = MemoryRecordStore::new();
        ensure_schema(&store, &[WIDGETS], &fast(), &CancellationToken::new())
            .await
            .unwrap();
        let desc = store.describe_table("widgets").await.unwrap().unwrap();
        assert!(desc.index("ByName").is_some());
        assert!(desc.index("ByOwner").is_some());
    }

    #[tokio::test]
    async fn second_run_changes_nothing() {
        let store = MemoryRecordStore::new();
        let cancel = CancellationToken::new();
        ensure_schema(&store, &[WIDGETS], &fast(), &cancel).await.unwrap();
        let before = store.describe_table("widgets").await.unwrap();
        ensure_schema(&store, &[WIDGETS], &fast(), &cancel).await.unwrap();
        assert_eq!(store.describe_table("widgets").await.unwrap(), before);
    }

    #[tokio::test]
    async fn rebuilds_index_with_incomplete_projection() {
        let store = MemoryRecordStore::new();
        store.seed_index(
            "widgets",
            IndexDescription {
                name: "ByName".into(),
                key: "name".into(),
                projection: vec![],
                ready: true,
            },
        );
        ensure_schema(&store, &[WIDGETS], &fast(), &CancellationToken::new())
            .await
            .unwrap();
        let desc = store.describe_table("widgets").await.unwrap().unwrap();
        assert_eq!(desc.index("ByName").unwrap().projection, vec!["owner"]);
        assert!(desc.index("ByOwner").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_index_build() {
        let mut store = MemoryRecordStore::new();
        store.set_index_build_polls(3);
        ensure_schema(&store, &[WIDGETS], &fast(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(store.describe_table("widgets").await.unwrap().unwrap().all_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_wait() {
        let mut store = MemoryRecordStore::new();
        store.set_index_build_polls(u32::MAX);
        let err = ensure_schema(&store, &[WIDGETS], &fast(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotReady(ref t, _) if t == "widgets"));
    }

    #[tokio::test(start_paused = true)]
    async fn honours_cancellation() {
        let mut store = MemoryRecordStore::new();
        store.set_index_build_polls(u32::MAX);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = SchemaConfig {
            poll_interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(3600),
        };
        let err = ensure_schema(&store, &[WIDGETS], &config, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }
}
