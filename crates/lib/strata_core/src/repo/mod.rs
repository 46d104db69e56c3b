//! Catalog repositories.
//!
//! [`RepositoryContext`] owns the store handle, the secret codec and every
//! cache. It is built once at startup and shared behind an `Arc`; the
//! per-kind operations live in the submodules as `impl RepositoryContext`
//! blocks.

mod clusters;
mod credentials;
pub mod entity;
mod groups;
mod instances;
mod placed;
mod secrets;
mod users;
mod volumes;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheStats, CacheStatsSnapshot, CategoryCache, ConcurrentCache};
use crate::client::ClientError;
use crate::codec::{CodecError, SecretCodec};
use crate::config::CatalogConfig;
use crate::ids::EntityKind;
use crate::models::{
    ApplicationInstance, Cluster, GeoLocation, Group, MonitoringCredential, PersistentVolumeClaim,
    Secret, User,
};
use crate::store::schema::{SchemaConfig, ensure_schema};
use crate::store::{RecordStore, StoreError, TableSpec};

pub use entity::{Entity, EntityRepository};

/// Every table the catalog uses.
pub const CATALOG_TABLES: &[TableSpec] = &[
    users::TABLE,
    groups::TABLE,
    clusters::TABLE,
    instances::TABLE,
    secrets::TABLE,
    volumes::TABLE,
    credentials::TABLE,
];

/// Errors raised by catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("No monitoring credentials available")]
    NoCredentialsAvailable,

    #[error("Data integrity violation: {0}")]
    Integrity(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Gave up after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Secret codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Cluster {cluster}: {source}")]
    Remote {
        cluster: String,
        #[source]
        source: ClientError,
    },
}

impl CatalogError {
    /// Whether the error reveals corrupted store state that no caller can
    /// recover from locally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Integrity(_) | Self::Store(StoreError::Integrity(_))
        )
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(e))
    }
}

/// Result type for catalog operations.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Settings the context consults at operation time.
#[derive(Debug, Clone)]
pub(crate) struct ContextSettings {
    pub allocation_deadline: Option<Duration>,
    pub tenant_namespace_prefix: String,
}

/// Store, codec and caches for the whole catalog.
pub struct RepositoryContext {
    store: Arc<dyn RecordStore>,
    codec: SecretCodec,
    settings: ContextSettings,
    stats: Arc<CacheStats>,
    users: EntityRepository<User>,
    groups: EntityRepository<Group>,
    clusters: EntityRepository<Cluster>,
    instances: EntityRepository<ApplicationInstance>,
    secrets: EntityRepository<Secret>,
    volumes: EntityRepository<PersistentVolumeClaim>,
    credentials: EntityRepository<MonitoringCredential>,
    /// user id -> group ids
    memberships: CategoryCache<String, String, String>,
    /// group id -> user ids
    members: CategoryCache<String, String, String>,
    /// cluster id -> granted group ids (may hold the wildcard)
    cluster_grants: CategoryCache<String, String, String>,
    /// group id (or the wildcard) -> cluster ids granted to it
    group_grants: CategoryCache<String, String, String>,
    /// (cluster id, group id) -> allowed applications
    applications: ConcurrentCache<(String, String), Vec<String>>,
    locations: ConcurrentCache<String, Vec<GeoLocation>>,
    instance_configs: ConcurrentCache<String, String>,
}

impl RepositoryContext {
    pub fn new(store: Arc<dyn RecordStore>, codec: SecretCodec, config: &CatalogConfig) -> Self {
        let stats = Arc::new(CacheStats::default());
        let ttls = config.cache;
        let listing = ttls.listing;
        let record = ttls.record;
        Self {
            users: EntityRepository::new(Arc::clone(&store), Arc::clone(&stats), ttls),
            groups: EntityRepository::new(Arc::clone(&store), Arc::clone(&stats), ttls),
            clusters: EntityRepository::new(Arc::clone(&store), Arc::clone(&stats), ttls),
            instances: EntityRepository::new(Arc::clone(&store), Arc::clone(&stats), ttls),
            secrets: EntityRepository::new(Arc::clone(&store), Arc::clone(&stats), ttls),
            volumes: EntityRepository::new(Arc::clone(&store), Arc::clone(&stats), ttls),
            credentials: EntityRepository::new(Arc::clone(&store), Arc::clone(&stats), ttls),
            memberships: CategoryCache::new(listing),
            members: CategoryCache::new(listing),
            cluster_grants: CategoryCache::new(listing),
            group_grants: CategoryCache::new(listing),
            applications: ConcurrentCache::new(record),
            locations: ConcurrentCache::new(record),
            instance_configs: ConcurrentCache::new(record),
            settings: ContextSettings {
                allocation_deadline: config.allocation_deadline,
                tenant_namespace_prefix: config.tenant_namespace_prefix.clone(),
            },
            codec,
            stats,
            store,
        }
    }

    /// Create or upgrade every catalog table and wait until all are ready.
    pub async fn ensure_schema(
        &self,
        config: &SchemaConfig,
        cancel: &CancellationToken,
    ) -> CatalogResult<()> {
        ensure_schema(self.store.as_ref(), CATALOG_TABLES, config, cancel).await?;
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn codec(&self) -> &SecretCodec {
        &self.codec
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Namespace holding `group_name`'s objects on member clusters.
    pub fn tenant_namespace(&self, group_name: &str) -> String {
        format!("{}{group_name}", self.settings.tenant_namespace_prefix)
    }

    /// Whether a remote namespace belongs to a tenant.
    pub fn is_tenant_namespace(&self, namespace: &str) -> bool {
        namespace.starts_with(&self.settings.tenant_namespace_prefix)
    }

    /// Forget every cached value. Only freshness is affected.
    pub fn clear_caches(&self) {
        self.users.clear();
        self.groups.clear();
        self.clusters.clear();
        self.instances.clear();
        self.secrets.clear();
        self.volumes.clear();
        self.credentials.clear();
        self.memberships.clear();
        self.members.clear();
        self.cluster_grants.clear();
        self.group_grants.clear();
        self.applications.clear();
        self.locations.clear();
        self.instance_configs.clear();
    }
}

/// Reject empty required fields.
pub(crate) fn require_fields(kind: &str, fields: &[(&str, &str)]) -> CatalogResult<()> {
    match fields.iter().find(|(_, value)| value.trim().is_empty()) {
        Some((name, _)) => Err(CatalogError::Validation(format!("{kind} {name} is empty"))),
        None => Ok(()),
    }
}

/// Reject ids that do not carry `kind`'s prefix.
pub(crate) fn require_id(kind: EntityKind, id: &str) -> CatalogResult<()> {
    if kind.is_id(id) {
        Ok(())
    } else {
        Err(CatalogError::Validation(format!(
            "'{id}' is not a {} id",
            kind.prefix().trim_end_matches('_')
        )))
    }
}

/// Reject names that could be mistaken for an id during name resolution.
pub(crate) fn require_name(kind: EntityKind, name: &str) -> CatalogResult<()> {
    if EntityKind::of(name).is_some() {
        return Err(CatalogError::Validation(format!(
            "{} name '{name}' looks like an id",
            kind.prefix().trim_end_matches('_')
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryRecordStore;

    /// A context over a fresh in-memory store with the schema in place.
    pub(crate) async fn context() -> (Arc<MemoryRecordStore>, RepositoryContext) {
        let store = Arc::new(MemoryRecordStore::new());
        let ctx = RepositoryContext::new(
            store.clone(),
            SecretCodec::from_passphrase("test"),
            &CatalogConfig::default(),
        );
        ctx.ensure_schema(&SchemaConfig::default(), &CancellationToken::new())
            .await
            .unwrap();
        (store, ctx)
    }

    #[test]
    fn integrity_errors_are_fatal() {
        assert!(CatalogError::Integrity("dup".into()).is_fatal());
        assert!(CatalogError::Store(StoreError::Integrity("bad row".into())).is_fatal());
        assert!(!CatalogError::NotFound("x".into()).is_fatal());
        assert!(!CatalogError::NoCredentialsAvailable.is_fatal());
    }

    #[test]
    fn field_validation() {
        assert!(require_fields("user", &[("name", "Ada"), ("token", "t")]).is_ok());
        let err = require_fields("user", &[("name", "Ada"), ("token", " ")]).unwrap_err();
        assert_eq!(err.to_string(), "Validation failed: user token is empty");
        assert!(require_id(EntityKind::Group, "Group_abc").is_ok());
        assert!(require_id(EntityKind::Group, "Cluster_abc").is_err());
        assert!(require_name(EntityKind::Group, "physics").is_ok());
        assert!(require_name(EntityKind::Group, "Group_abc").is_err());
    }

    #[tokio::test]
    async fn tenant_namespaces_use_prefix() {
        let (_, ctx) = context().await;
        assert_eq!(ctx.tenant_namespace("physics"), "tenant-physics");
        assert!(ctx.is_tenant_namespace("tenant-physics"));
        assert!(!ctx.is_tenant_namespace("kube-system"));
    }
}
