//! Shared shape of entities that a group places on a cluster.

use tracing::error;

use super::entity::{Entity, EntityRepository, IndexKey};
use super::{CatalogError, CatalogResult};
use crate::store::IndexSpec;

pub(super) const BY_GROUP: &str = "ByGroup";
pub(super) const BY_CLUSTER: &str = "ByCluster";

/// Indexes every placed kind declares.
pub(super) const INDEXES: &[IndexSpec] = &[
    IndexSpec {
        name: BY_GROUP,
        key: "owningGroup",
        projection: &["id", "name", "cluster"],
    },
    IndexSpec {
        name: BY_CLUSTER,
        key: "cluster",
        projection: &["id", "name", "owningGroup"],
    },
];

/// An entity owned by a group and living on one cluster.
pub(super) trait Placed: Entity {
    fn name(&self) -> &str;
    fn owning_group(&self) -> &str;
    fn cluster(&self) -> &str;

    fn placement_keys(&self) -> Vec<IndexKey> {
        vec![
            (BY_GROUP, self.owning_group().to_string()),
            (BY_CLUSTER, self.cluster().to_string()),
        ]
    }
}

impl<T: Placed> EntityRepository<T> {
    /// Entities on `cluster`, owned by `group`, or both. With neither, every
    /// entity of the kind.
    pub(super) async fn list_placed(
        &self,
        cluster: Option<&str>,
        group: Option<&str>,
    ) -> CatalogResult<Vec<T>> {
        match (cluster, group) {
            (Some(cluster), Some(group)) => Ok(self
                .list_by(BY_CLUSTER, cluster)
                .await?
                .into_iter()
                .filter(|e| e.owning_group() == group)
                .collect()),
            (Some(cluster), None) => self.list_by(BY_CLUSTER, cluster).await,
            (None, Some(group)) => self.list_by(BY_GROUP, group).await,
            (None, None) => self.list_all().await,
        }
    }

    /// Overwrite an entity in place. It keeps its group and cluster, and its
    /// new name must be free within `scope` (a group, or the whole cluster).
    pub(super) async fn update_placed(&self, entity: &T, scope: Option<&str>) -> CatalogResult<()> {
        entity.validate()?;
        let stored = self.require(entity.id()).await?;
        if stored.owning_group() != entity.owning_group() || stored.cluster() != entity.cluster() {
            return Err(CatalogError::Validation(format!(
                "{} {} cannot move to another group or cluster",
                T::KIND,
                entity.id()
            )));
        }
        if stored.name() != entity.name()
            && let Some(other) = self.find_placed(entity.cluster(), scope, entity.name()).await?
            && other.id() != entity.id()
        {
            return Err(CatalogError::Conflict(format!(
                "{} name '{}' is taken on cluster {}",
                T::KIND,
                entity.name(),
                entity.cluster()
            )));
        }
        self.update(entity).await
    }

    /// The entity called `name` on `cluster`, optionally restricted to one
    /// owning group.
    pub(super) async fn find_placed(
        &self,
        cluster: &str,
        group: Option<&str>,
        name: &str,
    ) -> CatalogResult<Option<T>> {
        let mut found = self
            .list_placed(Some(cluster), group)
            .await?
            .into_iter()
            .filter(|e| e.name() == name);
        let first = found.next();
        if found.next().is_some() {
            error!(kind = T::KIND, cluster, name, "several records share a name");
            return Err(CatalogError::Integrity(format!(
                "several {} records named '{name}' on cluster {cluster}",
                T::KIND
            )));
        }
        Ok(first)
    }
}
