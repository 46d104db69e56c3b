//! Persistent volume claims.

use tracing::info;

use super::entity::{Entity, IndexKey};
use super::placed::{self, Placed};
use super::{CatalogError, CatalogResult, RepositoryContext, require_fields, require_id};
use crate::ids::EntityKind;
use crate::models::PersistentVolumeClaim;
use crate::store::TableSpec;

pub(super) const TABLE: TableSpec = TableSpec {
    name: "volumes",
    indexes: placed::INDEXES,
};

impl Entity for PersistentVolumeClaim {
    const KIND: &'static str = "volume";

    fn table() -> &'static TableSpec {
        &TABLE
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> CatalogResult<()> {
        require_id(EntityKind::Volume, &self.id)?;
        require_fields(
            Self::KIND,
            &[
                ("name", &self.name),
                ("owning group", &self.owning_group),
                ("cluster", &self.cluster),
                ("storage request", &self.storage_request),
            ],
        )
    }

    fn category_keys(&self) -> Vec<IndexKey> {
        self.placement_keys()
    }
}

impl Placed for PersistentVolumeClaim {
    fn name(&self) -> &str {
        &self.name
    }

    fn owning_group(&self) -> &str {
        &self.owning_group
    }

    fn cluster(&self) -> &str {
        &self.cluster
    }
}

impl RepositoryContext {
    /// Record a claim. Names are unique per group and cluster, as they are
    /// within the group's namespace.
    pub async fn add_volume(&self, volume: &PersistentVolumeClaim) -> CatalogResult<()> {
        volume.validate()?;
        self.groups.require(&volume.owning_group).await?;
        self.clusters.require(&volume.cluster).await?;
        if self
            .find_volume_by_name(&volume.owning_group, &volume.cluster, &volume.name)
            .await?
            .is_some()
        {
            return Err(CatalogError::Conflict(format!(
                "group {} already has a volume '{}' on cluster {}",
                volume.owning_group, volume.name, volume.cluster
            )));
        }
        self.volumes.add(volume).await?;
        info!(volume = %volume.id, name = %volume.name, cluster = %volume.cluster, "added volume");
        Ok(())
    }

    pub async fn get_volume(&self, id: &str) -> CatalogResult<Option<PersistentVolumeClaim>> {
        self.volumes.get(id).await
    }

    pub async fn find_volume_by_name(
        &self,
        group: &str,
        cluster: &str,
        name: &str,
    ) -> CatalogResult<Option<PersistentVolumeClaim>> {
        self.volumes.find_placed(cluster, Some(group), name).await
    }

    /// Update a claim's attributes. It stays with its group and cluster.
    pub async fn update_volume(&self, volume: &PersistentVolumeClaim) -> CatalogResult<()> {
        self.volumes
            .update_placed(volume, Some(&volume.owning_group))
            .await?;
        info!(volume = %volume.id, name = %volume.name, "updated volume");
        Ok(())
    }

    pub async fn remove_volume(&self, id: &str) -> CatalogResult<PersistentVolumeClaim> {
        let volume = self.volumes.remove(id).await?;
        info!(volume = %id, name = %volume.name, "removed volume");
        Ok(volume)
    }

    pub async fn list_volumes(&self) -> CatalogResult<Vec<PersistentVolumeClaim>> {
        self.volumes.list_all().await
    }

    pub async fn list_volumes_by_cluster_or_group(
        &self,
        cluster: Option<&str>,
        group: Option<&str>,
    ) -> CatalogResult<Vec<PersistentVolumeClaim>> {
        self.volumes.list_placed(cluster, group).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccessMode, Cluster, Group};
    use crate::repo::tests::context;

    #[tokio::test]
    async fn add_find_remove() {
        let (_, ctx) = context().await;
        let group = Group::new("physics");
        ctx.add_group(&group).await.unwrap();
        let cluster = Cluster::new("c1", &group.id, "kubeconfig", "strata-system");
        ctx.add_cluster(&cluster).await.unwrap();

        let mut volume = PersistentVolumeClaim::new("scratch", &group.id, &cluster.id, "10Gi");
        volume.access_mode = AccessMode::ReadWriteMany;
        ctx.add_volume(&volume).await.unwrap();
        assert!(matches!(
            ctx.add_volume(&PersistentVolumeClaim::new("scratch", &group.id, &cluster.id, "1Gi"))
                .await,
            Err(CatalogError::Conflict(_))
        ));

        ctx.clear_caches();
        assert_eq!(
            ctx.find_volume_by_name(&group.id, &cluster.id, "scratch")
                .await
                .unwrap(),
            Some(volume.clone())
        );
        assert_eq!(
            ctx.list_volumes_by_cluster_or_group(None, Some(&group.id))
                .await
                .unwrap(),
            vec![volume.clone()]
        );

        ctx.remove_volume(&volume.id).await.unwrap();
        assert_eq!(ctx.get_volume(&volume.id).await.unwrap(), None);
        assert!(
            ctx.list_volumes_by_cluster_or_group(Some(&cluster.id), None)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn storage_request_is_required() {
        let (_, ctx) = context().await;
        let volume = PersistentVolumeClaim::new("scratch", "Group_x", "Cluster_x", "");
        assert!(matches!(
            ctx.add_volume(&volume).await,
            Err(CatalogError::Validation(_))
        ));
    }
}
