//! Application instances.
//!
//! The primary item holds the instance record; the chart values it was
//! installed with live in the `id:config` item so listings never drag the
//! blob along.

use serde_json::json;
use tracing::{error, info, warn};

use super::entity::{Entity, IndexKey};
use super::placed::{self, Placed};
use super::{CatalogError, CatalogResult, RepositoryContext, require_fields, require_id};
use crate::ids::EntityKind;
use crate::models::ApplicationInstance;
use crate::store::{Item, ItemKey, TableSpec};

const CONFIG_ATTR: &str = "config";

pub(super) const TABLE: TableSpec = TableSpec {
    name: "instances",
    indexes: placed::INDEXES,
};

impl Entity for ApplicationInstance {
    const KIND: &'static str = "instance";

    fn table() -> &'static TableSpec {
        &TABLE
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> CatalogResult<()> {
        require_id(EntityKind::Instance, &self.id)?;
        require_fields(
            Self::KIND,
            &[
                ("name", &self.name),
                ("application", &self.application),
                ("owning group", &self.owning_group),
                ("cluster", &self.cluster),
            ],
        )
    }

    fn category_keys(&self) -> Vec<IndexKey> {
        self.placement_keys()
    }
}

impl Placed for ApplicationInstance {
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
    /// Record an instance installed on a cluster. Release names are unique
    /// per cluster.
    pub async fn add_instance(
        &self,
        instance: &ApplicationInstance,
        config: &str,
    ) -> CatalogResult<()> {
        instance.validate()?;
        self.groups.require(&instance.owning_group).await?;
        self.clusters.require(&instance.cluster).await?;
        if self
            .find_instance_by_name(&instance.cluster, &instance.name)
            .await?
            .is_some()
        {
            return Err(CatalogError::Conflict(format!(
                "instance '{}' already exists on cluster {}",
                instance.name, instance.cluster
            )));
        }

        // config first: a primary item is never visible without its config
        self.put_instance_config(&instance.id, config).await?;
        if let Err(e) = self.instances.add(instance).await {
            let key = ItemKey::config(&instance.id);
            if let Err(cleanup) = self.store.delete_item(TABLE.name, &key, None).await {
                warn!(instance = %instance.id, error = %cleanup, "failed to drop orphaned config");
            }
            self.instance_configs.remove(&instance.id);
            return Err(e);
        }
        info!(
            instance = %instance.id,
            name = %instance.name,
            cluster = %instance.cluster,
            "added instance"
        );
        Ok(())
    }

    pub async fn get_instance(&self, id: &str) -> CatalogResult<Option<ApplicationInstance>> {
        self.instances.get(id).await
    }

    /// Update an instance record. Its configuration is kept apart; see
    /// [`Self::update_instance_config`].
    pub async fn update_instance(&self, instance: &ApplicationInstance) -> CatalogResult<()> {
        self.instances.update_placed(instance, None).await?;
        info!(instance = %instance.id, name = %instance.name, "updated instance");
        Ok(())
    }

    /// The configuration the instance was installed with.
    pub async fn instance_config(&self, id: &str) -> CatalogResult<String> {
        if let Some(hit) = self.instance_configs.get(&id.to_string()) {
            self.stats.record_hit();
            return Ok(hit);
        }
        self.stats.record_miss();

        let item = self
            .store
            .get_item(TABLE.name, &ItemKey::config(id))
            .await
            .inspect_err(|e| error!(instance = id, error = %e, "failed to fetch config"))?
            .ok_or_else(|| CatalogError::NotFound(format!("configuration of instance {id}")))?;
        let config = item.require_str(TABLE.name, CONFIG_ATTR)?.to_string();
        self.instance_configs.upsert(id.to_string(), config.clone());
        Ok(config)
    }

    /// Replace the stored configuration of an existing instance.
    pub async fn update_instance_config(&self, id: &str, config: &str) -> CatalogResult<()> {
        self.instances.require(id).await?;
        self.put_instance_config(id, config).await
    }

    async fn put_instance_config(&self, id: &str, config: &str) -> CatalogResult<()> {
        let item = Item::from_value(ItemKey::config(id), &json!({ CONFIG_ATTR: config }))?;
        self.store
            .put_item(TABLE.name, &item)
            .await
            .inspect_err(|e| error!(instance = id, error = %e, "failed to store config"))?;
        self.instance_configs.upsert(id.to_string(), config.to_string());
        Ok(())
    }

    /// Remove the instance record and its configuration. The release on the
    /// cluster is not touched.
    pub async fn remove_instance(&self, id: &str) -> CatalogResult<ApplicationInstance> {
        let instance = self.instances.remove(id).await?;
        self.instance_configs.remove(&id.to_string());
        info!(instance = %id, name = %instance.name, "removed instance");
        Ok(instance)
    }

    pub async fn list_instances(&self) -> CatalogResult<Vec<ApplicationInstance>> {
        self.instances.list_all().await
    }

    /// Instances on `cluster`, owned by `group`, or both.
    pub async fn list_instances_by_cluster_or_group(
        &self,
        cluster: Option<&str>,
        group: Option<&str>,
    ) -> CatalogResult<Vec<ApplicationInstance>> {
        self.instances.list_placed(cluster, group).await
    }

    /// The instance with release name `name` on `cluster`.
    pub async fn find_instance_by_name(
        &self,
        cluster: &str,
        name: &str,
    ) -> CatalogResult<Option<ApplicationInstance>> {
        self.instances.find_placed(cluster, None, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cluster, Group};
    use crate::repo::tests::context;

    async fn fixture(ctx: &RepositoryContext) -> (Group, Cluster) {
        let group = Group::new("physics");
        ctx.add_group(&group).await.unwrap();
        let cluster = Cluster::new("c1", &group.id, "kubeconfig", "strata-system");
        ctx.add_cluster(&cluster).await.unwrap();
        (group, cluster)
    }

    #[tokio::test]
    async fn config_is_stored_beside_the_record() {
        let (store, ctx) = context().await;
        let (group, cluster) = fixture(&ctx).await;
        let inst = ApplicationInstance::new("web", "nginx", &group.id, &cluster.id);
        ctx.add_instance(&inst, "replicas: 2").await.unwrap();
        assert_eq!(store.item_count("instances"), 2);

        ctx.clear_caches();
        assert_eq!(ctx.get_instance(&inst.id).await.unwrap(), Some(inst.clone()));
        assert_eq!(ctx.instance_config(&inst.id).await.unwrap(), "replicas: 2");

        ctx.update_instance_config(&inst.id, "replicas: 3").await.unwrap();
        ctx.clear_caches();
        assert_eq!(ctx.instance_config(&inst.id).await.unwrap(), "replicas: 3");
    }

    #[tokio::test]
    async fn release_names_are_unique_per_cluster() {
        let (_, ctx) = context().await;
        let (group, cluster) = fixture(&ctx).await;
        let inst = ApplicationInstance::new("web", "nginx", &group.id, &cluster.id);
        ctx.add_instance(&inst, "").await.unwrap();
        let twin = ApplicationInstance::new("web", "httpd", &group.id, &cluster.id);
        assert!(matches!(
            ctx.add_instance(&twin, "").await,
            Err(CatalogError::Conflict(_))
        ));
        assert_eq!(
            ctx.find_instance_by_name(&cluster.id, "web").await.unwrap(),
            Some(inst)
        );
        assert_eq!(ctx.find_instance_by_name(&cluster.id, "db").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_cluster_is_rejected() {
        let (_, ctx) = context().await;
        let group = Group::new("physics");
        ctx.add_group(&group).await.unwrap();
        let inst = ApplicationInstance::new("web", "nginx", &group.id, "Cluster_missing");
        assert!(matches!(
            ctx.add_instance(&inst, "").await,
            Err(CatalogError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn listings_by_cluster_and_group() {
        let (_, ctx) = context().await;
        let (group, cluster) = fixture(&ctx).await;
        let other = Group::new("chemistry");
        ctx.add_group(&other).await.unwrap();

        let a = ApplicationInstance::new("a", "nginx", &group.id, &cluster.id);
        let b = ApplicationInstance::new("b", "nginx", &other.id, &cluster.id);
        ctx.add_instance(&a, "").await.unwrap();
        ctx.add_instance(&b, "").await.unwrap();

        let on_cluster = ctx
            .list_instances_by_cluster_or_group(Some(&cluster.id), None)
            .await
            .unwrap();
        assert_eq!(on_cluster.len(), 2);
        let mine = ctx
            .list_instances_by_cluster_or_group(None, Some(&group.id))
            .await
            .unwrap();
        assert_eq!(mine, vec![a.clone()]);
        let both = ctx
            .list_instances_by_cluster_or_group(Some(&cluster.id), Some(&other.id))
            .await
            .unwrap();
        assert_eq!(both, vec![b]);

        ctx.remove_instance(&a.id).await.unwrap();
        let mine = ctx
            .list_instances_by_cluster_or_group(None, Some(&group.id))
            .await
            .unwrap();
        assert!(mine.is_empty());
        assert_eq!(ctx.list_instances().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn removal_drops_config() {
        let (store, ctx) = context().await;
        let (group, cluster) = fixture(&ctx).await;
        let inst = ApplicationInstance::new("web", "nginx", &group.id, &cluster.id);
        ctx.add_instance(&inst, "replicas: 2").await.unwrap();
        ctx.remove_instance(&inst.id).await.unwrap();
        assert_eq!(store.item_count("instances"), 0);
        assert!(matches!(
            ctx.instance_config(&inst.id).await,
            Err(CatalogError::NotFound(_))
        ));
        assert!(matches!(
            ctx.remove_instance(&inst.id).await,
            Err(CatalogError::NotFound(_))
        ));
    }
}
