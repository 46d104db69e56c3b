//! Groups (tenants).

use tracing::{error, info, warn};

use super::entity::{Entity, IndexKey};
use super::{
    CatalogError, CatalogResult, RepositoryContext, clusters, require_fields, require_id,
    require_name, users,
};
use crate::ids::EntityKind;
use crate::models::Group;
use crate::store::{IndexSpec, KeySuffix, Query, TableSpec};

const BY_NAME: &str = "ByName";

pub(super) const TABLE: TableSpec = TableSpec {
    name: "groups",
    indexes: &[IndexSpec {
        name: BY_NAME,
        key: "name",
        projection: &["id"],
    }],
};

impl Entity for Group {
    const KIND: &'static str = "group";

    fn table() -> &'static TableSpec {
        &TABLE
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> CatalogResult<()> {
        require_id(EntityKind::Group, &self.id)?;
        require_fields(Self::KIND, &[("name", &self.name)])?;
        require_name(EntityKind::Group, &self.name)
    }

    fn unique_keys(&self) -> Vec<IndexKey> {
        vec![(BY_NAME, self.name.clone())]
    }
}

impl RepositoryContext {
    pub async fn add_group(&self, group: &Group) -> CatalogResult<()> {
        group.validate()?;
        if self.find_group_by_name(&group.name).await?.is_some() {
            return Err(CatalogError::Conflict(format!(
                "group name '{}' is taken",
                group.name
            )));
        }
        self.groups.add(group).await?;
        info!(group = %group.id, name = %group.name, "added group");
        Ok(())
    }

    pub async fn get_group(&self, id: &str) -> CatalogResult<Option<Group>> {
        self.groups.get(id).await
    }

    pub async fn find_group_by_name(&self, name: &str) -> CatalogResult<Option<Group>> {
        self.groups.find_unique(BY_NAME, name).await
    }

    /// Resolve a name typed by a person, falling back to an id.
    pub async fn group_by_id_or_name(&self, id_or_name: &str) -> CatalogResult<Option<Group>> {
        if let Some(group) = self.find_group_by_name(id_or_name).await? {
            return Ok(Some(group));
        }
        if EntityKind::Group.is_id(id_or_name) {
            return self.get_group(id_or_name).await;
        }
        Ok(None)
    }

    pub async fn update_group(&self, group: &Group) -> CatalogResult<()> {
        group.validate()?;
        if let Some(other) = self.find_group_by_name(&group.name).await?
            && other.id != group.id
        {
            return Err(CatalogError::Conflict(format!(
                "group name '{}' is taken",
                group.name
            )));
        }
        self.groups.update(group).await
    }

    /// Remove a group, its memberships and every cluster access grant naming
    /// it. Refused while the group still owns clusters.
    pub async fn remove_group(&self, id: &str) -> CatalogResult<Group> {
        let owned = self.list_clusters_owned_by(id).await?;
        if !owned.is_empty() {
            return Err(CatalogError::Conflict(format!(
                "group {id} still owns {} cluster(s)",
                owned.len()
            )));
        }

        let by_group = Query::Index {
            index: users::BY_GROUP,
            value: id,
        };
        for edge in self.store.query_all(users::TABLE.name, &by_group).await? {
            if matches!(edge.key.suffix, KeySuffix::Group(_)) {
                self.store
                    .delete_item(users::TABLE.name, &edge.key, None)
                    .await
                    .inspect_err(|e| error!(group = id, error = %e, "failed to delete membership"))?;
                self.memberships.remove(&edge.key.id, &id.to_string());
            }
        }

        let by_group = Query::Index {
            index: clusters::BY_GROUP,
            value: id,
        };
        for edge in self.store.query_all(clusters::TABLE.name, &by_group).await? {
            if edge.key.is_primary() {
                warn!(group = id, key = %edge.key, "ignoring primary item in grant index");
                continue;
            }
            self.store
                .delete_item(clusters::TABLE.name, &edge.key, None)
                .await
                .inspect_err(|e| error!(group = id, error = %e, "failed to delete cluster grant"))?;
            self.cluster_grants.remove(&edge.key.id, &id.to_string());
            self.applications
                .remove(&(edge.key.id.clone(), id.to_string()));
        }
        self.members.remove_category(&id.to_string());
        self.group_grants.remove_category(&id.to_string());

        let group = self.groups.remove(id).await?;
        info!(group = %id, name = %group.name, "removed group");
        Ok(group)
    }

    pub async fn list_groups(&self) -> CatalogResult<Vec<Group>> {
        self.groups.list_all().await
    }
}
