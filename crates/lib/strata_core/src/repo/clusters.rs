//! Clusters, their locations, access grants and application allow-lists.
//!
//! Items in the clusters table:
//!
//! | Sort key                  | Content                                  |
//! |---------------------------|------------------------------------------|
//! | `id`                      | the [`Cluster`] record                   |
//! | `id:Locations`            | `{"locations": [GeoLocation...]}`        |
//! | `id:<group>`              | access grant for `<group>` (or `*`)      |
//! | `id:<group>:Applications` | `{"applications": [name...]}` (or `*`)   |

use std::collections::BTreeSet;

use serde_json::{Value, json};
use tracing::{error, info, warn};

use super::entity::{Entity, IndexKey};
use super::users::sorted;
use super::{
    CatalogError, CatalogResult, RepositoryContext, require_fields, require_id, require_name,
};
use crate::ids::EntityKind;
use crate::models::credential::NO_CREDENTIAL;
use crate::models::{Cluster, GeoLocation, MonitoringCredential, WILDCARD};
use crate::store::{Attributes, Condition, IndexSpec, Item, ItemKey, KeySuffix, Query, TableSpec};

const BY_NAME: &str = "ByName";
const BY_OWNER: &str = "ByOwner";
pub(super) const BY_GROUP: &str = "ByGroup";

/// Attribute holding the encoded monitoring credential.
pub(super) const CREDENTIAL_ATTR: &str = "monitoringCredential";

pub(super) const TABLE: TableSpec = TableSpec {
    name: "clusters",
    indexes: &[
        IndexSpec {
            name: BY_NAME,
            key: "name",
            projection: &["id", "owningGroup"],
        },
        IndexSpec {
            name: BY_OWNER,
            key: "owningGroup",
            projection: &["id", "name"],
        },
        IndexSpec {
            name: BY_GROUP,
            key: "groupID",
            projection: &["clusterID"],
        },
    ],
};

impl Entity for Cluster {
    const KIND: &'static str = "cluster";
    const MANAGED_ATTRS: &'static [&'static str] = &[CREDENTIAL_ATTR];

    fn table() -> &'static TableSpec {
        &TABLE
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> CatalogResult<()> {
        require_id(EntityKind::Cluster, &self.id)?;
        require_fields(
            Self::KIND,
            &[
                ("name", &self.name),
                ("owning group", &self.owning_group),
                ("config", &self.config),
                ("system namespace", &self.system_namespace),
            ],
        )?;
        require_name(EntityKind::Cluster, &self.name)
    }

    fn unique_keys(&self) -> Vec<IndexKey> {
        vec![(BY_NAME, self.name.clone())]
    }

    fn category_keys(&self) -> Vec<IndexKey> {
        vec![(BY_OWNER, self.owning_group.clone())]
    }

    fn keep_managed(&mut self, previous: &Self) {
        self.monitoring_credential = previous.monitoring_credential.clone();
    }
}

impl RepositoryContext {
    /// Add a cluster. Its credential is always stored unassigned.
    pub async fn add_cluster(&self, cluster: &Cluster) -> CatalogResult<()> {
        cluster.validate()?;
        self.groups.require(&cluster.owning_group).await?;
        if self.find_cluster_by_name(&cluster.name).await?.is_some() {
            return Err(CatalogError::Conflict(format!(
                "cluster name '{}' is taken",
                cluster.name
            )));
        }
        let fresh = Cluster {
            monitoring_credential: None,
            ..cluster.clone()
        };
        self.clusters.add(&fresh).await?;
        info!(cluster = %cluster.id, name = %cluster.name, "added cluster");
        Ok(())
    }

    pub async fn get_cluster(&self, id: &str) -> CatalogResult<Option<Cluster>> {
        self.clusters.get(id).await
    }

    pub async fn find_cluster_by_name(&self, name: &str) -> CatalogResult<Option<Cluster>> {
        self.clusters.find_unique(BY_NAME, name).await
    }

    /// Resolve a name typed by a person, falling back to an id.
    pub async fn cluster_by_id_or_name(&self, id_or_name: &str) -> CatalogResult<Option<Cluster>> {
        if let Some(cluster) = self.find_cluster_by_name(id_or_name).await? {
            return Ok(Some(cluster));
        }
        if EntityKind::Cluster.is_id(id_or_name) {
            return self.get_cluster(id_or_name).await;
        }
        Ok(None)
    }

    /// Update a cluster's attributes. The monitoring credential is not
    /// touched; use the dedicated operations.
    pub async fn update_cluster(&self, cluster: &Cluster) -> CatalogResult<()> {
        cluster.validate()?;
        if let Some(other) = self.find_cluster_by_name(&cluster.name).await?
            && other.id != cluster.id
        {
            return Err(CatalogError::Conflict(format!(
                "cluster name '{}' is taken",
                cluster.name
            )));
        }
        self.clusters.update(cluster).await
    }

    /// Remove the catalog record of a cluster with its locations, grants
    /// and allow-lists. The monitoring credential goes back to the pool.
    ///
    /// Nothing on the cluster itself is touched; see
    /// [`Self::delete_cluster`].
    pub async fn remove_cluster(&self, id: &str) -> CatalogResult<Cluster> {
        let cluster = self.clusters.require(id).await?;
        if let Some(cred) = self.remove_cluster_monitoring_credential(id).await? {
            self.release_monitoring_credential(&cred.access_key).await?;
        }
        let removed = self.clusters.remove(id).await?;

        self.locations.remove(&id.to_string());
        self.cluster_grants.remove_category(&id.to_string());
        self.group_grants.remove_everywhere(&id.to_string());
        self.applications.remove_where(|(c, _)| c == id);
        info!(cluster = %id, name = %cluster.name, "removed cluster record");
        Ok(removed)
    }

    pub async fn list_clusters(&self) -> CatalogResult<Vec<Cluster>> {
        self.clusters.list_all().await
    }

    pub async fn list_clusters_owned_by(&self, group_id: &str) -> CatalogResult<Vec<Cluster>> {
        self.clusters.list_by(BY_OWNER, group_id).await
    }

    pub async fn set_cluster_locations(
        &self,
        cluster_id: &str,
        locations: &[GeoLocation],
    ) -> CatalogResult<()> {
        self.clusters.require(cluster_id).await?;
        let attrs = json!({"clusterID": cluster_id, "locations": locations});
        let item = Item::from_value(ItemKey::locations(cluster_id), &attrs)?;
        self.store
            .put_item(TABLE.name, &item)
            .await
            .inspect_err(|e| error!(cluster = cluster_id, error = %e, "failed to store locations"))?;
        self.locations
            .upsert(cluster_id.to_string(), locations.to_vec());
        Ok(())
    }

    pub async fn cluster_locations(&self, cluster_id: &str) -> CatalogResult<Vec<GeoLocation>> {
        if let Some(hit) = self.locations.get(&cluster_id.to_string()) {
            self.stats.record_hit();
            return Ok(hit);
        }
        self.stats.record_miss();

        let locations = match self
            .store
            .get_item(TABLE.name, &ItemKey::locations(cluster_id))
            .await?
        {
            Some(item) => match item.attrs.get("locations") {
                Some(v) => serde_json::from_value(v.clone())?,
                None => Vec::new(),
            },
            None => Vec::new(),
        };
        self.locations
            .upsert(cluster_id.to_string(), locations.clone());
        Ok(locations)
    }

    /// Let `group_id` (or every group, with the wildcard) use the cluster.
    ///
    /// A new grant allows all applications until narrowed.
    pub async fn grant_group_access(&self, cluster_id: &str, group_id: &str) -> CatalogResult<()> {
        self.clusters.require(cluster_id).await?;
        if group_id != WILDCARD {
            self.groups.require(group_id).await?;
        }
        let attrs = json!({"clusterID": cluster_id, "groupID": group_id});
        let item = Item::from_value(ItemKey::group_edge(cluster_id, group_id), &attrs)?;
        self.store
            .put_item(TABLE.name, &item)
            .await
            .inspect_err(|e| error!(cluster = cluster_id, group = group_id, error = %e, "failed to grant access"))?;
        self.cluster_grants
            .insert(cluster_id.to_string(), group_id.to_string(), group_id.to_string());
        self.group_grants
            .insert(group_id.to_string(), cluster_id.to_string(), cluster_id.to_string());

        if group_id != WILDCARD && self.allowed_applications(cluster_id, group_id).await?.is_empty() {
            self.store_applications(cluster_id, group_id, vec![WILDCARD.to_string()])
                .await?;
        }
        info!(cluster = cluster_id, group = group_id, "granted cluster access");
        Ok(())
    }

    /// Withdraw a grant and its application allow-list.
    pub async fn revoke_group_access(&self, cluster_id: &str, group_id: &str) -> CatalogResult<()> {
        let removed = self
            .store
            .delete_item(TABLE.name, &ItemKey::group_edge(cluster_id, group_id), None)
            .await
            .inspect_err(|e| error!(cluster = cluster_id, group = group_id, error = %e, "failed to revoke access"))?;
        self.cluster_grants
            .remove(&cluster_id.to_string(), &group_id.to_string());
        self.group_grants
            .remove(&group_id.to_string(), &cluster_id.to_string());
        if !removed {
            return Err(CatalogError::NotFound(format!(
                "group {group_id} has no grant on cluster {cluster_id}"
            )));
        }
        self.store
            .delete_item(
                TABLE.name,
                &ItemKey::group_applications(cluster_id, group_id),
                None,
            )
            .await?;
        self.applications
            .remove(&(cluster_id.to_string(), group_id.to_string()));
        info!(cluster = cluster_id, group = group_id, "revoked cluster access");
        Ok(())
    }

    /// Groups with an explicit grant on the cluster, sorted. May contain the
    /// wildcard. The owning group is not listed.
    pub async fn groups_allowed_on_cluster(&self, cluster_id: &str) -> CatalogResult<Vec<String>> {
        if let Some(hit) = self.cluster_grants.list(&cluster_id.to_string()) {
            self.stats.record_hit();
            return Ok(sorted(hit));
        }
        self.stats.record_miss();

        let items = self
            .store
            .query_all(TABLE.name, &Query::Partition(cluster_id))
            .await?;
        let groups: Vec<String> = items
            .into_iter()
            .filter_map(|i| match i.key.suffix {
                KeySuffix::Group(g) => Some(g),
                _ => None,
            })
            .collect();
        self.cluster_grants.replace_all(
            cluster_id.to_string(),
            groups.iter().map(|g| (g.clone(), g.clone())),
        );
        Ok(sorted(groups))
    }

    /// Whether `group_id` may use the cluster: it owns it, every group is
    /// allowed, or it holds a grant.
    pub async fn group_allowed_on_cluster(
        &self,
        cluster_id: &str,
        group_id: &str,
    ) -> CatalogResult<bool> {
        let Some(cluster) = self.get_cluster(cluster_id).await? else {
            return Ok(false);
        };
        if cluster.owning_group == group_id {
            return Ok(true);
        }
        let grants = self.groups_allowed_on_cluster(cluster_id).await?;
        if grants.iter().any(|g| g == WILDCARD) {
            return Ok(true);
        }
        Ok(grants.iter().any(|g| g == group_id))
    }

    /// Clusters `group_id` may use, sorted: owned, granted directly, and
    /// open to every group.
    pub async fn clusters_accessible_to_group(&self, group_id: &str) -> CatalogResult<Vec<String>> {
        let mut ids: BTreeSet<String> = self
            .list_clusters_owned_by(group_id)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        ids.extend(self.clusters_granted_to(WILDCARD).await?);
        if group_id != WILDCARD {
            ids.extend(self.clusters_granted_to(group_id).await?);
        }
        Ok(ids.into_iter().collect())
    }

    async fn clusters_granted_to(&self, group_id: &str) -> CatalogResult<Vec<String>> {
        if let Some(hit) = self.group_grants.list(&group_id.to_string()) {
            self.stats.record_hit();
            return Ok(hit);
        }
        self.stats.record_miss();

        let items = self
            .store
            .query_all(
                TABLE.name,
                &Query::Index {
                    index: BY_GROUP,
                    value: group_id,
                },
            )
            .await?;
        let clusters: Vec<String> = items
            .into_iter()
            .filter(|i| matches!(i.key.suffix, KeySuffix::Group(_)))
            .map(|i| i.key.id)
            .collect();
        self.group_grants.replace_all(
            group_id.to_string(),
            clusters.iter().map(|c| (c.clone(), c.clone())),
        );
        Ok(clusters)
    }

    /// Add `application` (or the wildcard) to the group's allow-list.
    pub async fn allow_application(
        &self,
        cluster_id: &str,
        group_id: &str,
        application: &str,
    ) -> CatalogResult<()> {
        require_fields("application", &[("name", application)])?;
        if !self.group_allowed_on_cluster(cluster_id, group_id).await? {
            return Err(CatalogError::Conflict(format!(
                "group {group_id} has no access to cluster {cluster_id}"
            )));
        }
        let mut apps = self.allowed_applications(cluster_id, group_id).await?;
        if apps.iter().any(|a| a == application) {
            return Ok(());
        }
        apps.push(application.to_string());
        apps.sort();
        self.store_applications(cluster_id, group_id, apps).await
    }

    pub async fn disallow_application(
        &self,
        cluster_id: &str,
        group_id: &str,
        application: &str,
    ) -> CatalogResult<()> {
        let mut apps = self.allowed_applications(cluster_id, group_id).await?;
        let before = apps.len();
        apps.retain(|a| a != application);
        if apps.len() == before {
            return Err(CatalogError::NotFound(format!(
                "application {application} is not allowed for {group_id} on {cluster_id}"
            )));
        }
        if apps.is_empty() {
            self.store
                .delete_item(
                    TABLE.name,
                    &ItemKey::group_applications(cluster_id, group_id),
                    None,
                )
                .await?;
            self.applications
                .upsert((cluster_id.to_string(), group_id.to_string()), apps);
            return Ok(());
        }
        self.store_applications(cluster_id, group_id, apps).await
    }

    /// The group's allow-list on the cluster. May contain the wildcard.
    pub async fn allowed_applications(
        &self,
        cluster_id: &str,
        group_id: &str,
    ) -> CatalogResult<Vec<String>> {
        let key = (cluster_id.to_string(), group_id.to_string());
        if let Some(hit) = self.applications.get(&key) {
            self.stats.record_hit();
            return Ok(hit);
        }
        self.stats.record_miss();

        let apps: Vec<String> = match self
            .store
            .get_item(TABLE.name, &ItemKey::group_applications(cluster_id, group_id))
            .await?
        {
            Some(item) => match item.attrs.get("applications") {
                Some(v) => serde_json::from_value(v.clone())?,
                None => Vec::new(),
            },
            None => Vec::new(),
        };
        self.applications.upsert(key, apps.clone());
        Ok(apps)
    }

    /// Whether the group may install `application` on the cluster. The
    /// owning group may install anything.
    pub async fn group_may_use_application(
        &self,
        cluster_id: &str,
        group_id: &str,
        application: &str,
    ) -> CatalogResult<bool> {
        let Some(cluster) = self.get_cluster(cluster_id).await? else {
            return Ok(false);
        };
        if cluster.owning_group == group_id {
            return Ok(true);
        }
        if !self.group_allowed_on_cluster(cluster_id, group_id).await? {
            return Ok(false);
        }
        let apps = self.allowed_applications(cluster_id, group_id).await?;
        if apps.iter().any(|a| a == WILDCARD) {
            return Ok(true);
        }
        Ok(apps.iter().any(|a| a == application))
    }

    async fn store_applications(
        &self,
        cluster_id: &str,
        group_id: &str,
        apps: Vec<String>,
    ) -> CatalogResult<()> {
        let attrs = json!({"clusterID": cluster_id, "groupID": group_id, "applications": apps});
        let item = Item::from_value(ItemKey::group_applications(cluster_id, group_id), &attrs)?;
        self.store
            .put_item(TABLE.name, &item)
            .await
            .inspect_err(|e| error!(cluster = cluster_id, group = group_id, error = %e, "failed to store allow-list"))?;
        self.applications
            .upsert((cluster_id.to_string(), group_id.to_string()), apps);
        Ok(())
    }

    /// Assign `credential` to a cluster that has none.
    ///
    /// Returns `false`, changing nothing, when the cluster already holds a
    /// credential.
    pub async fn set_cluster_monitoring_credential(
        &self,
        cluster_id: &str,
        credential: &MonitoringCredential,
    ) -> CatalogResult<bool> {
        if credential.is_empty() {
            return Err(CatalogError::Validation("cannot assign an empty credential".into()));
        }
        let encoded = credential.encode()?;
        let mut changes = Attributes::new();
        changes.insert(CREDENTIAL_ATTR.into(), Value::String(encoded));
        let only_if_unset = Condition::new().eq(CREDENTIAL_ATTR, NO_CREDENTIAL);

        let set = self
            .store
            .update_item(TABLE.name, &ItemKey::primary(cluster_id), &changes, Some(&only_if_unset))
            .await
            .inspect_err(|e| error!(cluster = cluster_id, error = %e, "failed to set monitoring credential"))?;
        if !set {
            if self.clusters.get(cluster_id).await?.is_none() {
                return Err(CatalogError::NotFound(format!("cluster {cluster_id}")));
            }
            return Ok(false);
        }
        let assigned = credential.clone();
        self.clusters
            .modify_cached(cluster_id, |c| c.monitoring_credential = Some(assigned));
        info!(cluster = cluster_id, access_key = %credential.access_key, "assigned monitoring credential");
        Ok(true)
    }

    /// Clear the cluster's credential, returning the one it held.
    ///
    /// The credential itself stays in use; releasing it is up to the caller.
    pub async fn remove_cluster_monitoring_credential(
        &self,
        cluster_id: &str,
    ) -> CatalogResult<Option<MonitoringCredential>> {
        let item = self
            .store
            .get_item(TABLE.name, &ItemKey::primary(cluster_id))
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("cluster {cluster_id}")))?;
        let current = item.attr_str(CREDENTIAL_ATTR).unwrap_or(NO_CREDENTIAL).to_string();
        let credential = MonitoringCredential::decode(&current)?;
        if credential.is_empty() {
            return Ok(None);
        }

        let mut changes = Attributes::new();
        changes.insert(CREDENTIAL_ATTR.into(), Value::String(NO_CREDENTIAL.into()));
        let unchanged = Condition::new().eq(CREDENTIAL_ATTR, current);
        let cleared = self
            .store
            .update_item(TABLE.name, &item.key, &changes, Some(&unchanged))
            .await
            .inspect_err(|e| error!(cluster = cluster_id, error = %e, "failed to clear monitoring credential"))?;
        if !cleared {
            warn!(cluster = cluster_id, "monitoring credential changed concurrently");
            return Err(CatalogError::Conflict(format!(
                "monitoring credential of cluster {cluster_id} changed concurrently"
            )));
        }
        self.clusters
            .modify_cached(cluster_id, |c| c.monitoring_credential = None);
        info!(cluster = cluster_id, access_key = %credential.access_key, "cleared monitoring credential");
        Ok(Some(credential))
    }
}
