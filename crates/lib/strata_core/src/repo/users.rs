//! Users and group membership.
//!
//! Membership is an edge item `(user, user:group)` in the users table. The
//! edge's existence is the membership; there is no flag to go stale.

use serde_json::json;
use tracing::{error, info};

use super::entity::{Entity, IndexKey};
use super::{CatalogError, CatalogResult, RepositoryContext, require_fields, require_id};
use crate::ids::EntityKind;
use crate::models::User;
use crate::store::{IndexSpec, Item, ItemKey, KeySuffix, Query, TableSpec};

const BY_TOKEN: &str = "ByToken";
const BY_EXTERNAL_ID: &str = "ByExternalId";
pub(super) const BY_GROUP: &str = "ByGroup";

pub(super) const TABLE: TableSpec = TableSpec {
    name: "users",
    indexes: &[
        IndexSpec {
            name: BY_TOKEN,
            key: "token",
            projection: &["id", "name", "admin"],
        },
        IndexSpec {
            name: BY_EXTERNAL_ID,
            key: "externalId",
            projection: &["id", "name"],
        },
        IndexSpec {
            name: BY_GROUP,
            key: "groupID",
            projection: &["userID"],
        },
    ],
};

impl Entity for User {
    const KIND: &'static str = "user";

    fn table() -> &'static TableSpec {
        &TABLE
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> CatalogResult<()> {
        require_id(EntityKind::User, &self.id)?;
        require_fields(
            Self::KIND,
            &[
                ("name", &self.name),
                ("external id", &self.external_id),
                ("token", &self.token),
            ],
        )
    }

    fn unique_keys(&self) -> Vec<IndexKey> {
        vec![
            (BY_TOKEN, self.token.clone()),
            (BY_EXTERNAL_ID, self.external_id.clone()),
        ]
    }
}

impl RepositoryContext {
    /// Add a user. External ids and tokens must be unused.
    pub async fn add_user(&self, user: &User) -> CatalogResult<()> {
        user.validate()?;
        if self.find_user_by_external_id(&user.external_id).await?.is_some() {
            return Err(CatalogError::Conflict(format!(
                "external id {} is already registered",
                user.external_id
            )));
        }
        if self.find_user_by_token(&user.token).await?.is_some() {
            return Err(CatalogError::Conflict("token is already in use".into()));
        }
        self.users.add(user).await?;
        info!(user = %user.id, name = %user.name, "added user");
        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> CatalogResult<Option<User>> {
        self.users.get(id).await
    }

    pub async fn find_user_by_token(&self, token: &str) -> CatalogResult<Option<User>> {
        self.users.find_unique(BY_TOKEN, token).await
    }

    pub async fn find_user_by_external_id(&self, external_id: &str) -> CatalogResult<Option<User>> {
        self.users.find_unique(BY_EXTERNAL_ID, external_id).await
    }

    /// Update a user. The new external id and token must not belong to
    /// another user.
    pub async fn update_user(&self, user: &User) -> CatalogResult<()> {
        user.validate()?;
        if let Some(other) = self.find_user_by_external_id(&user.external_id).await?
            && other.id != user.id
        {
            return Err(CatalogError::Conflict(format!(
                "external id {} is already registered",
                user.external_id
            )));
        }
        if let Some(other) = self.find_user_by_token(&user.token).await?
            && other.id != user.id
        {
            return Err(CatalogError::Conflict("token is already in use".into()));
        }
        self.users.update(user).await
    }

    /// Remove a user together with all of its membership edges.
    pub async fn remove_user(&self, id: &str) -> CatalogResult<User> {
        let user = self.users.remove(id).await?;
        self.memberships.remove_category(&id.to_string());
        self.members.remove_everywhere(&id.to_string());
        info!(user = %id, "removed user");
        Ok(user)
    }

    pub async fn list_users(&self) -> CatalogResult<Vec<User>> {
        self.users.list_all().await
    }

    pub async fn add_user_to_group(&self, user_id: &str, group_id: &str) -> CatalogResult<()> {
        self.users.require(user_id).await?;
        self.groups.require(group_id).await?;

        let attrs = json!({"userID": user_id, "groupID": group_id});
        let item = Item::from_value(ItemKey::group_edge(user_id, group_id), &attrs)?;
        self.store
            .put_item(TABLE.name, &item)
            .await
            .inspect_err(|e| error!(user = user_id, group = group_id, error = %e, "failed to add membership"))?;

        self.memberships
            .insert(user_id.to_string(), group_id.to_string(), group_id.to_string());
        self.members
            .insert(group_id.to_string(), user_id.to_string(), user_id.to_string());
        info!(user = user_id, group = group_id, "added user to group");
        Ok(())
    }

    pub async fn remove_user_from_group(&self, user_id: &str, group_id: &str) -> CatalogResult<()> {
        let removed = self
            .store
            .delete_item(TABLE.name, &ItemKey::group_edge(user_id, group_id), None)
            .await
            .inspect_err(|e| error!(user = user_id, group = group_id, error = %e, "failed to remove membership"))?;
        self.memberships
            .remove(&user_id.to_string(), &group_id.to_string());
        self.members
            .remove(&group_id.to_string(), &user_id.to_string());
        if !removed {
            return Err(CatalogError::NotFound(format!(
                "user {user_id} is not a member of {group_id}"
            )));
        }
        info!(user = user_id, group = group_id, "removed user from group");
        Ok(())
    }

    /// Ids of the groups `user_id` belongs to, sorted.
    pub async fn user_groups(&self, user_id: &str) -> CatalogResult<Vec<String>> {
        if let Some(hit) = self.memberships.list(&user_id.to_string()) {
            self.stats.record_hit();
            return Ok(sorted(hit));
        }
        self.stats.record_miss();

        let items = self
            .store
            .query_all(TABLE.name, &Query::Partition(user_id))
            .await?;
        let groups: Vec<String> = items
            .into_iter()
            .filter_map(|i| match i.key.suffix {
                KeySuffix::Group(g) => Some(g),
                _ => None,
            })
            .collect();
        self.memberships.replace_all(
            user_id.to_string(),
            groups.iter().map(|g| (g.clone(), g.clone())),
        );
        Ok(sorted(groups))
    }

    /// Ids of the users in `group_id`, sorted.
    pub async fn group_members(&self, group_id: &str) -> CatalogResult<Vec<String>> {
        if let Some(hit) = self.members.list(&group_id.to_string()) {
            self.stats.record_hit();
            return Ok(sorted(hit));
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
        let users: Vec<String> = items
            .into_iter()
            .filter(|i| matches!(i.key.suffix, KeySuffix::Group(_)))
            .map(|i| i.key.id)
            .collect();
        self.members.replace_all(
            group_id.to_string(),
            users.iter().map(|u| (u.clone(), u.clone())),
        );
        Ok(sorted(users))
    }

    pub async fn user_in_group(&self, user_id: &str, group_id: &str) -> CatalogResult<bool> {
        Ok(self.user_groups(user_id).await?.iter().any(|g| g == group_id))
    }
}

pub(super) fn sorted(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v
}
