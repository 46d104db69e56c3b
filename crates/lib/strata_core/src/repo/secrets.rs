//! Tenant secrets. Payloads are encrypted before they reach the store.

use tracing::{error, info};

use super::entity::{Entity, IndexKey};
use super::placed::{self, Placed};
use super::{CatalogError, CatalogResult, RepositoryContext, require_fields, require_id};
use crate::ids::EntityKind;
use crate::models::Secret;
use crate::store::TableSpec;

pub(super) const TABLE: TableSpec = TableSpec {
    name: "secrets",
    indexes: placed::INDEXES,
};

impl Entity for Secret {
    const KIND: &'static str = "secret";

    fn table() -> &'static TableSpec {
        &TABLE
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> CatalogResult<()> {
        require_id(EntityKind::Secret, &self.id)?;
        require_fields(
            Self::KIND,
            &[
                ("name", &self.name),
                ("owning group", &self.owning_group),
                ("cluster", &self.cluster),
            ],
        )
    }

    fn category_keys(&self) -> Vec<IndexKey> {
        self.placement_keys()
    }
}

impl Placed for Secret {
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
    /// Encrypt `plaintext` and record it as a secret of `group` on `cluster`.
    pub async fn add_secret(
        &self,
        name: &str,
        group: &str,
        cluster: &str,
        plaintext: &[u8],
    ) -> CatalogResult<Secret> {
        let data = self
            .codec
            .encrypt(plaintext)
            .inspect_err(|e| error!(name, error = %e, "failed to encrypt secret"))?;
        let secret = Secret::new(name, group, cluster, data);
        secret.validate()?;
        self.groups.require(group).await?;
        self.clusters.require(cluster).await?;
        if self.find_secret_by_name(group, cluster, name).await?.is_some() {
            return Err(CatalogError::Conflict(format!(
                "group {group} already has a secret '{name}' on cluster {cluster}"
            )));
        }
        self.secrets.add(&secret).await?;
        info!(secret = %secret.id, name, group, cluster, "added secret");
        Ok(secret)
    }

    pub async fn get_secret(&self, id: &str) -> CatalogResult<Option<Secret>> {
        self.secrets.get(id).await
    }

    pub async fn find_secret_by_name(
        &self,
        group: &str,
        cluster: &str,
        name: &str,
    ) -> CatalogResult<Option<Secret>> {
        self.secrets.find_placed(cluster, Some(group), name).await
    }

    /// Update a secret. With `plaintext` the payload is encrypted afresh;
    /// without it the stored envelope is kept as given.
    pub async fn update_secret(
        &self,
        secret: &Secret,
        plaintext: Option<&[u8]>,
    ) -> CatalogResult<Secret> {
        let mut updated = secret.clone();
        if let Some(plaintext) = plaintext {
            updated.data = self
                .codec
                .encrypt(plaintext)
                .inspect_err(|e| error!(secret = %secret.id, error = %e, "failed to encrypt secret"))?;
        }
        self.secrets
            .update_placed(&updated, Some(&updated.owning_group))
            .await?;
        info!(secret = %updated.id, name = %updated.name, "updated secret");
        Ok(updated)
    }

    /// Decrypt a secret's payload.
    pub fn secret_plaintext(&self, secret: &Secret) -> CatalogResult<Vec<u8>> {
        self.codec
            .decrypt(&secret.data)
            .inspect_err(|e| error!(secret = %secret.id, error = %e, "failed to decrypt secret"))
            .map_err(CatalogError::from)
    }

    /// Remove the catalog record. The object on the cluster is not touched.
    pub async fn remove_secret(&self, id: &str) -> CatalogResult<Secret> {
        let secret = self.secrets.remove(id).await?;
        info!(secret = %id, name = %secret.name, "removed secret");
        Ok(secret)
    }

    pub async fn list_secrets(&self) -> CatalogResult<Vec<Secret>> {
        self.secrets.list_all().await
    }

    pub async fn list_secrets_by_cluster_or_group(
        &self,
        cluster: Option<&str>,
        group: Option<&str>,
    ) -> CatalogResult<Vec<Secret>> {
        self.secrets.list_placed(cluster, group).await
    }
}
