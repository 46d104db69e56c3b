//! Monitoring credential pool and allocator.
//!
//! State changes are conditional writes against the credential's own item,
//! so two allocators can never receive the same credential:
//!
//! | Transition            | Guard                              |
//! |-----------------------|------------------------------------|
//! | Available -> InUse    | `inUse == false && revoked == false` |
//! | InUse -> Available    | `inUse == true && revoked == false`  |
//! | any -> Revoked        | none                               |
//! | delete                | `inUse == false`                   |

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clusters::{self, CREDENTIAL_ATTR};
use super::entity::Entity;
use super::{CatalogError, CatalogResult, RepositoryContext, require_fields};
use crate::models::MonitoringCredential;
use crate::store::{Attributes, Condition, ItemKey, TableSpec};

pub(super) const TABLE: TableSpec = TableSpec {
    name: "monitoring_credentials",
    indexes: &[],
};

impl Entity for MonitoringCredential {
    const KIND: &'static str = "monitoring credential";

    fn table() -> &'static TableSpec {
        &TABLE
    }

    fn id(&self) -> &str {
        &self.access_key
    }

    fn validate(&self) -> CatalogResult<()> {
        require_fields(
            Self::KIND,
            &[("access key", &self.access_key), ("secret key", &self.secret_key)],
        )
    }
}

fn available() -> Condition {
    Condition::new().eq("inUse", false).eq("revoked", false)
}

fn flags(pairs: &[(&str, bool)]) -> Attributes {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::Bool(*v)))
        .collect()
}

impl RepositoryContext {
    /// Add a fresh credential to the pool.
    pub async fn add_monitoring_credential(
        &self,
        credential: &MonitoringCredential,
    ) -> CatalogResult<()> {
        credential.validate()?;
        let existing = self
            .store
            .get_item(TABLE.name, &ItemKey::primary(&credential.access_key))
            .await?;
        if existing.is_some() {
            return Err(CatalogError::Conflict(format!(
                "credential {} already exists",
                credential.access_key
            )));
        }
        let fresh = MonitoringCredential::new(&credential.access_key, &credential.secret_key);
        self.credentials.add(&fresh).await?;
        info!(access_key = %fresh.access_key, "added monitoring credential to pool");
        Ok(())
    }

    pub async fn get_monitoring_credential(
        &self,
        access_key: &str,
    ) -> CatalogResult<Option<MonitoringCredential>> {
        self.credentials.get(access_key).await
    }

    pub async fn list_monitoring_credentials(&self) -> CatalogResult<Vec<MonitoringCredential>> {
        self.credentials.list_all().await
    }

    /// Take one available credential out of the pool.
    ///
    /// Fails at once with [`CatalogError::NoCredentialsAvailable`] when the
    /// pool is exhausted. When every candidate is lost to a concurrent
    /// allocator the pool is scanned again, until `cancel` fires or the
    /// configured allocation deadline passes.
    pub async fn allocate_monitoring_credential(
        &self,
        cancel: &CancellationToken,
    ) -> CatalogResult<MonitoringCredential> {
        let deadline = self
            .settings
            .allocation_deadline
            .map(|d| (Instant::now() + d, d));
        let guard = available();
        let claim = flags(&[("inUse", true)]);
        let mut rounds = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(CatalogError::Cancelled);
            }
            if let Some((at, limit)) = deadline
                && Instant::now() >= at
            {
                warn!(rounds, "monitoring credential allocation timed out");
                return Err(CatalogError::DeadlineExceeded(limit));
            }

            let candidates = self
                .store
                .scan_all(TABLE.name, Some(&guard))
                .await
                .inspect_err(|e| error!(error = %e, "failed to scan credential pool"))?;
            if candidates.is_empty() {
                warn!("monitoring credential pool exhausted");
                return Err(CatalogError::NoCredentialsAvailable);
            }

            for item in candidates {
                let won = self
                    .store
                    .update_item(TABLE.name, &item.key, &claim, Some(&guard))
                    .await
                    .inspect_err(|e| error!(key = %item.key, error = %e, "failed to claim credential"))?;
                if won {
                    let mut credential: MonitoringCredential = item.to_value()?;
                    credential.in_use = true;
                    self.credentials.cache_insert(&credential);
                    info!(access_key = %credential.access_key, "allocated monitoring credential");
                    return Ok(credential);
                }
                debug!(key = %item.key, "credential claimed concurrently, trying next");
            }

            rounds += 1;
            debug!(rounds, "all candidates taken, rescanning pool");
            tokio::select! {
                _ = cancel.cancelled() => return Err(CatalogError::Cancelled),
                _ = tokio::task::yield_now() => {}
            }
        }
    }

    /// Allocate a credential and assign it to a cluster that has none.
    ///
    /// Returns the cluster's credential, whether newly assigned or already
    /// present.
    pub async fn assign_monitoring_credential(
        &self,
        cluster_id: &str,
        cancel: &CancellationToken,
    ) -> CatalogResult<MonitoringCredential> {
        let cluster = self.clusters.require(cluster_id).await?;
        if let Some(existing) = cluster.monitoring_credential {
            return Ok(existing);
        }
        let credential = self.allocate_monitoring_credential(cancel).await?;
        if self
            .set_cluster_monitoring_credential(cluster_id, &credential)
            .await?
        {
            return Ok(credential);
        }

        // another caller assigned one first
        self.release_monitoring_credential(&credential.access_key)
            .await?;
        self.clusters
            .refresh(cluster_id)
            .await?
            .and_then(|c| c.monitoring_credential)
            .ok_or_else(|| {
                CatalogError::Conflict(format!(
                    "monitoring credential of cluster {cluster_id} changed concurrently"
                ))
            })
    }

    /// Return an in-use credential to the pool. Revoked credentials stay
    /// revoked. Returns whether the credential changed.
    pub async fn release_monitoring_credential(&self, access_key: &str) -> CatalogResult<bool> {
        let in_use = Condition::new().eq("inUse", true).eq("revoked", false);
        let released = self
            .store
            .update_item(
                TABLE.name,
                &ItemKey::primary(access_key),
                &flags(&[("inUse", false)]),
                Some(&in_use),
            )
            .await
            .inspect_err(|e| error!(access_key, error = %e, "failed to release credential"))?;
        if released {
            self.credentials
                .modify_cached(access_key, |c| c.in_use = false);
            info!(access_key, "released monitoring credential");
        }
        Ok(released)
    }

    /// Revoke a credential whatever its state, and detach it from the
    /// cluster holding it.
    pub async fn revoke_monitoring_credential(&self, access_key: &str) -> CatalogResult<()> {
        let revoked = self
            .store
            .update_item(
                TABLE.name,
                &ItemKey::primary(access_key),
                &flags(&[("revoked", true), ("inUse", false)]),
                None,
            )
            .await
            .inspect_err(|e| error!(access_key, error = %e, "failed to revoke credential"))?;
        if !revoked {
            return Err(CatalogError::NotFound(format!("credential {access_key}")));
        }
        self.credentials.modify_cached(access_key, |c| {
            c.revoked = true;
            c.in_use = false;
        });
        info!(access_key, "revoked monitoring credential");

        for (cluster_id, _) in self.clusters_holding(access_key).await? {
            match self.remove_cluster_monitoring_credential(&cluster_id).await {
                Ok(_) => info!(cluster = %cluster_id, access_key, "detached revoked credential"),
                Err(e) => {
                    error!(cluster = %cluster_id, access_key, error = %e, "failed to detach revoked credential");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Replace the secret key of a credential. Its pool state is kept, and
    /// the copy held by a cluster is rewritten.
    pub async fn update_monitoring_credential(
        &self,
        access_key: &str,
        secret_key: &str,
    ) -> CatalogResult<()> {
        MonitoringCredential::new(access_key, secret_key).validate()?;
        let mut changes = Attributes::new();
        changes.insert("secretKey".into(), Value::String(secret_key.into()));
        let updated = self
            .store
            .update_item(TABLE.name, &ItemKey::primary(access_key), &changes, None)
            .await
            .inspect_err(|e| error!(access_key, error = %e, "failed to update credential"))?;
        if !updated {
            return Err(CatalogError::NotFound(format!("credential {access_key}")));
        }
        let fresh = secret_key.to_string();
        self.credentials
            .modify_cached(access_key, |c| c.secret_key = fresh);
        info!(access_key, "updated monitoring credential");

        for (cluster_id, encoded) in self.clusters_holding(access_key).await? {
            let mut held = MonitoringCredential::decode(&encoded)?;
            held.secret_key = secret_key.to_string();
            let mut changes = Attributes::new();
            changes.insert(CREDENTIAL_ATTR.into(), Value::String(held.encode()?));
            let unchanged = Condition::new().eq(CREDENTIAL_ATTR, encoded);
            let rewritten = self
                .store
                .update_item(
                    clusters::TABLE.name,
                    &ItemKey::primary(&cluster_id),
                    &changes,
                    Some(&unchanged),
                )
                .await
                .inspect_err(|e| {
                    error!(cluster = %cluster_id, access_key, error = %e, "failed to rewrite cluster credential")
                })?;
            if rewritten {
                self.clusters
                    .modify_cached(&cluster_id, |c| c.monitoring_credential = Some(held));
            } else {
                warn!(
                    cluster = %cluster_id,
                    access_key,
                    "cluster credential changed concurrently, left as is"
                );
            }
        }
        Ok(())
    }

    /// Delete a credential that is not in use.
    pub async fn delete_monitoring_credential(&self, access_key: &str) -> CatalogResult<()> {
        let not_in_use = Condition::new().eq("inUse", false);
        let key = ItemKey::primary(access_key);
        let deleted = self
            .store
            .delete_item(TABLE.name, &key, Some(&not_in_use))
            .await
            .inspect_err(|e| error!(access_key, error = %e, "failed to delete credential"))?;
        if !deleted {
            return match self.store.get_item(TABLE.name, &key).await? {
                Some(_) => Err(CatalogError::Conflict(format!(
                    "credential {access_key} is in use"
                ))),
                None => Err(CatalogError::NotFound(format!("credential {access_key}"))),
            };
        }
        self.credentials.evict(access_key, None);
        info!(access_key, "deleted monitoring credential");
        Ok(())
    }

    /// Ids of the clusters whose stored credential has `access_key`, with
    /// the stored encoding. Read from the store rather than the cache.
    async fn clusters_holding(&self, access_key: &str) -> CatalogResult<Vec<(String, String)>> {
        let items = self.store.scan_all(clusters::TABLE.name, None).await?;
        let mut holding = Vec::new();
        for item in items.into_iter().filter(|i| i.key.is_primary()) {
            let Some(encoded) = item.attr_str(CREDENTIAL_ATTR) else {
                continue;
            };
            let credential = MonitoringCredential::decode(encoded)?;
            if credential.access_key == access_key {
                holding.push((item.key.id.clone(), encoded.to_string()));
            }
        }
        Ok(holding)
    }
}
