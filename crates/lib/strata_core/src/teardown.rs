//! Cluster deletion.
//!
//! Removing a cluster from the federation cascades in stages. Instances,
//! secrets and volume claims are deleted concurrently, remotely and from the
//! catalog; once all of them have settled the tenant namespaces are deleted
//! concurrently; once those have settled the cluster record goes.
//!
//! Without `force` a failing stage stops the cascade and the cluster record
//! stays. With `force` failures are logged and collected, catalog records go
//! even when their remote objects could not be deleted, and the cluster
//! record is removed regardless.

use std::collections::HashMap;

use futures_util::future::{join_all, join3};
use tracing::{error, info, warn};

use crate::client::{ClientError, ClusterClient};
use crate::models::Cluster;
use crate::repo::{CatalogError, CatalogResult, RepositoryContext};

/// Counts of what a teardown deleted.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub instances: usize,
    pub secrets: usize,
    pub volumes: usize,
    pub namespaces: usize,
    /// Failures skipped because of `force`.
    pub ignored: Vec<CatalogError>,
}

impl RepositoryContext {
    /// Delete `cluster` together with everything the federation placed on it.
    pub async fn delete_cluster(
        &self,
        cluster: &Cluster,
        client: &dyn ClusterClient,
        force: bool,
    ) -> CatalogResult<TeardownReport> {
        info!(cluster = %cluster.id, name = %cluster.name, force, "tearing down cluster");
        let mut report = TeardownReport::default();
        let config = cluster.config.as_str();
        let id = cluster.id.as_str();

        let instances = self
            .list_instances_by_cluster_or_group(Some(id), None)
            .await?;
        let secrets = self.list_secrets_by_cluster_or_group(Some(id), None).await?;
        let volumes = self.list_volumes_by_cluster_or_group(Some(id), None).await?;

        let owners = instances
            .iter()
            .map(|i| i.owning_group.as_str())
            .chain(secrets.iter().map(|s| s.owning_group.as_str()))
            .chain(volumes.iter().map(|v| v.owning_group.as_str()));
        let mut namespaces: HashMap<String, String> = HashMap::new();
        for owner in owners {
            if !namespaces.contains_key(owner) {
                let ns = self.namespace_of(owner).await?;
                namespaces.insert(owner.to_string(), ns);
            }
        }
        let namespaces = &namespaces;

        let (instance_results, secret_results, volume_results) = join3(
            join_all(instances.iter().map(|i| async move {
                let ns = namespace_in(namespaces, &i.owning_group);
                let gone = remote(id, client.uninstall_release(config, ns, &i.name).await);
                retire(gone, force, self.remove_instance(&i.id)).await
            })),
            join_all(secrets.iter().map(|s| async move {
                let ns = namespace_in(namespaces, &s.owning_group);
                let gone = remote(id, client.delete_secret(config, ns, &s.name).await);
                retire(gone, force, self.remove_secret(&s.id)).await
            })),
            join_all(volumes.iter().map(|v| async move {
                let ns = namespace_in(namespaces, &v.owning_group);
                let gone = remote(id, client.delete_volume_claim(config, ns, &v.name).await);
                retire(gone, force, self.remove_volume(&v.id)).await
            })),
        )
        .await;
        report.instances = settle(id, "instance", instance_results, force, &mut report.ignored)?;
        report.secrets = settle(id, "secret", secret_results, force, &mut report.ignored)?;
        report.volumes = settle(id, "volume", volume_results, force, &mut report.ignored)?;

        let tenant_namespaces: Vec<String> = match client.list_namespaces(config).await {
            Ok(all) => all
                .into_iter()
                .filter(|n| self.is_tenant_namespace(n))
                .collect(),
            Err(source) => {
                let e = CatalogError::Remote {
                    cluster: id.to_string(),
                    source,
                };
                if !force {
                    error!(cluster = id, error = %e, "failed to list namespaces");
                    return Err(e);
                }
                warn!(cluster = id, error = %e, "skipping namespace cleanup");
                report.ignored.push(e);
                Vec::new()
            }
        };
        let namespace_results = join_all(tenant_namespaces.iter().map(|n| async move {
            remote(id, client.delete_namespace(config, n).await).map(|()| None)
        }))
        .await;
        report.namespaces =
            settle(id, "namespace", namespace_results, force, &mut report.ignored)?;

        self.remove_cluster(id).await?;
        info!(
            cluster = id,
            instances = report.instances,
            secrets = report.secrets,
            volumes = report.volumes,
            namespaces = report.namespaces,
            ignored = report.ignored.len(),
            "cluster torn down"
        );
        Ok(report)
    }

    async fn namespace_of(&self, group_id: &str) -> CatalogResult<String> {
        Ok(match self.get_group(group_id).await? {
            Some(group) => self.tenant_namespace(&group.name),
            None => self.tenant_namespace(group_id),
        })
    }
}

fn namespace_in<'a>(namespaces: &'a HashMap<String, String>, group: &str) -> &'a str {
    namespaces.get(group).map_or("", String::as_str)
}

/// Map a remote result; an object that is already gone counts as deleted.
fn remote(cluster: &str, result: Result<(), ClientError>) -> CatalogResult<()> {
    match result {
        Ok(()) | Err(ClientError::NotFound(_)) => Ok(()),
        Err(source) => Err(CatalogError::Remote {
            cluster: cluster.to_string(),
            source,
        }),
    }
}

/// Remove a catalog record once its remote object is gone.
///
/// With `force` the record is removed even though the remote deletion
/// failed, and that failure is handed back for the report.
async fn retire<T>(
    gone: CatalogResult<()>,
    force: bool,
    remove: impl Future<Output = CatalogResult<T>>,
) -> CatalogResult<Option<CatalogError>> {
    let skipped = match gone {
        Ok(()) => None,
        Err(e) if force => Some(e),
        Err(e) => return Err(e),
    };
    remove.await?;
    Ok(skipped)
}

/// Count removals, or fail on the first error unless `force` is set.
fn settle(
    cluster: &str,
    what: &str,
    results: Vec<CatalogResult<Option<CatalogError>>>,
    force: bool,
    ignored: &mut Vec<CatalogError>,
) -> CatalogResult<usize> {
    let mut done = 0;
    for result in results {
        match result {
            Ok(skipped) => {
                done += 1;
                if let Some(e) = skipped {
                    warn!(
                        cluster,
                        what,
                        error = %e,
                        "remote deletion failed, removed the record anyway"
                    );
                    ignored.push(e);
                }
            }
            Err(e) if force => {
                warn!(cluster, what, error = %e, "ignoring failed deletion");
                ignored.push(e);
            }
            Err(e) => {
                error!(cluster, what, error = %e, "deletion failed, aborting teardown");
                return Err(e);
            }
        }
    }
    Ok(done)
}
