//! Cluster consistency checks.
//!
//! The catalog says what should run on a member cluster; the cluster says
//! what does. [`ClusterReconciler`] reports where the two disagree. It never
//! repairs anything.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::client::ClusterClient;
use crate::models::Cluster;
use crate::repo::{CatalogResult, RepositoryContext};

/// Overall verdict of a consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsistencyState {
    /// The cluster did not answer; nothing was compared.
    Unreachable,
    /// Release inventory could not be listed.
    HelmFailure,
    Inconsistent,
    Consistent,
}

impl fmt::Display for ConsistencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unreachable => "unreachable",
            Self::HelmFailure => "helm failure",
            Self::Inconsistent => "inconsistent",
            Self::Consistent => "consistent",
        };
        f.write_str(s)
    }
}

/// Divergence between catalog and cluster.
///
/// Instance names are release names. Secrets are `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConsistencyResult {
    pub cluster: String,
    pub state: ConsistencyState,
    pub missing_instances: Vec<String>,
    pub unexpected_instances: Vec<String>,
    pub missing_secrets: Vec<String>,
    pub unexpected_secrets: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

impl ClusterConsistencyResult {
    fn bare(cluster: &str, state: ConsistencyState) -> Self {
        Self {
            cluster: cluster.to_string(),
            state,
            missing_instances: Vec::new(),
            unexpected_instances: Vec::new(),
            missing_secrets: Vec::new(),
            unexpected_secrets: Vec::new(),
            checked_at: Utc::now(),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.state == ConsistencyState::Consistent
    }
}

/// Compares catalog state with live cluster state.
pub struct ClusterReconciler {
    ctx: Arc<RepositoryContext>,
    client: Arc<dyn ClusterClient>,
}

impl ClusterReconciler {
    pub fn new(ctx: Arc<RepositoryContext>, client: Arc<dyn ClusterClient>) -> Self {
        Self { ctx, client }
    }

    /// Check one cluster.
    ///
    /// Remote failures become states of the result; only catalog failures
    /// are returned as errors.
    pub async fn check_cluster_consistency(
        &self,
        cluster: &Cluster,
    ) -> CatalogResult<ClusterConsistencyResult> {
        let config = cluster.config.as_str();
        if !self.client.probe(config).await {
            warn!(cluster = %cluster.id, "cluster did not answer the probe");
            return Ok(ClusterConsistencyResult::bare(
                &cluster.id,
                ConsistencyState::Unreachable,
            ));
        }

        let namespaces = match self.client.list_namespaces(config).await {
            Ok(all) => all
                .into_iter()
                .filter(|ns| self.ctx.is_tenant_namespace(ns))
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(cluster = %cluster.id, error = %e, "failed to list namespaces");
                return Ok(ClusterConsistencyResult::bare(
                    &cluster.id,
                    ConsistencyState::Unreachable,
                ));
            }
        };

        let mut observed_releases = BTreeSet::new();
        for ns in &namespaces {
            match self.client.list_release_names(config, ns).await {
                Ok(names) => observed_releases.extend(names),
                Err(e) => {
                    warn!(cluster = %cluster.id, namespace = %ns, error = %e, "failed to list releases");
                    return Ok(ClusterConsistencyResult::bare(
                        &cluster.id,
                        ConsistencyState::HelmFailure,
                    ));
                }
            }
        }

        let mut observed_secrets = BTreeSet::new();
        for ns in &namespaces {
            match self.client.list_secret_names(config, ns).await {
                Ok(names) => observed_secrets.extend(
                    names
                        .into_iter()
                        .filter(|n| !is_service_account_token(n))
                        .map(|n| format!("{ns}/{n}")),
                ),
                Err(e) => {
                    // a namespace whose secrets cannot be listed contributes
                    // nothing; its catalog secrets then show up as missing
                    warn!(cluster = %cluster.id, namespace = %ns, error = %e, "failed to list secrets");
                }
            }
        }

        let expected_releases: BTreeSet<String> = self
            .ctx
            .list_instances_by_cluster_or_group(Some(&cluster.id), None)
            .await?
            .into_iter()
            .map(|i| i.name)
            .collect();
        let expected_secrets = self.expected_secrets(&cluster.id).await?;

        let result = compare(
            &cluster.id,
            &expected_releases,
            &observed_releases,
            &expected_secrets,
            &observed_secrets,
        );
        info!(cluster = %cluster.id, state = %result.state, "checked cluster consistency");
        Ok(result)
    }

    /// Check every cluster in the catalog concurrently.
    pub async fn check_all(&self) -> CatalogResult<Vec<ClusterConsistencyResult>> {
        let clusters = self.ctx.list_clusters().await?;
        join_all(clusters.iter().map(|c| self.check_cluster_consistency(c)))
            .await
            .into_iter()
            .collect()
    }

    async fn expected_secrets(&self, cluster_id: &str) -> CatalogResult<BTreeSet<String>> {
        let mut expected = BTreeSet::new();
        for secret in self
            .ctx
            .list_secrets_by_cluster_or_group(Some(cluster_id), None)
            .await?
        {
            let namespace = match self.ctx.get_group(&secret.owning_group).await? {
                Some(group) => self.ctx.tenant_namespace(&group.name),
                None => {
                    debug!(secret = %secret.id, group = %secret.owning_group, "secret owner is gone");
                    self.ctx.tenant_namespace(&secret.owning_group)
                }
            };
            expected.insert(format!("{namespace}/{}", secret.name));
        }
        Ok(expected)
    }
}

/// Kubernetes creates `<account>-token-<5 chars>` secrets for service
/// accounts on its own; they never appear in the catalog.
pub fn is_service_account_token(name: &str) -> bool {
    match name.rsplit_once("-token-") {
        Some((account, suffix)) => {
            !account.is_empty()
                && suffix.len() == 5
                && suffix
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        }
        None => false,
    }
}

fn compare(
    cluster: &str,
    expected_releases: &BTreeSet<String>,
    observed_releases: &BTreeSet<String>,
    expected_secrets: &BTreeSet<String>,
    observed_secrets: &BTreeSet<String>,
) -> ClusterConsistencyResult {
    let mut result = ClusterConsistencyResult::bare(cluster, ConsistencyState::Consistent);
    result.missing_instances = expected_releases
        .difference(observed_releases)
        .cloned()
        .collect();
    result.unexpected_instances = observed_releases
        .difference(expected_releases)
        .cloned()
        .collect();
    result.missing_secrets = expected_secrets
        .difference(observed_secrets)
        .cloned()
        .collect();
    result.unexpected_secrets = observed_secrets
        .difference(expected_secrets)
        .cloned()
        .collect();
    if !(result.missing_instances.is_empty()
        && result.unexpected_instances.is_empty()
        && result.missing_secrets.is_empty()
        && result.unexpected_secrets.is_empty())
    {
        result.state = ConsistencyState::Inconsistent;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn set_differences_in_both_directions() {
        let r = compare(
            "Cluster_1",
            &set(&["a", "b", "c"]),
            &set(&["b", "c", "d"]),
            &set(&[]),
            &set(&[]),
        );
        assert_eq!(r.state, ConsistencyState::Inconsistent);
        assert_eq!(r.missing_instances, vec!["a"]);
        assert_eq!(r.unexpected_instances, vec!["d"]);
    }

    #[test]
    fn equal_sets_are_consistent() {
        let r = compare(
            "Cluster_1",
            &set(&["a"]),
            &set(&["a"]),
            &set(&["tenant-x/s"]),
            &set(&["tenant-x/s"]),
        );
        assert!(r.is_consistent());
    }

    #[test]
    fn secret_divergence_alone_is_inconsistent() {
        let r = compare(
            "Cluster_1",
            &set(&[]),
            &set(&[]),
            &set(&["tenant-x/s"]),
            &set(&[]),
        );
        assert_eq!(r.state, ConsistencyState::Inconsistent);
        assert_eq!(r.missing_secrets, vec!["tenant-x/s"]);
    }

    #[test]
    fn service_account_tokens() {
        assert!(is_service_account_token("default-token-x7k2p"));
        assert!(is_service_account_token("builder-token-abc12"));
        assert!(!is_service_account_token("db-token"));
        assert!(!is_service_account_token("api-token-values"));
        assert!(!is_service_account_token("-token-abcde"));
        assert!(!is_service_account_token("my-secret"));
    }
}
