//! Consistency checks and teardown against an in-memory member cluster.

use std::sync::Arc;

use strata_core::client::MemoryCluster;
use strata_core::codec::SecretCodec;
use strata_core::config::CatalogConfig;
use strata_core::models::{
    ApplicationInstance, Cluster, CredentialState, Group, MonitoringCredential,
    PersistentVolumeClaim,
};
use strata_core::reconcile::{ClusterReconciler, ConsistencyState};
use strata_core::store::MemoryRecordStore;
use strata_core::store::schema::SchemaConfig;
use strata_core::{CatalogError, RepositoryContext};
use tokio_util::sync::CancellationToken;

struct Fixture {
    ctx: Arc<RepositoryContext>,
    remote: Arc<MemoryCluster>,
    group: Group,
    cluster: Cluster,
}

impl Fixture {
    async fn new() -> Self {
        let ctx = RepositoryContext::new(
            Arc::new(MemoryRecordStore::new()),
            SecretCodec::from_passphrase("test"),
            &CatalogConfig::default(),
        );
        ctx.ensure_schema(&SchemaConfig::default(), &CancellationToken::new())
            .await
            .expect("schema");
        let group = Group::new("physics");
        ctx.add_group(&group).await.unwrap();
        let cluster = Cluster::new("c1", &group.id, "kubeconfig", "strata-system");
        ctx.add_cluster(&cluster).await.unwrap();

        let remote = Arc::new(MemoryCluster::new());
        remote.add_namespace("kube-system");
        remote.add_namespace("strata-system");
        remote.add_secret("kube-system", "bootstrap");
        Self {
            ctx: Arc::new(ctx),
            remote,
            group,
            cluster,
        }
    }

    fn namespace(&self) -> String {
        self.ctx.tenant_namespace(&self.group.name)
    }

    fn reconciler(&self) -> ClusterReconciler {
        ClusterReconciler::new(Arc::clone(&self.ctx), self.remote.clone())
    }

    /// Record an instance in the catalog; `remote` also installs it.
    async fn instance(&self, name: &str, remote: bool) -> ApplicationInstance {
        let inst = ApplicationInstance::new(name, "nginx", &self.group.id, &self.cluster.id);
        self.ctx.add_instance(&inst, "{}").await.unwrap();
        if remote {
            self.remote.add_release(&self.namespace(), name);
        }
        inst
    }

    async fn secret(&self, name: &str, remote: bool) {
        self.ctx
            .add_secret(name, &self.group.id, &self.cluster.id, b"payload")
            .await
            .unwrap();
        if remote {
            self.remote.add_secret(&self.namespace(), name);
        }
    }

    async fn volume(&self, name: &str) {
        let claim = PersistentVolumeClaim::new(name, &self.group.id, &self.cluster.id, "1Gi");
        self.ctx.add_volume(&claim).await.unwrap();
        self.remote.add_volume_claim(&self.namespace(), name);
    }
}

#[tokio::test]
async fn divergent_instances_are_reported_both_ways() {
    let fx = Fixture::new().await;
    fx.instance("a", false).await;
    fx.instance("b", true).await;
    fx.instance("c", true).await;
    fx.remote.add_release(&fx.namespace(), "d");

    let result = fx
        .reconciler()
        .check_cluster_consistency(&fx.cluster)
        .await
        .unwrap();
    assert_eq!(result.state, ConsistencyState::Inconsistent);
    assert_eq!(result.missing_instances, vec!["a"]);
    assert_eq!(result.unexpected_instances, vec!["d"]);
    assert!(result.missing_secrets.is_empty());
    assert!(result.unexpected_secrets.is_empty());
}

#[tokio::test]
async fn matching_state_is_consistent() {
    let fx = Fixture::new().await;
    fx.instance("web", true).await;
    fx.secret("db-password", true).await;
    // created by Kubernetes, never by the catalog
    fx.remote.add_secret(&fx.namespace(), "default-token-x7k2p");

    let result = fx
        .reconciler()
        .check_cluster_consistency(&fx.cluster)
        .await
        .unwrap();
    assert_eq!(result.state, ConsistencyState::Consistent);
}

#[tokio::test]
async fn secrets_are_compared_by_namespace_and_name() {
    let fx = Fixture::new().await;
    fx.secret("db-password", false).await;
    fx.remote.add_secret(&fx.namespace(), "stray");

    let result = fx
        .reconciler()
        .check_cluster_consistency(&fx.cluster)
        .await
        .unwrap();
    let ns = fx.namespace();
    assert_eq!(result.state, ConsistencyState::Inconsistent);
    assert_eq!(result.missing_secrets, vec![format!("{ns}/db-password")]);
    assert_eq!(result.unexpected_secrets, vec![format!("{ns}/stray")]);
}

#[tokio::test]
async fn unreachable_cluster_is_not_compared() {
    let fx = Fixture::new().await;
    fx.instance("a", false).await;
    fx.remote.set_reachable(false);

    let result = fx
        .reconciler()
        .check_cluster_consistency(&fx.cluster)
        .await
        .unwrap();
    assert_eq!(result.state, ConsistencyState::Unreachable);
    assert!(result.missing_instances.is_empty());
    assert!(result.missing_secrets.is_empty());
}

#[tokio::test]
async fn release_listing_failure() {
    let fx = Fixture::new().await;
    fx.instance("a", true).await;
    fx.remote.set_fail_release_listing(true);

    let result = fx
        .reconciler()
        .check_cluster_consistency(&fx.cluster)
        .await
        .unwrap();
    assert_eq!(result.state, ConsistencyState::HelmFailure);
}

#[tokio::test]
async fn check_all_covers_every_cluster() {
    let fx = Fixture::new().await;
    let other = Cluster::new("c2", &fx.group.id, "kubeconfig-2", "strata-system");
    fx.ctx.add_cluster(&other).await.unwrap();

    let results = fx.reconciler().check_all().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_consistent()));
}

#[tokio::test]
async fn teardown_removes_everything() {
    let fx = Fixture::new().await;
    fx.ctx
        .add_monitoring_credential(&MonitoringCredential::new("AK", "SK"))
        .await
        .unwrap();
    fx.ctx
        .assign_monitoring_credential(&fx.cluster.id, &CancellationToken::new())
        .await
        .unwrap();
    fx.instance("web", true).await;
    // already gone remotely; still counts as deleted
    fx.instance("ghost", false).await;
    fx.secret("db-password", true).await;
    fx.volume("scratch").await;

    let report = fx
        .ctx
        .delete_cluster(&fx.cluster, fx.remote.as_ref(), false)
        .await
        .unwrap();
    assert_eq!(report.instances, 2);
    assert_eq!(report.secrets, 1);
    assert_eq!(report.volumes, 1);
    assert_eq!(report.namespaces, 1);
    assert!(report.ignored.is_empty());

    assert_eq!(fx.ctx.get_cluster(&fx.cluster.id).await.unwrap(), None);
    assert!(fx.ctx.list_instances().await.unwrap().is_empty());
    assert!(fx.ctx.list_secrets().await.unwrap().is_empty());
    assert_eq!(fx.remote.namespaces(), vec!["kube-system", "strata-system"]);
    let credential = fx.ctx.get_monitoring_credential("AK").await.unwrap().unwrap();
    assert_eq!(credential.state(), CredentialState::Available);
}

#[tokio::test]
async fn failed_teardown_keeps_the_cluster() {
    let fx = Fixture::new().await;
    fx.instance("web", true).await;
    fx.secret("stuck", true).await;
    fx.remote.fail_deletion_of("stuck");

    let err = fx
        .ctx
        .delete_cluster(&fx.cluster, fx.remote.as_ref(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Remote { .. }));

    assert!(fx.ctx.get_cluster(&fx.cluster.id).await.unwrap().is_some());
    assert_eq!(fx.ctx.list_secrets().await.unwrap().len(), 1);
    assert!(fx.remote.namespaces().contains(&fx.namespace()));
}

#[tokio::test]
async fn forced_teardown_removes_the_record_anyway() {
    let fx = Fixture::new().await;
    fx.instance("web", true).await;
    fx.instance("stuck-web", true).await;
    fx.secret("stuck", true).await;
    fx.remote.fail_deletion_of("stuck");
    fx.remote.fail_deletion_of("stuck-web");
    fx.remote.fail_deletion_of(&fx.namespace());

    let report = fx
        .ctx
        .delete_cluster(&fx.cluster, fx.remote.as_ref(), true)
        .await
        .unwrap();
    assert_eq!(report.instances, 2);
    assert_eq!(report.secrets, 1);
    assert_eq!(report.namespaces, 0);
    // the release, the secret and the namespace
    assert_eq!(report.ignored.len(), 3);
    assert_eq!(fx.ctx.get_cluster(&fx.cluster.id).await.unwrap(), None);

    // nothing in the catalog points at the removed cluster
    fx.ctx.clear_caches();
    assert!(fx.ctx.list_instances().await.unwrap().is_empty());
    assert!(fx.ctx.list_secrets().await.unwrap().is_empty());
    assert!(fx.remote.namespaces().contains(&fx.namespace()));
}

#[tokio::test]
async fn forced_teardown_of_unreachable_cluster() {
    let fx = Fixture::new().await;
    fx.instance("web", true).await;
    fx.volume("scratch").await;
    fx.remote.set_reachable(false);

    let report = fx
        .ctx
        .delete_cluster(&fx.cluster, fx.remote.as_ref(), true)
        .await
        .unwrap();
    assert_eq!(report.instances, 1);
    assert_eq!(report.volumes, 1);
    // the uninstall, the claim deletion and the namespace listing
    assert_eq!(report.ignored.len(), 3);
    assert_eq!(fx.ctx.get_cluster(&fx.cluster.id).await.unwrap(), None);

    fx.ctx.clear_caches();
    assert!(fx.ctx.list_instances().await.unwrap().is_empty());
    assert!(
        fx.ctx
            .list_volumes_by_cluster_or_group(Some(&fx.cluster.id), None)
            .await
            .unwrap()
            .is_empty()
    );
}
