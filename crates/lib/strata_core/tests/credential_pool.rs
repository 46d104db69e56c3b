//! Monitoring credential allocation under concurrency, and the credential
//! state machine.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use strata_core::codec::SecretCodec;
use strata_core::config::CatalogConfig;
use strata_core::models::{Cluster, CredentialState, Group, MonitoringCredential};
use strata_core::store::MemoryRecordStore;
use strata_core::store::schema::SchemaConfig;
use strata_core::{CatalogError, RepositoryContext};
use tokio_util::sync::CancellationToken;

async fn catalog_with(config: &CatalogConfig) -> Arc<RepositoryContext> {
    let ctx = RepositoryContext::new(
        Arc::new(MemoryRecordStore::with_page_size(2)),
        SecretCodec::from_passphrase("test"),
        config,
    );
    ctx.ensure_schema(&SchemaConfig::default(), &CancellationToken::new())
        .await
        .expect("schema");
    Arc::new(ctx)
}

async fn catalog() -> Arc<RepositoryContext> {
    catalog_with(&CatalogConfig::default()).await
}

async fn fill_pool(ctx: &RepositoryContext, n: usize) {
    for i in 0..n {
        ctx.add_monitoring_credential(&MonitoringCredential::new(format!("AK{i:02}"), "SK"))
            .await
            .unwrap();
    }
}

async fn state_of(ctx: &RepositoryContext, key: &str) -> Option<CredentialState> {
    ctx.get_monitoring_credential(key)
        .await
        .unwrap()
        .map(|c| c.state())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_credential_is_allocated_at_most_once() {
    const CREDENTIALS: usize = 6;
    const TASKS: usize = 24;

    let ctx = catalog().await;
    fill_pool(&ctx, CREDENTIALS).await;
    let cancel = CancellationToken::new();

    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.clone();
            tokio::spawn(async move { ctx.allocate_monitoring_credential(&cancel).await })
        })
        .collect();

    let mut granted = HashSet::new();
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(credential) => assert!(granted.insert(credential.access_key)),
            Err(CatalogError::NoCredentialsAvailable) => exhausted += 1,
            Err(e) => panic!("unexpected allocation error: {e}"),
        }
    }
    assert_eq!(granted.len(), CREDENTIALS);
    assert_eq!(exhausted, TASKS - CREDENTIALS);

    ctx.clear_caches();
    for credential in ctx.list_monitoring_credentials().await.unwrap() {
        assert_eq!(credential.state(), CredentialState::InUse);
    }
}

#[tokio::test]
async fn legal_transitions() {
    let ctx = catalog().await;
    fill_pool(&ctx, 1).await;
    let key = "AK00";
    assert_eq!(state_of(&ctx, key).await, Some(CredentialState::Available));

    // Available -> InUse
    let cancel = CancellationToken::new();
    let credential = ctx.allocate_monitoring_credential(&cancel).await.unwrap();
    assert_eq!(credential.access_key, key);
    assert_eq!(state_of(&ctx, key).await, Some(CredentialState::InUse));

    // InUse cannot be deleted
    assert!(matches!(
        ctx.delete_monitoring_credential(key).await,
        Err(CatalogError::Conflict(_))
    ));

    // InUse -> Available
    assert!(ctx.release_monitoring_credential(key).await.unwrap());
    assert_eq!(state_of(&ctx, key).await, Some(CredentialState::Available));
    assert!(!ctx.release_monitoring_credential(key).await.unwrap());

    // Available -> Revoked, and revoked credentials are never handed out
    ctx.revoke_monitoring_credential(key).await.unwrap();
    assert_eq!(state_of(&ctx, key).await, Some(CredentialState::Revoked));
    assert!(matches!(
        ctx.allocate_monitoring_credential(&cancel).await,
        Err(CatalogError::NoCredentialsAvailable)
    ));
    assert!(!ctx.release_monitoring_credential(key).await.unwrap());

    // Revoked -> deleted
    ctx.delete_monitoring_credential(key).await.unwrap();
    assert_eq!(state_of(&ctx, key).await, None);
    assert!(matches!(
        ctx.delete_monitoring_credential(key).await,
        Err(CatalogError::NotFound(_))
    ));
}

#[tokio::test]
async fn in_use_credentials_can_be_revoked() {
    let ctx = catalog().await;
    fill_pool(&ctx, 1).await;
    let cancel = CancellationToken::new();
    ctx.allocate_monitoring_credential(&cancel).await.unwrap();

    ctx.revoke_monitoring_credential("AK00").await.unwrap();
    ctx.clear_caches();
    assert_eq!(state_of(&ctx, "AK00").await, Some(CredentialState::Revoked));
    ctx.delete_monitoring_credential("AK00").await.unwrap();
}

#[tokio::test]
async fn cluster_assignment_is_single_and_stable() {
    let ctx = catalog().await;
    fill_pool(&ctx, 3).await;
    let group = Group::new("physics");
    ctx.add_group(&group).await.unwrap();
    let cluster = Cluster::new("c1", &group.id, "kubeconfig", "strata-system");
    ctx.add_cluster(&cluster).await.unwrap();
    let cancel = CancellationToken::new();

    let first = ctx
        .assign_monitoring_credential(&cluster.id, &cancel)
        .await
        .unwrap();
    let again = ctx
        .assign_monitoring_credential(&cluster.id, &cancel)
        .await
        .unwrap();
    assert_eq!(first.access_key, again.access_key);

    ctx.clear_caches();
    let stored = ctx.get_cluster(&cluster.id).await.unwrap().unwrap();
    assert_eq!(
        stored.monitoring_credential.map(|c| c.access_key),
        Some(first.access_key.clone())
    );
    let in_use = ctx
        .list_monitoring_credentials()
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.state() == CredentialState::InUse)
        .count();
    assert_eq!(in_use, 1);

    // removing the cluster returns its credential to the pool
    ctx.remove_cluster(&cluster.id).await.unwrap();
    assert_eq!(
        state_of(&ctx, &first.access_key).await,
        Some(CredentialState::Available)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_assignment_to_one_cluster_keeps_one_credential() {
    let ctx = catalog().await;
    fill_pool(&ctx, 8).await;
    let group = Group::new("physics");
    ctx.add_group(&group).await.unwrap();
    let cluster = Cluster::new("c1", &group.id, "kubeconfig", "strata-system");
    ctx.add_cluster(&cluster).await.unwrap();
    let cancel = CancellationToken::new();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.clone();
            let id = cluster.id.clone();
            tokio::spawn(async move { ctx.assign_monitoring_credential(&id, &cancel).await })
        })
        .collect();
    let mut keys = HashSet::new();
    for handle in handles {
        keys.insert(handle.await.unwrap().unwrap().access_key);
    }
    assert_eq!(keys.len(), 1);

    ctx.clear_caches();
    let in_use = ctx
        .list_monitoring_credentials()
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.state() == CredentialState::InUse)
        .count();
    assert_eq!(in_use, 1);
}

#[tokio::test]
async fn cancelled_allocation_stops() {
    let ctx = catalog().await;
    fill_pool(&ctx, 1).await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        ctx.allocate_monitoring_credential(&cancel).await,
        Err(CatalogError::Cancelled)
    ));
    assert_eq!(state_of(&ctx, "AK00").await, Some(CredentialState::Available));
}

#[tokio::test]
async fn elapsed_deadline_stops_allocation() {
    let config = CatalogConfig {
        allocation_deadline: Some(Duration::ZERO),
        ..CatalogConfig::default()
    };
    let ctx = catalog_with(&config).await;
    fill_pool(&ctx, 1).await;
    assert!(matches!(
        ctx.allocate_monitoring_credential(&CancellationToken::new()).await,
        Err(CatalogError::DeadlineExceeded(_))
    ));
}
