//! Live-cluster collaborator.
//!
//! The catalog never talks to Kubernetes or helm itself. Everything it needs
//! from a member cluster goes through [`ClusterClient`], keyed by the
//! cluster's opaque remote-access configuration.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

/// Errors reported by a [`ClusterClient`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The object is already gone.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cluster request failed: {0}")]
    Failed(String),
}

/// Queries and deletions against one member cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Whether the API server answers at all.
    async fn probe(&self, config: &str) -> bool;

    async fn list_namespaces(&self, config: &str) -> Result<Vec<String>, ClientError>;

    /// Helm releases installed in `namespace`.
    async fn list_release_names(
        &self,
        config: &str,
        namespace: &str,
    ) -> Result<Vec<String>, ClientError>;

    async fn list_secret_names(
        &self,
        config: &str,
        namespace: &str,
    ) -> Result<Vec<String>, ClientError>;

    async fn uninstall_release(
        &self,
        config: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError>;

    async fn delete_secret(
        &self,
        config: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError>;

    async fn delete_volume_claim(
        &self,
        config: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError>;

    async fn delete_namespace(&self, config: &str, namespace: &str) -> Result<(), ClientError>;
}

#[derive(Debug, Default)]
struct Namespace {
    releases: BTreeSet<String>,
    secrets: BTreeSet<String>,
    claims: BTreeSet<String>,
}

#[derive(Debug)]
struct ClusterState {
    reachable: bool,
    fail_release_listing: bool,
    fail_deletion_of: HashSet<String>,
    namespaces: BTreeMap<String, Namespace>,
}

/// In-process cluster for tests and local development.
///
/// Ignores the access configuration. Deleting a name registered with
/// [`MemoryCluster::fail_deletion_of`] fails with [`ClientError::Failed`].
#[derive(Debug)]
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState {
                reachable: true,
                fail_release_listing: false,
                fail_deletion_of: HashSet::new(),
                namespaces: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn set_fail_release_listing(&self, fail: bool) {
        self.lock().fail_release_listing = fail;
    }

    pub fn fail_deletion_of(&self, name: &str) {
        self.lock().fail_deletion_of.insert(name.to_string());
    }

    pub fn add_namespace(&self, namespace: &str) {
        self.lock().namespaces.entry(namespace.to_string()).or_default();
    }

    pub fn add_release(&self, namespace: &str, name: &str) {
        let mut state = self.lock();
        let ns = state.namespaces.entry(namespace.to_string()).or_default();
        ns.releases.insert(name.to_string());
    }

    pub fn add_secret(&self, namespace: &str, name: &str) {
        let mut state = self.lock();
        let ns = state.namespaces.entry(namespace.to_string()).or_default();
        ns.secrets.insert(name.to_string());
    }

    pub fn add_volume_claim(&self, namespace: &str, name: &str) {
        let mut state = self.lock();
        let ns = state.namespaces.entry(namespace.to_string()).or_default();
        ns.claims.insert(name.to_string());
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.lock().namespaces.keys().cloned().collect()
    }

    pub fn releases(&self, namespace: &str) -> Vec<String> {
        self.lock()
            .namespaces
            .get(namespace)
            .map(|ns| ns.releases.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn secrets(&self, namespace: &str) -> Vec<String> {
        self.lock()
            .namespaces
            .get(namespace)
            .map(|ns| ns.secrets.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn volume_claims(&self, namespace: &str) -> Vec<String> {
        self.lock()
            .namespaces
            .get(namespace)
            .map(|ns| ns.claims.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn reachable(&self) -> Result<MutexGuard<'_, ClusterState>, ClientError> {
        let state = self.lock();
        if state.reachable {
            Ok(state)
        } else {
            Err(ClientError::Failed("cluster unreachable".into()))
        }
    }

    fn remove_object(
        &self,
        namespace: &str,
        name: &str,
        pick: fn(&mut Namespace) -> &mut BTreeSet<String>,
    ) -> Result<(), ClientError> {
        let mut state = self.reachable()?;
        if state.fail_deletion_of.contains(name) {
            return Err(ClientError::Failed(format!("cannot delete {namespace}/{name}")));
        }
        let removed = state
            .namespaces
            .get_mut(namespace)
            .is_some_and(|ns| pick(ns).remove(name));
        if removed {
            Ok(())
        } else {
            Err(ClientError::NotFound(format!("{namespace}/{name}")))
        }
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn probe(&self, _config: &str) -> bool {
        self.lock().reachable
    }

    async fn list_namespaces(&self, _config: &str) -> Result<Vec<String>, ClientError> {
        Ok(self.reachable()?.namespaces.keys().cloned().collect())
    }

    async fn list_release_names(
        &self,
        _config: &str,
        namespace: &str,
    ) -> Result<Vec<String>, ClientError> {
        let state = self.reachable()?;
        if state.fail_release_listing {
            return Err(ClientError::Failed("helm list failed".into()));
        }
        Ok(state
            .namespaces
            .get(namespace)
            .map(|ns| ns.releases.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_secret_names(
        &self,
        _config: &str,
        namespace: &str,
    ) -> Result<Vec<String>, ClientError> {
        Ok(self
            .reachable()?
            .namespaces
            .get(namespace)
            .map(|ns| ns.secrets.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn uninstall_release(
        &self,
        _config: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.remove_object(namespace, name, |ns| &mut ns.releases)
    }

    async fn delete_secret(
        &self,
        _config: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.remove_object(namespace, name, |ns| &mut ns.secrets)
    }

    async fn delete_volume_claim(
        &self,
        _config: &str,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClientError> {
        self.remove_object(namespace, name, |ns| &mut ns.claims)
    }

    async fn delete_namespace(&self, _config: &str, namespace: &str) -> Result<(), ClientError> {
        let mut state = self.reachable()?;
        if state.fail_deletion_of.contains(namespace) {
            return Err(ClientError::Failed(format!("cannot delete namespace {namespace}")));
        }
        match state.namespaces.remove(namespace) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound(namespace.to_string())),
        }
    }
}
