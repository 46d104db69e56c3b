//! Member clusters.

use serde::{Deserialize, Serialize};

use super::credential::{self, MonitoringCredential};
use crate::ids::EntityKind;

/// Sentinel group id granting every group access to a cluster, or every
/// application to a group.
pub const WILDCARD: &str = "*";

/// A Kubernetes cluster federated into the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub owning_group: String,
    /// Remote-access configuration (a kubeconfig). Opaque to the catalog.
    pub config: String,
    pub system_namespace: String,
    #[serde(default)]
    pub owning_organization: String,
    /// Assigned only through conditional writes; see
    /// `RepositoryContext::set_cluster_monitoring_credential`.
    #[serde(default, with = "credential::as_encoded")]
    pub monitoring_credential: Option<MonitoringCredential>,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        owning_group: impl Into<String>,
        config: impl Into<String>,
        system_namespace: impl Into<String>,
    ) -> Self {
        Self {
            id: EntityKind::Cluster.new_id(),
            name: name.into(),
            owning_group: owning_group.into(),
            config: config.into(),
            system_namespace: system_namespace.into(),
            owning_organization: String::new(),
            monitoring_credential: None,
        }
    }
}

/// A point on the map where a cluster's hardware lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl GeoLocation {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            description: None,
        }
    }
}
