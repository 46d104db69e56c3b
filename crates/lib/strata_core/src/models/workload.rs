//! Tenant workloads placed on member clusters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::EntityKind;

/// A deployed application (a helm release) owned by a group.
///
/// The configuration blob is stored apart from this record; see
/// `RepositoryContext::instance_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationInstance {
    pub id: String,
    /// Release name on the cluster.
    pub name: String,
    /// Chart the instance was installed from.
    pub application: String,
    pub owning_group: String,
    pub cluster: String,
    pub created: DateTime<Utc>,
}

impl ApplicationInstance {
    pub fn new(
        name: impl Into<String>,
        application: impl Into<String>,
        owning_group: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            id: EntityKind::Instance.new_id(),
            name: name.into(),
            application: application.into(),
            owning_group: owning_group.into(),
            cluster: cluster.into(),
            created: Utc::now(),
        }
    }
}

/// A Kubernetes secret whose payload the catalog keeps encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub id: String,
    pub name: String,
    pub owning_group: String,
    pub cluster: String,
    pub created: DateTime<Utc>,
    /// Envelope produced by `SecretCodec::encrypt`.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Secret {
    pub fn new(
        name: impl Into<String>,
        owning_group: impl Into<String>,
        cluster: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id: EntityKind::Secret.new_id(),
            name: name.into(),
            owning_group: owning_group.into(),
            cluster: cluster.into(),
            created: Utc::now(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeMode {
    Filesystem,
    Block,
}

/// A persistent volume claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaim {
    pub id: String,
    pub name: String,
    pub owning_group: String,
    pub cluster: String,
    /// Kubernetes quantity, e.g. `10Gi`.
    pub storage_request: String,
    pub access_mode: AccessMode,
    pub volume_mode: VolumeMode,
    #[serde(default)]
    pub storage_class: String,
    pub created: DateTime<Utc>,
}

impl PersistentVolumeClaim {
    pub fn new(
        name: impl Into<String>,
        owning_group: impl Into<String>,
        cluster: impl Into<String>,
        storage_request: impl Into<String>,
    ) -> Self {
        Self {
            id: EntityKind::Volume.new_id(),
            name: name.into(),
            owning_group: owning_group.into(),
            cluster: cluster.into(),
            storage_request: storage_request.into(),
            access_mode: AccessMode::ReadWriteOnce,
            volume_mode: VolumeMode::Filesystem,
            storage_class: String::new(),
            created: Utc::now(),
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
