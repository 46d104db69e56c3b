//! Catalog domain models.
//!
//! Field names are stored camelCase; these structs are both the in-memory
//! form and the stored attribute set of each entity's primary record.

pub mod cluster;
pub mod credential;
pub mod identity;
pub mod workload;

pub use cluster::{Cluster, GeoLocation, WILDCARD};
pub use credential::{CredentialState, MonitoringCredential, NO_CREDENTIAL};
pub use identity::{Group, User};
pub use workload::{AccessMode, ApplicationInstance, PersistentVolumeClaim, Secret, VolumeMode};
