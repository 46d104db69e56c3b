//! Users and groups.

use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use serde::{Deserialize, Serialize};

use crate::ids::EntityKind;

/// Length of generated bearer tokens.
const TOKEN_LEN: usize = 32;

/// A person known to the federation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    /// Display name.
    pub name: String,
    /// Handle assigned by the external identity provider.
    pub external_id: String,
    /// Bearer token for API access.
    pub token: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub institution: String,
    #[serde(default)]
    pub admin: bool,
}

impl User {
    /// A new non-admin user with a fresh id and token.
    pub fn new(name: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            id: EntityKind::User.new_id(),
            name: name.into(),
            external_id: external_id.into(),
            token: generate_token(),
            email: String::new(),
            phone: String::new(),
            institution: String::new(),
            admin: false,
        }
    }
}

/// A tenant. Owns clusters and workloads; users join through membership
/// edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub scientific_field: String,
    #[serde(default)]
    pub description: String,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: EntityKind::Group.new_id(),
            name: name.into(),
            email: String::new(),
            phone: String::new(),
            scientific_field: String::new(),
            description: String::new(),
        }
    }
}

/// Generate a random alphanumeric bearer token.
pub fn generate_token() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}
