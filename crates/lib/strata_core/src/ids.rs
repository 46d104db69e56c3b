//! Entity identifiers.
//!
//! Every catalog id carries its kind as a prefix (`Cluster_…`), so a lookup
//! can tell a generated id apart from a name typed by a person. The random
//! part is a UUIDv7 in simple form, which keeps ids of one kind roughly
//! creation-ordered.

use std::fmt;

use uuid::Uuid;

/// The kinds of catalog entity that receive generated ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Group,
    Cluster,
    Instance,
    Secret,
    Volume,
}

impl EntityKind {
    /// The id prefix for this kind, including the trailing underscore.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::User => "User_",
            Self::Group => "Group_",
            Self::Cluster => "Cluster_",
            Self::Instance => "Instance_",
            Self::Secret => "Secret_",
            Self::Volume => "Volume_",
        }
    }

    /// Generate a fresh id of this kind.
    pub fn new_id(self) -> String {
        format!("{}{}", self.prefix(), Uuid::now_v7().simple())
    }

    /// Whether `s` has the shape of an id of this kind.
    pub fn is_id(self, s: &str) -> bool {
        s.strip_prefix(self.prefix())
            .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_alphanumeric()))
    }

    /// Recover the kind of an id from its prefix.
    pub fn of(id: &str) -> Option<Self> {
        [
            Self::User,
            Self::Group,
            Self::Cluster,
            Self::Instance,
            Self::Secret,
            Self::Volume,
        ]
        .into_iter()
        .find(|k| k.is_id(id))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix().trim_end_matches('_'))
    }
}
