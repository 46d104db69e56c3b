//! Typed item addressing.
//!
//! An item is addressed by `(id, sort_key)`. The primary record of an entity
//! uses the id itself as sort key; ancillary and edge records append a
//! suffix after a colon:
//!
//! | Suffix                         | Sort key                     |
//! |--------------------------------|------------------------------|
//! | `Primary`                      | `<id>`                       |
//! | `Config`                       | `<id>:config`                |
//! | `Locations`                    | `<id>:Locations`             |
//! | `Group(g)`                     | `<id>:<g>`                   |
//! | `GroupApplications(g)`         | `<id>:<g>:Applications`      |

use std::fmt;

use super::StoreError;

const CONFIG: &str = "config";
const LOCATIONS: &str = "Locations";
const APPLICATIONS: &str = "Applications";

/// Which record of an entity an item holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySuffix {
    /// The entity's own attributes.
    Primary,
    /// Large, rarely read configuration blob.
    Config,
    /// Geo locations attached to a cluster.
    Locations,
    /// Edge to a group: membership or access grant.
    Group(String),
    /// Per-group allowed application list on a cluster.
    GroupApplications(String),
}

/// The full address of one stored item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub id: String,
    pub suffix: KeySuffix,
}

impl ItemKey {
    pub fn primary(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            suffix: KeySuffix::Primary,
        }
    }

    pub fn config(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            suffix: KeySuffix::Config,
        }
    }

    pub fn locations(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            suffix: KeySuffix::Locations,
        }
    }

    pub fn group_edge(id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            suffix: KeySuffix::Group(group.into()),
        }
    }

    pub fn group_applications(id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            suffix: KeySuffix::GroupApplications(group.into()),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.suffix == KeySuffix::Primary
    }

    /// Encode the sort key string stored alongside `id`.
    pub fn sort_key(&self) -> String {
        match &self.suffix {
            KeySuffix::Primary => self.id.clone(),
            KeySuffix::Config => format!("{}:{CONFIG}", self.id),
            KeySuffix::Locations => format!("{}:{LOCATIONS}", self.id),
            KeySuffix::Group(g) => format!("{}:{g}", self.id),
            KeySuffix::GroupApplications(g) => format!("{}:{g}:{APPLICATIONS}", self.id),
        }
    }

    /// Decode a stored `(id, sort_key)` pair.
    pub fn decode(id: &str, sort_key: &str) -> Result<Self, StoreError> {
        if sort_key == id {
            return Ok(Self::primary(id));
        }
        let rest = sort_key
            .strip_prefix(id)
            .and_then(|r| r.strip_prefix(':'))
            .filter(|r| !r.is_empty())
            .ok_or_else(|| StoreError::Key(format!("sort key '{sort_key}' does not belong to '{id}'")))?;

        let suffix = match rest {
            CONFIG => KeySuffix::Config,
            LOCATIONS => KeySuffix::Locations,
            _ => match rest.strip_suffix(APPLICATIONS).and_then(|g| g.strip_suffix(':')) {
                Some(group) if !group.is_empty() => KeySuffix::GroupApplications(group.to_string()),
                _ if !rest.contains(':') => KeySuffix::Group(rest.to_string()),
                _ => return Err(StoreError::Key(format!("unrecognised sort key suffix '{rest}'"))),
            },
        };
        Ok(Self {
            id: id.to_string(),
            suffix,
        })
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.id, self.sort_key())
    }
}
