//! Monitoring credentials.
//!
//! A finite pool of pre-provisioned access keys. Each credential is in
//! exactly one [`CredentialState`]; the allocator moves it between states
//! with conditional writes only.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Serialized form of "no credential".
pub const NO_CREDENTIAL: &str = "none";

/// Lifecycle state of a [`MonitoringCredential`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialState {
    Available,
    InUse,
    Revoked,
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Available => "available",
            Self::InUse => "in use",
            Self::Revoked => "revoked",
        })
    }
}

/// One access key pair from the shared pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringCredential {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub in_use: bool,
    #[serde(default)]
    pub revoked: bool,
}

impl MonitoringCredential {
    /// A fresh, available credential.
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            in_use: false,
            revoked: false,
        }
    }

    pub fn state(&self) -> CredentialState {
        match (self.revoked, self.in_use) {
            (true, _) => CredentialState::Revoked,
            (false, true) => CredentialState::InUse,
            (false, false) => CredentialState::Available,
        }
    }

    /// The default credential stands for "none assigned".
    pub fn is_empty(&self) -> bool {
        self.access_key.is_empty() && self.secret_key.is_empty()
    }

    /// Encode as the single string stored on a cluster record.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        if self.is_empty() {
            return Ok(NO_CREDENTIAL.to_string());
        }
        serde_json::to_string(self)
    }

    /// Inverse of [`MonitoringCredential::encode`].
    pub fn decode(s: &str) -> Result<Self, serde_json::Error> {
        if s.is_empty() || s == NO_CREDENTIAL {
            return Ok(Self::default());
        }
        serde_json::from_str(s)
    }
}

/// Serde adapter storing `Option<MonitoringCredential>` as its encoded
/// string, with `None` written as [`NO_CREDENTIAL`].
pub(crate) mod as_encoded {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{MonitoringCredential, NO_CREDENTIAL};

    pub fn serialize<S: Serializer>(
        value: &Option<MonitoringCredential>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(cred) => serializer.serialize_str(&cred.encode().map_err(S::Error::custom)?),
            None => serializer.serialize_str(NO_CREDENTIAL),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<MonitoringCredential>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        let cred = MonitoringCredential::decode(&raw).map_err(D::Error::custom)?;
        Ok((!cred.is_empty()).then_some(cred))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_follows_flags() {
        let mut cred = MonitoringCredential::new("AK", "SK");
        assert_eq!(cred.state(), CredentialState::Available);
        cred.in_use = true;
        assert_eq!(cred.state(), CredentialState::InUse);
        cred.revoked = true;
        assert_eq!(cred.state(), CredentialState::Revoked);
        cred.in_use = false;
        assert_eq!(cred.state(), CredentialState::Revoked);
    }

    #[test]
    fn empty_credential_encodes_to_sentinel() {
        assert_eq!(MonitoringCredential::default().encode().unwrap(), NO_CREDENTIAL);
        assert!(MonitoringCredential::decode(NO_CREDENTIAL).unwrap().is_empty());
        assert!(MonitoringCredential::decode("").unwrap().is_empty());
    }

    #[test]
    fn real_credential_is_distinct_from_sentinel() {
        let mut cred = MonitoringCredential::new("none", "x/y+z:w");
        cred.in_use = true;
        let encoded = cred.encode().unwrap();
        assert_ne!(encoded, NO_CREDENTIAL);
        assert_eq!(MonitoringCredential::decode(&encoded).unwrap(), cred);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(MonitoringCredential::decode("{not json").is_err());
    }
}
