use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use keel_urn::Urn;

use crate::SnapshotError;

/// The ID of a configured provider instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The placeholder ID carried by provider references during previews,
    /// before the provider resource has been created.
    pub fn unknown() -> Self {
        Self("unknown".to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == "unknown"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A reference to a configured provider: the provider resource's URN plus
/// the instance ID. Serialized as `<urn>::<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderReference {
    pub urn: Urn,
    pub id: ProviderId,
}

impl ProviderReference {
    pub fn new(urn: Urn, id: ProviderId) -> Result<Self, SnapshotError> {
        if !urn.ty().is_provider_type() {
            return Err(SnapshotError::InvalidProviderReference(urn.to_string()));
        }
        Ok(Self { urn, id })
    }
}

impl FromStr for ProviderReference {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SnapshotError::InvalidProviderReference(s.to_string());
        // The URN itself contains `::`; the ID is everything after the last
        // occurrence.
        let (urn, id) = s.rsplit_once("::").ok_or_else(invalid)?;
        if id.is_empty() {
            return Err(invalid());
        }
        let urn: Urn = urn.parse().map_err(|_| invalid())?;
        Self::new(urn, ProviderId::new(id)).map_err(|_| invalid())
    }
}

impl fmt::Display for ProviderReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.urn, self.id)
    }
}

impl Serialize for ProviderReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProviderReference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
