use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::type_token::{QualifiedType, Type};
use crate::UrnError;

/// The scheme prefix of every URN.
const PREFIX: &str = "urn:keel:";

/// The separator between URN components.
const SEP: &str = "::";

/// The stable identity of a resource.
///
/// Serialized as `urn:keel:{stack}::{project}::{qualified type}::{name}`.
/// Two states may transiently share a URN inside a snapshot during a
/// replacement (the outgoing one is marked pending-delete); everywhere else
/// URNs are unique.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Urn {
    canonical: String,
    // Byte offsets of the `::` separators inside `canonical`, in order.
    seps: [usize; 3],
}

impl Urn {
    /// Construct a URN from its components. The parent's qualified type, if
    /// any, prefixes the resource's own type.
    pub fn new(
        stack: &str,
        project: &str,
        parent_type: Option<&QualifiedType>,
        ty: &Type,
        name: &str,
    ) -> Self {
        let qualified = QualifiedType::new(parent_type, ty);
        let canonical = format!("{PREFIX}{stack}{SEP}{project}{SEP}{qualified}{SEP}{name}");
        Self::from_canonical(canonical).expect("constructed URNs are well-formed")
    }

    fn from_canonical(canonical: String) -> Result<Self, UrnError> {
        let Some(body) = canonical.strip_prefix(PREFIX) else {
            return Err(UrnError::InvalidUrn(canonical));
        };
        let mut seps = [0usize; 3];
        let mut found = 0;
        let mut search = 0;
        while found < 3 {
            match body[search..].find(SEP) {
                Some(at) => {
                    seps[found] = PREFIX.len() + search + at;
                    search += at + SEP.len();
                    found += 1;
                }
                None => return Err(UrnError::InvalidUrn(canonical)),
            }
        }
        let urn = Self { canonical, seps };
        if urn.stack().is_empty() || urn.project().is_empty() || urn.name().is_empty() {
            return Err(UrnError::InvalidUrn(urn.canonical));
        }
        // Validate the embedded qualified type eagerly so downstream code can
        // rely on `qualified_type` never failing.
        let raw = urn.qualified_type_str().to_string();
        QualifiedType::from_raw(raw)?;
        Ok(urn)
    }

    pub fn stack(&self) -> &str {
        &self.canonical[PREFIX.len()..self.seps[0]]
    }

    pub fn project(&self) -> &str {
        &self.canonical[self.seps[0] + SEP.len()..self.seps[1]]
    }

    fn qualified_type_str(&self) -> &str {
        &self.canonical[self.seps[1] + SEP.len()..self.seps[2]]
    }

    /// The full, parent-qualified type embedded in this URN.
    pub fn qualified_type(&self) -> QualifiedType {
        QualifiedType::from_raw(self.qualified_type_str().to_string())
            .expect("validated at construction")
    }

    /// The resource's own (unqualified) type.
    pub fn ty(&self) -> Type {
        self.qualified_type().ty()
    }

    pub fn name(&self) -> &str {
        &self.canonical[self.seps[2] + SEP.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Rebase this URN under a different name, keeping every other component.
    pub fn rename(&self, name: &str) -> Self {
        let canonical = format!("{}{SEP}{name}", &self.canonical[..self.seps[2]]);
        Self::from_canonical(canonical).expect("renamed URNs are well-formed")
    }
}

impl FromStr for Urn {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_canonical(s.to_string())
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl Serialize for Urn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> Deserialize<'de> for Urn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let canonical = String::deserialize(deserializer)?;
        Self::from_canonical(canonical).map_err(de::Error::custom)
    }
}
