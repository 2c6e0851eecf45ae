use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::UrnError;

/// The module segment reserved for provider resources (`keel:providers:aws`).
pub const PROVIDERS_MODULE: &str = "providers";

/// The package segment reserved for engine-owned types.
const ENGINE_PACKAGE: &str = "keel";

/// A resource type token of the form `package:module:name`.
///
/// The module segment may be empty (`package::Name`), and a bare `package`
/// is accepted where only the package matters (provider version requests).
/// Segments may not contain `:` or the qualified-type separator `$`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Type(String);

impl Type {
    /// Parse a type token, rejecting malformed input.
    pub fn parse(token: impl Into<String>) -> Result<Self, UrnError> {
        let token = token.into();
        if !is_valid_token(&token) {
            return Err(UrnError::InvalidType(token));
        }
        Ok(Self(token))
    }

    /// The type of the provider resource for `package`.
    pub fn provider(package: &str) -> Self {
        Self(format!("{ENGINE_PACKAGE}:{PROVIDERS_MODULE}:{package}"))
    }

    /// The package segment of the token.
    pub fn package(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }

    /// The module segment, if the token has one.
    pub fn module(&self) -> Option<&str> {
        self.0.split(':').nth(1)
    }

    /// The name segment, if the token has one.
    pub fn name(&self) -> Option<&str> {
        self.0.split(':').nth(2)
    }

    /// Whether this token names a provider resource.
    pub fn is_provider_type(&self) -> bool {
        self.package() == ENGINE_PACKAGE && self.module() == Some(PROVIDERS_MODULE)
    }

    /// For a provider type, the package the provider serves.
    pub fn provider_package(&self) -> Option<&str> {
        if self.is_provider_type() {
            self.name()
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_token(token: &str) -> bool {
    if token.contains('$') {
        return false;
    }
    let segments: Vec<&str> = token.split(':').collect();
    if segments.len() > 3 {
        return false;
    }
    // The package and name segments must be non-empty; only the module
    // segment of a three-part token may be empty.
    segments
        .iter()
        .enumerate()
        .all(|(i, segment)| (i == 1 && segments.len() == 3) || !segment.is_empty())
}

impl FromStr for Type {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Type {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Type {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Self::parse(token).map_err(de::Error::custom)
    }
}

/// A type token qualified by its ancestors: `grandparent$parent$type`.
///
/// The qualified type is what a URN embeds; it accumulates one segment per
/// ancestor component so that re-parenting a resource changes its URN.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedType(String);

impl QualifiedType {
    /// Qualify `ty` under an optional parent qualified type.
    pub fn new(parent: Option<&QualifiedType>, ty: &Type) -> Self {
        match parent {
            Some(parent) => Self(format!("{}${}", parent.0, ty.as_str())),
            None => Self(ty.as_str().to_string()),
        }
    }

    pub(crate) fn from_raw(raw: String) -> Result<Self, UrnError> {
        if raw.is_empty() || !raw.split('$').all(is_valid_token) {
            return Err(UrnError::InvalidType(raw));
        }
        Ok(Self(raw))
    }

    /// The unqualified type: the final `$`-separated segment.
    pub fn ty(&self) -> Type {
        let last = self.0.rsplit('$').next().unwrap_or(&self.0);
        Type(last.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Type> for QualifiedType {
    fn from(ty: Type) -> Self {
        Self(ty.0)
    }
}

impl fmt::Display for QualifiedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_token() {
        let ty = Type::parse("aws:s3:Bucket").unwrap();
        assert_eq!(ty.package(), "aws");
        assert_eq!(ty.module(), Some("s3"));
        assert_eq!(ty.name(), Some("Bucket"));
        assert!(!ty.is_provider_type());
    }

    #[test]
    fn parse_empty_module() {
        let ty = Type::parse("aws::Bucket").unwrap();
        assert_eq!(ty.package(), "aws");
        assert_eq!(ty.module(), Some(""));
        assert_eq!(ty.name(), Some("Bucket"));
    }

    #[test]
    fn rejects_malformed_tokens() {
        for bad in ["", "a:b:c:d", "a$b:m:n", ":m:n", "a:m:"] {
            assert!(Type::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn provider_type_round_trip() {
        let ty = Type::provider("aws");
        assert_eq!(ty.as_str(), "keel:providers:aws");
        assert!(ty.is_provider_type());
        assert_eq!(ty.provider_package(), Some("aws"));
    }

    #[test]
    fn qualified_type_accumulates_parents() {
        let comp = Type::parse("my:index:Comp").unwrap();
        let bucket = Type::parse("aws:s3:Bucket").unwrap();
        let parent = QualifiedType::new(None, &comp);
        let child = QualifiedType::new(Some(&parent), &bucket);
        assert_eq!(child.as_str(), "my:index:Comp$aws:s3:Bucket");
        assert_eq!(child.ty(), bucket);
    }
}
