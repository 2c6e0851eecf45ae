use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use keel_urn::Urn;

use crate::asset::{Archive, Asset};

/// A property name. Ordered lexically so that map iteration, and therefore
/// every diff and every serialized snapshot, is deterministic.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PropertyKey(String);

impl PropertyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PropertyKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ordered map of properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyMap(BTreeMap<PropertyKey, PropertyValue>);

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any value in the map is computed (deeply).
    pub fn contains_unknowns(&self) -> bool {
        self.0.values().any(PropertyValue::is_computed)
    }

    /// Whether any value in the map is secret (deeply).
    pub fn contains_secrets(&self) -> bool {
        self.0.values().any(PropertyValue::contains_secrets)
    }
}

impl Deref for PropertyMap {
    type Target = BTreeMap<PropertyKey, PropertyValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PropertyMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<(PropertyKey, PropertyValue)> for PropertyMap {
    fn from_iter<I: IntoIterator<Item = (PropertyKey, PropertyValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for PropertyMap {
    type Item = (PropertyKey, PropertyValue);
    type IntoIter = std::collections::btree_map::IntoIter<PropertyKey, PropertyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a PropertyMap {
    type Item = (&'a PropertyKey, &'a PropertyValue);
    type IntoIter = std::collections::btree_map::Iter<'a, PropertyKey, PropertyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A value carrying known-ness and secret-ness, as produced by language
/// SDKs that track data flow between resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    /// The element, when known. `None` during previews of values that a
    /// provider has yet to compute.
    pub value: Option<Box<PropertyValue>>,
    /// Whether the element must be treated as secret.
    pub secret: bool,
    /// The resources this value was derived from.
    pub dependencies: Vec<Urn>,
}

/// A pointer to another resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReference {
    pub urn: Urn,
    /// The referenced resource's ID; `None` for component resources.
    pub id: Option<Box<PropertyValue>>,
    pub package_version: Option<String>,
}

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<PropertyValue>),
    Object(PropertyMap),
    Asset(Asset),
    Archive(Archive),
    /// A value that must remain encrypted in any persisted form.
    Secret(Box<PropertyValue>),
    /// A value unknown until the provider produces it.
    Computed,
    Output(OutputValue),
    ResourceReference(ResourceReference),
}

impl PropertyValue {
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn number(n: impl Into<f64>) -> Self {
        Self::Number(n.into())
    }

    pub fn secret(value: PropertyValue) -> Self {
        Self::Secret(Box::new(value))
    }

    /// Whether this value is (or contains) an unknown.
    pub fn is_computed(&self) -> bool {
        match self {
            Self::Computed => true,
            Self::Output(output) => match &output.value {
                None => true,
                Some(value) => value.is_computed(),
            },
            Self::Secret(inner) => inner.is_computed(),
            Self::Array(items) => items.iter().any(Self::is_computed),
            Self::Object(map) => map.contains_unknowns(),
            _ => false,
        }
    }

    /// Whether this value is (or contains) a secret.
    pub fn contains_secrets(&self) -> bool {
        match self {
            Self::Secret(_) => true,
            Self::Output(output) => {
                output.secret
                    || output
                        .value
                        .as_ref()
                        .is_some_and(|value| value.contains_secrets())
            }
            Self::Array(items) => items.iter().any(Self::contains_secrets),
            Self::Object(map) => map.contains_secrets(),
            _ => false,
        }
    }

    /// Strip `Secret` and known `Output` wrappers, exposing the plain
    /// element. `None` when the value bottoms out in an unknown.
    fn as_plain(&self) -> Option<&PropertyValue> {
        match self {
            Self::Secret(inner) => inner.as_plain(),
            Self::Output(output) => output.value.as_ref().and_then(|value| value.as_plain()),
            Self::Computed => None,
            other => Some(other),
        }
    }

    /// The object behind any wrappers, if this is an object.
    pub(crate) fn as_object(&self) -> Option<&PropertyMap> {
        match self.as_plain()? {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// The array behind any wrappers, if this is an array.
    pub(crate) fn as_array(&self) -> Option<&[PropertyValue]> {
        match self.as_plain()? {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Structural equality for diffing purposes: wrappers are transparent,
    /// assets compare by hash, and unknowns never compare equal.
    pub fn deep_equals(&self, other: &PropertyValue) -> bool {
        let (Some(a), Some(b)) = (self.as_plain(), other.as_plain()) else {
            return false;
        };
        match (a, b) {
            (Self::Array(xs), Self::Array(ys)) => {
                xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| x.deep_equals(y))
            }
            (Self::Object(xm), Self::Object(ym)) => {
                xm.len() == ym.len()
                    && xm
                        .iter()
                        .all(|(k, x)| ym.get(k).is_some_and(|y| x.deep_equals(y)))
            }
            (Self::Asset(x), Self::Asset(y)) => x.equivalent(y),
            (Self::Archive(x), Self::Archive(y)) => x.equivalent(y),
            _ => a == b,
        }
    }
}

impl Default for PropertyValue {
    fn default() -> Self {
        Self::Null
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, PropertyValue)]) -> PropertyMap {
        entries
            .iter()
            .map(|(k, v)| (PropertyKey::from(*k), v.clone()))
            .collect()
    }

    #[test]
    fn computed_is_deep() {
        let value = PropertyValue::Object(map(&[(
            "nested",
            PropertyValue::Array(vec![PropertyValue::Computed]),
        )]));
        assert!(value.is_computed());
        assert!(!PropertyValue::from("plain").is_computed());
    }

    #[test]
    fn unknown_output_is_computed() {
        let value = PropertyValue::Output(OutputValue {
            value: None,
            secret: false,
            dependencies: vec![],
        });
        assert!(value.is_computed());
    }

    #[test]
    fn secrets_are_deep() {
        let value = PropertyValue::Array(vec![PropertyValue::secret(PropertyValue::from("x"))]);
        assert!(value.contains_secrets());
        assert!(!PropertyValue::from("x").contains_secrets());
    }

    #[test]
    fn deep_equals_ignores_secret_wrapper() {
        let plain = PropertyValue::from("hunter2");
        let secret = PropertyValue::secret(plain.clone());
        assert!(plain.deep_equals(&secret));
        assert_ne!(plain, secret);
    }

    #[test]
    fn computed_never_equals_itself() {
        assert!(!PropertyValue::Computed.deep_equals(&PropertyValue::Computed));
    }

    #[test]
    fn values_round_trip_through_serde() {
        let value = PropertyValue::Object(map(&[
            ("plain", PropertyValue::from("text")),
            ("hidden", PropertyValue::secret(PropertyValue::number(7.0))),
            ("pending", PropertyValue::Computed),
            (
                "nested",
                PropertyValue::Array(vec![PropertyValue::Bool(true), PropertyValue::Null]),
            ),
        ]));
        let json = serde_json::to_string(&value).unwrap();
        let back: PropertyValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
