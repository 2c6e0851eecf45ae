//! Property values and the diff primitives built on them.
//!
//! ## Value model
//!
//! A resource's inputs and outputs are [`PropertyMap`]s: ordered maps from
//! [`PropertyKey`] to [`PropertyValue`]. Values are JSON-shaped (null, bool,
//! number, string, array, object) extended with the engine-specific
//! variants:
//! * [`PropertyValue::Asset`] / [`PropertyValue::Archive`]: file-like
//!   content addressed by hash;
//! * [`PropertyValue::Secret`]: a value that must stay encrypted at rest;
//! * [`PropertyValue::Computed`]: a value unknown until the provider runs
//!   (previews see these in place of provider-assigned outputs);
//! * [`PropertyValue::Output`]: a value carrying known-ness, secret-ness,
//!   and the URNs it was derived from;
//! * [`PropertyValue::ResourceReference`]: a pointer to another resource.
//!
//! ## Diffs
//!
//! [`diff`](PropertyMap::diff) compares two maps structurally and produces
//! an [`ObjectDiff`] of adds, deletes, and updates, recursing into nested
//! objects ([`ObjectDiff`]) and arrays ([`ArrayDiff`]). `Computed` values
//! never compare equal to anything, including themselves: an unknown is a
//! change until proven otherwise.
//!
//! ## Paths
//!
//! [`PropertyPath`] addresses a value inside a map (`a.b[3].c`, with quoted
//! `["dotted.key"]` segments) and powers the ignore-changes rewriting the
//! step generator applies before asking a provider to diff.

pub use crate::asset::{Archive, ArchiveContents, Asset, AssetContents};
pub use crate::diff::{ArrayDiff, ObjectDiff, ValueDiff};
pub use crate::path::{apply_ignore_changes, PathSegment, PropertyPath};
pub use crate::value::{OutputValue, PropertyKey, PropertyMap, PropertyValue, ResourceReference};

mod asset;
mod diff;
mod path;
mod value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropertyError {
    #[error("invalid property path `{0}`")]
    InvalidPath(String),

    #[error("property path `{path}` cannot be applied: {reason}")]
    PathNotApplicable { path: String, reason: String },
}
