use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use keel_property::{PropertyKey, PropertyMap, PropertyPath};

/// Whether a diff found changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffChanges {
    /// The inputs are semantically identical.
    None,
    /// The inputs differ.
    Some,
    /// The provider could not compute a diff; carries the reason shown to
    /// the user. The engine treats this as a change.
    Unknown(String),
}

/// The kind of change behind one entry of a detailed diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyDiffKind {
    Add,
    AddReplace,
    Delete,
    DeleteReplace,
    Update,
    UpdateReplace,
}

impl PropertyDiffKind {
    pub fn triggers_replace(self) -> bool {
        matches!(
            self,
            Self::AddReplace | Self::DeleteReplace | Self::UpdateReplace
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDiff {
    pub kind: PropertyDiffKind,
    /// Whether the change only affects the input, not the live state.
    pub input_diff: bool,
}

/// The provider's verdict on a proposed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffResult {
    pub changes: DiffChanges,
    /// Keys whose change forces a replacement rather than an update.
    pub replace_keys: Vec<PropertyKey>,
    /// Keys the provider guarantees will not change on update.
    pub stable_keys: Vec<PropertyKey>,
    /// Keys that changed.
    pub changed_keys: Vec<PropertyKey>,
    /// The provider requires the old resource to be deleted before the
    /// replacement is created.
    pub delete_before_replace: bool,
    /// Per-path detail, when the provider reports it.
    pub detailed_diff: BTreeMap<String, PropertyDiff>,
}

impl DiffResult {
    pub fn none() -> Self {
        Self {
            changes: DiffChanges::None,
            replace_keys: Vec::new(),
            stable_keys: Vec::new(),
            changed_keys: Vec::new(),
            delete_before_replace: false,
            detailed_diff: BTreeMap::new(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            changes: DiffChanges::Unknown(reason.into()),
            ..Self::none()
        }
    }

    /// The structural fallback diff: compare the maps property by property
    /// after rewriting ignored paths, reporting every changed top-level key.
    pub fn from_maps(
        old: &PropertyMap,
        new: &PropertyMap,
        ignore_changes: &[PropertyPath],
    ) -> Result<Self, keel_property::PropertyError> {
        let new = keel_property::apply_ignore_changes(old, new, ignore_changes)?;
        match old.diff(&new) {
            None => Ok(Self::none()),
            Some(diff) => Ok(Self {
                changes: DiffChanges::Some,
                changed_keys: diff.changed_keys(),
                ..Self::none()
            }),
        }
    }

    pub fn has_changes(&self) -> bool {
        !matches!(self.changes, DiffChanges::None)
    }

    pub fn requires_replacement(&self) -> bool {
        !self.replace_keys.is_empty()
            || self
                .detailed_diff
                .values()
                .any(|diff| diff.kind.triggers_replace())
    }
}

#[cfg(test)]
mod tests {
    use keel_property::PropertyValue;

    use super::*;

    fn map(entries: &[(&str, &str)]) -> PropertyMap {
        entries
            .iter()
            .map(|(k, v)| (PropertyKey::from(*k), PropertyValue::from(*v)))
            .collect()
    }

    #[test]
    fn from_maps_reports_changed_keys() {
        let old = map(&[("a", "1"), ("b", "2")]);
        let new = map(&[("a", "1"), ("b", "3"), ("c", "4")]);
        let diff = DiffResult::from_maps(&old, &new, &[]).unwrap();
        assert_eq!(diff.changes, DiffChanges::Some);
        assert_eq!(diff.changed_keys, vec!["b".into(), "c".into()]);
        assert!(!diff.requires_replacement());
    }

    #[test]
    fn from_maps_respects_ignored_paths() {
        let old = map(&[("a", "1")]);
        let new = map(&[("a", "2")]);
        let paths = vec!["a".parse().unwrap()];
        let diff = DiffResult::from_maps(&old, &new, &paths).unwrap();
        assert_eq!(diff.changes, DiffChanges::None);
    }

    #[test]
    fn detailed_replace_kinds_force_replacement() {
        let mut diff = DiffResult::none();
        diff.changes = DiffChanges::Some;
        diff.detailed_diff.insert(
            "size".to_string(),
            PropertyDiff {
                kind: PropertyDiffKind::UpdateReplace,
                input_diff: false,
            },
        );
        assert!(diff.requires_replacement());
    }
}
