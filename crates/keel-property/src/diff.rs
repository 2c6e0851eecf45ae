use std::collections::BTreeMap;

use itertools::Itertools;

use crate::value::{PropertyKey, PropertyMap, PropertyValue};

/// The structural difference between two property maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectDiff {
    /// Properties present only in the new map.
    pub adds: BTreeMap<PropertyKey, PropertyValue>,
    /// Properties present only in the old map.
    pub deletes: BTreeMap<PropertyKey, PropertyValue>,
    /// Properties present in both but unequal.
    pub updates: BTreeMap<PropertyKey, ValueDiff>,
}

/// The difference between two values of one property.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueDiff {
    pub old: PropertyValue,
    pub new: PropertyValue,
    /// Populated when both sides are objects.
    pub object: Option<Box<ObjectDiff>>,
    /// Populated when both sides are arrays.
    pub array: Option<Box<ArrayDiff>>,
}

/// The positional difference between two arrays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArrayDiff {
    /// Indices present only in the new array.
    pub adds: BTreeMap<usize, PropertyValue>,
    /// Indices present only in the old array.
    pub deletes: BTreeMap<usize, PropertyValue>,
    /// Indices present in both but unequal.
    pub updates: BTreeMap<usize, ValueDiff>,
}

impl PropertyMap {
    /// Diff this map (the old state) against `new`. `None` means the maps
    /// are semantically equal.
    pub fn diff(&self, new: &PropertyMap) -> Option<ObjectDiff> {
        let mut result = ObjectDiff::default();
        for (key, new_value) in new {
            match self.get(key) {
                None => {
                    result.adds.insert(key.clone(), new_value.clone());
                }
                Some(old_value) if !old_value.deep_equals(new_value) => {
                    result
                        .updates
                        .insert(key.clone(), ValueDiff::between(old_value, new_value));
                }
                Some(_) => {}
            }
        }
        for (key, old_value) in self {
            if !new.contains_key(key) {
                result.deletes.insert(key.clone(), old_value.clone());
            }
        }
        if result.is_empty() {
            None
        } else {
            Some(result)
        }
    }
}

impl ObjectDiff {
    pub fn is_empty(&self) -> bool {
        self.adds.is_empty() && self.deletes.is_empty() && self.updates.is_empty()
    }

    /// The sorted union of added, deleted, and updated keys.
    pub fn changed_keys(&self) -> Vec<PropertyKey> {
        self.adds
            .keys()
            .merge(self.deletes.keys())
            .merge(self.updates.keys())
            .dedup()
            .cloned()
            .collect()
    }
}

impl ValueDiff {
    /// Record the difference between two unequal values, recursing into
    /// matching containers.
    pub fn between(old: &PropertyValue, new: &PropertyValue) -> Self {
        let object = match (old.as_object(), new.as_object()) {
            (Some(old_map), Some(new_map)) => old_map.diff(new_map).map(Box::new),
            _ => None,
        };
        let array = match (old.as_array(), new.as_array()) {
            (Some(old_items), Some(new_items)) => {
                ArrayDiff::between(old_items, new_items).map(Box::new)
            }
            _ => None,
        };
        Self {
            old: old.clone(),
            new: new.clone(),
            object,
            array,
        }
    }
}

impl ArrayDiff {
    fn between(old: &[PropertyValue], new: &[PropertyValue]) -> Option<Self> {
        let mut result = ArrayDiff::default();
        for (i, (old_item, new_item)) in old.iter().zip(new).enumerate() {
            if !old_item.deep_equals(new_item) {
                result.updates.insert(i, ValueDiff::between(old_item, new_item));
            }
        }
        for (i, old_item) in old.iter().enumerate().skip(new.len()) {
            result.deletes.insert(i, old_item.clone());
        }
        for (i, new_item) in new.iter().enumerate().skip(old.len()) {
            result.adds.insert(i, new_item.clone());
        }
        if result.adds.is_empty() && result.deletes.is_empty() && result.updates.is_empty() {
            None
        } else {
            Some(result)
        }
    }
}
