use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use keel_property::{PropertyKey, PropertyMap};
use keel_urn::{Type, Urn};

use crate::provider_ref::ProviderReference;

/// A provider-assigned resource ID.
///
/// IDs are opaque to the engine; they identify a resource to its provider
/// and may change when a refresh discovers that the live resource was
/// recreated out-of-band.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The placeholder ID previews use for resources that do not exist yet.
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

impl From<&str> for ResourceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-operation timeout overrides, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomTimeouts {
    pub create: Option<f64>,
    pub update: Option<f64>,
    pub delete: Option<f64>,
}

impl CustomTimeouts {
    pub fn create_timeout(&self) -> Option<Duration> {
        self.create.map(Duration::from_secs_f64)
    }

    pub fn update_timeout(&self) -> Option<Duration> {
        self.update.map(Duration::from_secs_f64)
    }

    pub fn delete_timeout(&self) -> Option<Duration> {
        self.delete.map(Duration::from_secs_f64)
    }
}

/// One persisted resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub urn: Urn,
    /// The provider-assigned ID; `None` until the resource has been created,
    /// and always `None` for component resources.
    pub id: Option<ResourceId>,
    #[serde(rename = "type")]
    pub ty: Type,
    /// `true` for provider-managed resources; `false` for components.
    pub custom: bool,
    /// The inputs the program last submitted (post-check).
    pub inputs: PropertyMap,
    /// The outputs the provider last returned.
    pub outputs: PropertyMap,
    /// The provider that manages this resource, for custom resources.
    pub provider: Option<ProviderReference>,
    pub parent: Option<Urn>,
    pub dependencies: Vec<Urn>,
    pub property_dependencies: BTreeMap<PropertyKey, Vec<Urn>>,
    /// Protected resources refuse deletion and replacement.
    pub protect: bool,
    /// Read-only resources observed with `read` rather than managed.
    pub external: bool,
    /// Marks the outgoing half of a replacement awaiting deletion.
    pub delete: bool,
    /// Set when a delete-before-replace deleted the old resource but the
    /// deployment ended before the replacement was created.
    pub pending_replacement: bool,
    /// Initialization errors reported by a partial provider failure.
    pub init_errors: Vec<String>,
    pub aliases: Vec<Urn>,
    pub custom_timeouts: Option<CustomTimeouts>,
    pub import_id: Option<ResourceId>,
    /// Property paths the program asked the engine to hold constant.
    pub ignore_changes: Vec<String>,
}

impl ResourceState {
    /// A minimal state; callers fill in the rest via struct update.
    pub fn new(urn: Urn, ty: Type, custom: bool) -> Self {
        Self {
            urn,
            id: None,
            ty,
            custom,
            inputs: PropertyMap::new(),
            outputs: PropertyMap::new(),
            provider: None,
            parent: None,
            dependencies: Vec::new(),
            property_dependencies: BTreeMap::new(),
            protect: false,
            external: false,
            delete: false,
            pending_replacement: false,
            init_errors: Vec::new(),
            aliases: Vec::new(),
            custom_timeouts: None,
            import_id: None,
            ignore_changes: Vec::new(),
        }
    }

    /// Whether this state names a provider resource.
    pub fn is_provider(&self) -> bool {
        self.ty.is_provider_type()
    }

    /// Every URN this state depends on: dependencies, per-property
    /// dependencies, the parent, and the provider. Deduplicated, in
    /// first-appearance order.
    pub fn all_dependencies(&self) -> Vec<Urn> {
        let mut seen = rustc_hash::FxHashSet::default();
        let mut all = Vec::new();
        let mut push = |urn: &Urn| {
            if seen.insert(urn.clone()) {
                all.push(urn.clone());
            }
        };
        if let Some(provider) = &self.provider {
            push(&provider.urn);
        }
        if let Some(parent) = &self.parent {
            push(parent);
        }
        for urn in &self.dependencies {
            push(urn);
        }
        for urns in self.property_dependencies.values() {
            for urn in urns {
                push(urn);
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urn(name: &str) -> Urn {
        Urn::new("dev", "proj", None, &Type::parse("pkg:m:T").unwrap(), name)
    }

    #[test]
    fn all_dependencies_dedups_in_order() {
        let mut state = ResourceState::new(urn("res"), Type::parse("pkg:m:T").unwrap(), true);
        state.parent = Some(urn("parent"));
        state.dependencies = vec![urn("a"), urn("parent")];
        state
            .property_dependencies
            .insert("prop".into(), vec![urn("b"), urn("a")]);
        assert_eq!(
            state.all_dependencies(),
            vec![urn("parent"), urn("a"), urn("b")]
        );
    }

    #[test]
    fn custom_timeouts_convert_to_durations() {
        let timeouts = CustomTimeouts {
            create: Some(1.5),
            update: None,
            delete: Some(60.0),
        };
        assert_eq!(timeouts.create_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(timeouts.update_timeout(), None);
        assert_eq!(timeouts.delete_timeout(), Some(Duration::from_secs(60)));
    }
}
