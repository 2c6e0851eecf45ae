use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use keel_property::{PropertyKey, PropertyMap, PropertyPath};
use keel_urn::{Type, Urn};

use crate::provider_ref::ProviderReference;
use crate::state::{CustomTimeouts, ResourceId};

/// A provider package request: which plugin to load and how.
///
/// The descriptor participates in default-provider identity: distinct
/// versions (or download URLs, or parameterizations) of the same package
/// yield distinct default providers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub package: String,
    pub version: Option<String>,
    pub download_url: Option<Url>,
    /// Per-platform archive checksums, hex-encoded.
    pub checksums: BTreeMap<String, String>,
    pub parameterization: Option<Parameterization>,
}

impl PackageDescriptor {
    pub fn package(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            ..Self::default()
        }
    }
}

/// A sub-package parameterization of a base plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameterization {
    pub name: String,
    pub version: String,
    pub value: Vec<u8>,
}

/// The desired state of one resource, assembled from a program
/// registration. This is what the step generator consumes.
#[derive(Debug, Clone)]
pub struct Goal {
    pub ty: Type,
    pub name: String,
    pub custom: bool,
    pub parent: Option<Urn>,
    pub protect: bool,
    pub dependencies: Vec<Urn>,
    pub property_dependencies: BTreeMap<PropertyKey, Vec<Urn>>,
    /// An explicit provider, when the program supplied one.
    pub provider: Option<ProviderReference>,
    /// The plugin request used when no explicit provider was supplied.
    pub package: PackageDescriptor,
    pub inputs: PropertyMap,
    pub ignore_changes: Vec<PropertyPath>,
    pub aliases: Vec<Urn>,
    pub import_id: Option<ResourceId>,
    pub custom_timeouts: Option<CustomTimeouts>,
    /// A program-level override of the provider's replacement style.
    pub delete_before_replace: Option<bool>,
}

impl Goal {
    pub fn new(ty: Type, name: impl Into<String>, custom: bool) -> Self {
        let package = PackageDescriptor::package(ty.package());
        Self {
            ty,
            name: name.into(),
            custom,
            parent: None,
            protect: false,
            dependencies: Vec::new(),
            property_dependencies: BTreeMap::new(),
            provider: None,
            package,
            inputs: PropertyMap::new(),
            ignore_changes: Vec::new(),
            aliases: Vec::new(),
            import_id: None,
            custom_timeouts: None,
            delete_before_replace: None,
        }
    }
}
