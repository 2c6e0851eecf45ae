use std::collections::BTreeMap;

use tokio::sync::oneshot;

use keel_property::{PropertyKey, PropertyMap};
use keel_resource::{CustomTimeouts, PackageDescriptor, ResourceId};
use keel_urn::Urn;

/// What the engine tells the program once a registered resource's step has
/// completed.
#[derive(Debug, Clone)]
pub struct RegistrationResponse {
    pub urn: Urn,
    pub id: Option<ResourceId>,
    pub outputs: PropertyMap,
}

/// A request to register one resource.
///
/// Type token, provider reference, and ignore-changes paths arrive as raw
/// strings from the language host; the step generator validates them.
#[derive(Debug)]
pub struct RegistrationRequest {
    pub ty: String,
    pub name: String,
    pub custom: bool,
    pub parent: Option<Urn>,
    pub protect: bool,
    pub dependencies: Vec<Urn>,
    pub property_dependencies: BTreeMap<PropertyKey, Vec<Urn>>,
    /// An explicit `<urn>::<id>` provider reference.
    pub provider: Option<String>,
    pub inputs: PropertyMap,
    /// Plugin version/download/parameterization hints for default-provider
    /// selection. `package` is ignored; the type token decides it.
    pub version: Option<String>,
    pub download_url: Option<url::Url>,
    pub checksums: BTreeMap<String, String>,
    pub parameterization: Option<keel_resource::Parameterization>,
    pub import_id: Option<ResourceId>,
    pub ignore_changes: Vec<String>,
    pub aliases: Vec<Urn>,
    pub custom_timeouts: Option<CustomTimeouts>,
    pub delete_before_replace: Option<bool>,
    /// Answered when the step completes; dropped responses are ignored.
    pub done: Option<oneshot::Sender<RegistrationResponse>>,
}

impl RegistrationRequest {
    pub fn new(ty: impl Into<String>, name: impl Into<String>, custom: bool) -> Self {
        Self {
            ty: ty.into(),
            name: name.into(),
            custom,
            parent: None,
            protect: false,
            dependencies: Vec::new(),
            property_dependencies: BTreeMap::new(),
            provider: None,
            inputs: PropertyMap::new(),
            version: None,
            download_url: None,
            checksums: BTreeMap::new(),
            parameterization: None,
            import_id: None,
            ignore_changes: Vec::new(),
            aliases: Vec::new(),
            custom_timeouts: None,
            delete_before_replace: None,
            done: None,
        }
    }

    /// The plugin request this registration implies, given its parsed type.
    pub fn package_descriptor(&self, package: &str) -> PackageDescriptor {
        PackageDescriptor {
            package: package.to_string(),
            version: self.version.clone(),
            download_url: self.download_url.clone(),
            checksums: self.checksums.clone(),
            parameterization: self.parameterization.clone(),
        }
    }
}

/// A request to read (not manage) an existing resource.
#[derive(Debug)]
pub struct ReadRequest {
    pub ty: String,
    pub name: String,
    pub parent: Option<Urn>,
    pub provider: Option<String>,
    pub id: ResourceId,
    pub inputs: PropertyMap,
    pub dependencies: Vec<Urn>,
    pub version: Option<String>,
    pub done: Option<oneshot::Sender<RegistrationResponse>>,
}

/// A program reporting the outputs of an already-registered resource;
/// components report theirs after all children have registered.
#[derive(Debug)]
pub struct OutputsRequest {
    pub urn: Urn,
    pub outputs: PropertyMap,
}

/// One event from the program.
#[derive(Debug)]
pub enum SourceEvent {
    RegisterResource(RegistrationRequest),
    ReadResource(ReadRequest),
    RegisterOutputs(OutputsRequest),
}
