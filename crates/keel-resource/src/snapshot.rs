use std::fmt;
use std::sync::Arc;

use jiff::Timestamp;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use keel_urn::Urn;

use crate::state::ResourceState;
use crate::SnapshotError;

/// Metadata stamped on every persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// When the deployment that produced this snapshot started.
    pub time: Timestamp,
    /// The engine version that produced it.
    pub version: String,
    /// The plugins the deployment loaded.
    pub plugins: Vec<PluginInfo>,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            time: Timestamp::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            plugins: Vec::new(),
        }
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: Option<String>,
}

/// Opaque secrets-provider configuration carried through the snapshot. The
/// engine checks that it can be handed to a decrypter before any step runs
/// but never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub state: serde_json::Value,
}

/// The kind of mutation a pending operation was performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Creating,
    Updating,
    Deleting,
    Reading,
    Importing,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Reading => "reading",
            Self::Importing => "importing",
        };
        f.write_str(s)
    }
}

/// A mutation that was begun but not ended at the moment of the last
/// persist. A non-empty set on startup means a previous run crashed or was
/// cancelled mid-mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub resource: Arc<ResourceState>,
    pub kind: OperationKind,
}

/// A persistable set of resource states plus pending operations plus
/// manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub manifest: Manifest,
    pub secrets: Option<SecretsConfig>,
    /// Live states in dependency order, possibly interleaved with
    /// pending-delete tombstones.
    pub resources: Vec<Arc<ResourceState>>,
    pub pending_operations: Vec<PendingOperation>,
}

impl Snapshot {
    pub fn new(resources: Vec<Arc<ResourceState>>) -> Self {
        Self {
            manifest: Manifest::new(),
            secrets: None,
            resources,
            pending_operations: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// URN → position, for live (non-pending-delete) states only.
    pub fn resource_index(&self) -> FxHashMap<Urn, usize> {
        self.resources
            .iter()
            .enumerate()
            .filter(|(_, state)| !state.delete)
            .map(|(at, state)| (state.urn.clone(), at))
            .collect()
    }

    /// Check the structural invariants of a well-formed snapshot.
    pub fn verify_integrity(&self) -> Result<(), SnapshotError> {
        let mut live: FxHashSet<&Urn> = FxHashSet::default();
        let mut pending_replacements: FxHashSet<&Urn> = FxHashSet::default();
        for state in &self.resources {
            if state.delete {
                if state.pending_replacement && !pending_replacements.insert(&state.urn) {
                    return Err(SnapshotError::MultiplePendingReplacements(state.urn.clone()));
                }
                continue;
            }
            if let Some(provider) = &state.provider {
                if !live.contains(&provider.urn) {
                    return Err(SnapshotError::DanglingProvider {
                        urn: state.urn.clone(),
                        provider: provider.urn.clone(),
                    });
                }
            }
            if let Some(parent) = &state.parent {
                if !live.contains(parent) {
                    return Err(SnapshotError::DanglingParent {
                        urn: state.urn.clone(),
                        parent: parent.clone(),
                    });
                }
            }
            for dependency in state
                .dependencies
                .iter()
                .chain(state.property_dependencies.values().flatten())
            {
                if !live.contains(dependency) {
                    return Err(SnapshotError::DanglingDependency {
                        urn: state.urn.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
            if !live.insert(&state.urn) {
                return Err(SnapshotError::DuplicateUrn(state.urn.clone()));
            }
        }
        Ok(())
    }
}
