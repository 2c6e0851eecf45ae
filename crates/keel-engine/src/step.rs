use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use keel_property::PropertyKey;
use keel_provider::PropertyDiff;
use keel_resource::{ProviderReference, ResourceState};
use keel_source::RegistrationResponse;
use keel_urn::Urn;

/// The operation a step performs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum StepOp {
    /// Nothing changed; the state is carried forward.
    Same,
    Create,
    /// Create the incoming half of a replacement.
    CreateReplacement,
    Update,
    /// The logical pivot of a replacement; performs no provider call.
    Replace,
    Delete,
    /// Delete the outgoing half of a replacement.
    DeleteReplaced,
    /// Read an external resource.
    Read,
    /// Re-read an external resource whose ID changed.
    ReadReplacement,
    /// Drop a previously-read external resource.
    ReadDiscard,
    /// Drop the outgoing half of a read replacement.
    DiscardReplaced,
    /// Adopt an existing resource under management.
    Import,
    ImportReplacement,
    /// Clear a pending-replacement tombstone the program no longer wants.
    RemovePendingReplace,
    /// Reconcile a state with the provider's view; the inner result
    /// (same/update/delete) is decided by what the read returns.
    Refresh,
}

impl StepOp {
    /// Whether this step retires its old state without producing a new one.
    pub fn is_deletion(self) -> bool {
        matches!(
            self,
            Self::Delete
                | Self::DeleteReplaced
                | Self::ReadDiscard
                | Self::DiscardReplaced
                | Self::RemovePendingReplace
        )
    }
}

impl fmt::Display for StepOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Same => "same",
            Self::Create => "create",
            Self::CreateReplacement => "create-replacement",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::DeleteReplaced => "delete-replaced",
            Self::Read => "read",
            Self::ReadReplacement => "read-replacement",
            Self::ReadDiscard => "read-discard",
            Self::DiscardReplaced => "discard-replaced",
            Self::Import => "import",
            Self::ImportReplacement => "import-replacement",
            Self::RemovePendingReplace => "remove-pending-replace",
            Self::Refresh => "refresh",
        };
        f.write_str(s)
    }
}

/// One generator-issued action on one resource.
#[derive(Debug, Clone)]
pub struct Step {
    pub op: StepOp,
    pub urn: Urn,
    /// The prior state, for steps that have one.
    pub old: Option<Arc<ResourceState>>,
    /// The desired state, for steps that produce one.
    pub new: Option<Arc<ResourceState>>,
    /// The provider that executes this step's lifecycle call, when any.
    pub provider: Option<ProviderReference>,
    /// For a delete-before-replace deletion: the retired state lingers in
    /// the snapshot as a pending-replacement tombstone until the matching
    /// create lands, so a crash between the two is recoverable.
    pub pending_replace: bool,
    /// The keys that forced a replacement.
    pub replace_keys: Vec<PropertyKey>,
    /// The keys the diff reported changed.
    pub diff_keys: Vec<PropertyKey>,
    pub detailed_diff: BTreeMap<String, PropertyDiff>,
}

impl Step {
    pub fn new(op: StepOp, urn: Urn) -> Self {
        Self {
            op,
            urn,
            old: None,
            new: None,
            provider: None,
            pending_replace: false,
            replace_keys: Vec::new(),
            diff_keys: Vec::new(),
            detailed_diff: BTreeMap::new(),
        }
    }

    pub fn with_old(mut self, old: Arc<ResourceState>) -> Self {
        self.old = Some(old);
        self
    }

    pub fn with_new(mut self, new: Arc<ResourceState>) -> Self {
        self.new = Some(new);
        self
    }

    pub fn with_provider(mut self, provider: Option<ProviderReference>) -> Self {
        self.provider = provider;
        self
    }

    /// Whether this step acts on a provider resource (and therefore
    /// executes through the registry rather than a plugin).
    pub fn is_provider_step(&self) -> bool {
        self.urn.ty().is_provider_type()
    }
}

/// A sequence of steps that must execute serially, in order, as one
/// schedulable unit. Most chains hold a single step; replacements hold the
/// delete/create sequence the generator decided on.
#[derive(Debug)]
pub struct StepChain {
    pub steps: Vec<Step>,
    /// Answered with the final step's result, when a program is waiting on
    /// this registration.
    pub done: Option<oneshot::Sender<RegistrationResponse>>,
}

impl StepChain {
    pub fn single(step: Step) -> Self {
        Self {
            steps: vec![step],
            done: None,
        }
    }

    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps, done: None }
    }

    /// The URN whose registration this chain answers: the last step's.
    pub fn acting_urn(&self) -> &Urn {
        &self.steps.last().expect("chains are non-empty").urn
    }
}
