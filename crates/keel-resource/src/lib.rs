//! Resource states, registration goals, and snapshots.
//!
//! ## Entities
//!
//! * [`ResourceState`]: one persisted resource, its identity, its last
//!   submitted inputs, the outputs its provider returned, and the graph
//!   edges (parent, dependencies, provider) that order it relative to the
//!   rest of the stack. States are immutable once built; the engine shares
//!   them as `Arc<ResourceState>` and models mutation by constructing a
//!   successor state.
//! * [`Goal`]: the desired state assembled from one program registration,
//!   consumed by the step generator.
//! * [`Snapshot`]: the durable record of a stack, a manifest, the ordered
//!   resource list, and the operations that were in flight at the last
//!   persist.
//!
//! ## Integrity
//!
//! [`Snapshot::verify_integrity`] enforces the structural invariants every
//! non-corrupt snapshot satisfies: dependencies and providers precede their
//! dependents, at most one live state per URN, and at most one
//! pending-replacement tombstone per URN.

pub use crate::goal::{Goal, PackageDescriptor, Parameterization};
pub use crate::provider_ref::{ProviderId, ProviderReference};
pub use crate::snapshot::{
    Manifest, OperationKind, PendingOperation, PluginInfo, SecretsConfig, Snapshot,
};
pub use crate::state::{CustomTimeouts, ResourceId, ResourceState};

mod goal;
mod provider_ref;
mod snapshot;
mod state;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("resource `{urn}` depends on `{dependency}`, which does not precede it")]
    DanglingDependency {
        urn: keel_urn::Urn,
        dependency: keel_urn::Urn,
    },

    #[error("resource `{urn}` refers to provider `{provider}`, which does not precede it")]
    DanglingProvider {
        urn: keel_urn::Urn,
        provider: keel_urn::Urn,
    },

    #[error("resource `{urn}` refers to parent `{parent}`, which does not precede it")]
    DanglingParent {
        urn: keel_urn::Urn,
        parent: keel_urn::Urn,
    },

    #[error("two live resources share the URN `{0}`")]
    DuplicateUrn(keel_urn::Urn),

    #[error("multiple pending replacements for `{0}`")]
    MultiplePendingReplacements(keel_urn::Urn),

    #[error("invalid provider reference `{0}`")]
    InvalidProviderReference(String),
}
