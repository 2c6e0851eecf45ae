//! The deployment engine.
//!
//! Given a prior [`Snapshot`](keel_resource::Snapshot), a
//! [`Source`](keel_source::Source) of resource registrations, and a
//! [`ProviderHost`](keel_provider::ProviderHost), the engine computes and
//! executes the minimum set of changes that drives live infrastructure to
//! the desired state, durably journaling every mutation along the way.
//!
//! The moving parts, in dependency order:
//!
//! * the **step generator** turns each registration plus the prior state
//!   into one or more [`Step`]s (same, create, update, replace pair, read,
//!   import);
//! * the **step executor** schedules steps onto a pool of `parallel`
//!   workers while honoring dependency, provider, and same-URN ordering;
//! * the **snapshot journal** ([`Journal`]) records begin/end/outputs
//!   entries on an append-only log, persists the reconstructed snapshot
//!   after every entry, and yields the post-deployment snapshot;
//! * the **deployment driver** ([`Deployment`]) wires the above together
//!   with the provider registry, the refresh and destroy planners, the
//!   cancellation tree, and the engine event stream.

pub use crate::driver::{Deployment, DeploymentResult, Outcome, SecretsDecrypter};
pub use crate::events::{DiagSeverity, EngineEvent, EventSink, StepOpCounts};
pub use crate::journal::Journal;
pub use crate::manager::{
    CombinedManager, Mutation, RoutingManager, SnapshotManager, StepOutcome,
};
pub use crate::options::{DeploymentMode, DeploymentOptions};
pub use crate::persist::{FilePersister, InMemoryPersister, SnapshotPersister};
pub use crate::step::{Step, StepChain, StepOp};

mod destroy;
mod driver;
mod events;
mod executor;
mod generator;
mod graph;
mod journal;
mod manager;
mod options;
mod persist;
mod refresh;
mod step;

use keel_provider::CheckFailure;
use keel_urn::Urn;

/// A failure to persist or record a journal entry. Any of these marks the
/// deployment corrupt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JournalError {
    #[error("failed to persist snapshot: {0}")]
    Persist(String),

    #[error("the journal has been closed")]
    Closed,

    #[error("snapshot integrity violated: {0}")]
    Integrity(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    ProviderUnavailable(keel_registry::RegistryError),

    #[error("provider error on `{urn}`: {source}")]
    Provider {
        urn: Urn,
        #[source]
        source: keel_provider::ProviderError,
    },

    #[error("check of `{urn}` failed with {} failure(s)", .failures.len())]
    CheckFailed { urn: Urn, failures: Vec<CheckFailure> },

    #[error("`{urn}` did not initialize cleanly")]
    PartialFailure { urn: Urn, init_errors: Vec<String> },

    #[error("operation on `{urn}` timed out")]
    Timeout { urn: Urn },

    #[error("`{0}` is protected and cannot be deleted or replaced")]
    ProtectedResource(Urn),

    #[error("the deployment was cancelled")]
    Cancelled,

    #[error("the previous deployment left {0} operation(s) pending; refresh the stack before updating")]
    PendingOperations(usize),

    #[error("failed to decrypt configuration: {0}")]
    DecryptFailed(String),

    #[error("the deployment is corrupt: {0}")]
    Corrupt(#[from] JournalError),

    #[error(transparent)]
    Snapshot(#[from] keel_resource::SnapshotError),

    #[error(transparent)]
    Source(#[from] keel_source::SourceError),
}

impl EngineError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}
