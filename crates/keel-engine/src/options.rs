use rustc_hash::FxHashSet;

use keel_urn::Urn;

/// What kind of deployment to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Drive the infrastructure to the program's desired state.
    Update,
    /// Compute the same steps as an update without mutating anything.
    Preview,
    /// Reconcile the snapshot with the providers' view of reality.
    Refresh,
    /// Tear the stack down.
    Destroy,
}

impl DeploymentMode {
    /// Whether provider mutations are suppressed.
    pub fn dry_run(self) -> bool {
        matches!(self, Self::Preview)
    }
}

/// Knobs for one deployment.
#[derive(Debug, Clone)]
pub struct DeploymentOptions {
    pub mode: DeploymentMode,
    pub stack: String,
    pub project: String,
    /// Maximum concurrently-executing steps. 1 means strictly serial.
    pub parallel: usize,
    /// Keep executing independent steps after a step fails.
    pub continue_on_error: bool,
    /// Restrict refresh to these URNs; everything else is carried forward
    /// without a provider round-trip.
    pub refresh_targets: Option<FxHashSet<Urn>>,
}

impl DeploymentOptions {
    pub fn new(mode: DeploymentMode, stack: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            mode,
            stack: stack.into(),
            project: project.into(),
            parallel: 1,
            continue_on_error: false,
            refresh_targets: None,
        }
    }

    #[must_use]
    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    #[must_use]
    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    #[must_use]
    pub fn refresh_targets(mut self, targets: impl IntoIterator<Item = Urn>) -> Self {
        self.refresh_targets = Some(targets.into_iter().collect());
        self
    }
}
