use std::sync::Arc;

use keel_resource::Snapshot;

use crate::step::{Step, StepChain, StepOp};
use crate::EngineError;

/// Plan a destroy: walk the prior snapshot in reverse dependency order and
/// delete everything. External observations are discarded rather than
/// deleted, pending-delete tombstones complete their deletion, and
/// providers (which every dependent precedes in reverse order) go last.
///
/// A protected resource fails the deployment here, before any step
/// executes.
pub(crate) fn plan(prior: &Snapshot) -> Result<Vec<StepChain>, EngineError> {
    for state in &prior.resources {
        if state.protect && !state.delete {
            return Err(EngineError::ProtectedResource(state.urn.clone()));
        }
    }
    let mut chains = Vec::with_capacity(prior.resources.len());
    for state in prior.resources.iter().rev() {
        let op = if state.delete {
            StepOp::DeleteReplaced
        } else if state.external {
            StepOp::ReadDiscard
        } else {
            StepOp::Delete
        };
        let step = Step::new(op, state.urn.clone())
            .with_old(Arc::clone(state))
            .with_provider(state.provider.clone());
        chains.push(StepChain::single(step));
    }
    Ok(chains)
}
