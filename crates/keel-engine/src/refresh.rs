use std::sync::Arc;

use rustc_hash::FxHashSet;

use keel_resource::{ResourceState, Snapshot};
use keel_urn::Urn;

use crate::step::{Step, StepChain, StepOp};

/// Plan a refresh: one chain per prior state, in snapshot order.
///
/// Custom, targeted resources get a `Refresh` step whose inner result
/// (same/update/delete) is decided by what the provider's read returns.
/// Component resources, provider resources, pending-delete tombstones, and
/// non-targeted resources are carried forward as `Same` without a provider
/// round-trip.
pub(crate) fn plan(prior: &Snapshot, targets: Option<&FxHashSet<Urn>>) -> Vec<StepChain> {
    let mut chains = Vec::with_capacity(prior.resources.len());
    for state in &prior.resources {
        let refreshable = state.custom
            && !state.is_provider()
            && !state.delete
            && targets.map_or(true, |targets| targets.contains(&state.urn));
        let step = if refreshable {
            Step::new(StepOp::Refresh, state.urn.clone())
                .with_old(Arc::clone(state))
                .with_provider(state.provider.clone())
        } else {
            Step::new(StepOp::Same, state.urn.clone())
                .with_old(Arc::clone(state))
                .with_new(Arc::clone(state))
        };
        chains.push(StepChain::single(step));
    }
    chains
}

/// Strip references to resources a refresh discovered deleted: surviving
/// states lose the dangling entries from `Dependencies` and
/// `PropertyDependencies`, and a deleted parent becomes no parent.
pub(crate) fn prune_dangling_references(snapshot: &Snapshot, prior: &Snapshot) -> Snapshot {
    let surviving: FxHashSet<&Urn> = snapshot
        .resources
        .iter()
        .map(|state| &state.urn)
        .collect();
    let removed: FxHashSet<Urn> = prior
        .resources
        .iter()
        .filter(|state| !surviving.contains(&state.urn))
        .map(|state| state.urn.clone())
        .collect();
    if removed.is_empty() {
        return snapshot.clone();
    }

    let mut result = snapshot.clone();
    result.resources = snapshot
        .resources
        .iter()
        .map(|state| {
            let dangling = |urn: &Urn| removed.contains(urn);
            let needs_rewrite = state.dependencies.iter().any(dangling)
                || state
                    .property_dependencies
                    .values()
                    .flatten()
                    .any(dangling)
                || state.parent.as_ref().is_some_and(|parent| dangling(parent));
            if !needs_rewrite {
                return Arc::clone(state);
            }
            let mut rewritten = (**state).clone();
            rewritten.dependencies.retain(|urn| !dangling(urn));
            rewritten.property_dependencies = rewritten
                .property_dependencies
                .into_iter()
                .filter_map(|(key, urns)| {
                    let urns: Vec<Urn> = urns.into_iter().filter(|urn| !dangling(urn)).collect();
                    if urns.is_empty() {
                        None
                    } else {
                        Some((key, urns))
                    }
                })
                .collect();
            if rewritten.parent.as_ref().is_some_and(|parent| dangling(parent)) {
                rewritten.parent = None;
            }
            Arc::new(rewritten)
        })
        .collect();
    result
}

/// Decide what a refresh read produced: `None` ⇒ the resource is gone,
/// identical outputs and ID ⇒ same, anything else ⇒ the refreshed state.
pub(crate) fn refreshed_state(
    old: &Arc<ResourceState>,
    read: &keel_provider::ReadResult,
) -> Option<Arc<ResourceState>> {
    let id = read.id.as_ref()?;
    let unchanged = Some(id) == old.id.as_ref()
        && old.outputs == read.outputs
        && read.init_errors.is_empty();
    if unchanged {
        return Some(Arc::clone(old));
    }
    let mut refreshed = (**old).clone();
    refreshed.id = Some(id.clone());
    if !read.inputs.is_empty() {
        refreshed.inputs = read.inputs.clone();
    }
    refreshed.outputs = read.outputs.clone();
    refreshed.init_errors = read.init_errors.clone();
    Some(Arc::new(refreshed))
}

#[cfg(test)]
mod tests {
    use keel_urn::Type;

    use super::*;

    fn ty() -> Type {
        Type::parse("pkg:m:T").unwrap()
    }

    fn urn(name: &str) -> Urn {
        Urn::new("dev", "proj", None, &ty(), name)
    }

    fn state(name: &str, deps: &[&str]) -> Arc<ResourceState> {
        let mut state = ResourceState::new(urn(name), ty(), true);
        state.dependencies = deps.iter().map(|dep| urn(dep)).collect();
        Arc::new(state)
    }

    #[test]
    fn targets_limit_provider_round_trips() {
        let prior = Snapshot::new(vec![state("a", &[]), state("b", &[])]);
        let targets: FxHashSet<Urn> = std::iter::once(urn("a")).collect();
        let chains = plan(&prior, Some(&targets));
        assert_eq!(chains[0].steps[0].op, StepOp::Refresh);
        assert_eq!(chains[1].steps[0].op, StepOp::Same);
    }

    #[test]
    fn pruning_strips_dangling_dependencies() {
        let prior = Snapshot::new(vec![
            state("a", &[]),
            state("b", &["a"]),
            state("c", &["a", "b"]),
        ]);
        // The refresh discovered `a` deleted.
        let refreshed = Snapshot::new(vec![
            Arc::clone(&prior.resources[1]),
            Arc::clone(&prior.resources[2]),
        ]);
        let pruned = prune_dangling_references(&refreshed, &prior);
        assert!(pruned.resources[0].dependencies.is_empty());
        assert_eq!(pruned.resources[1].dependencies, vec![urn("b")]);
        pruned.verify_integrity().unwrap();
    }
}
