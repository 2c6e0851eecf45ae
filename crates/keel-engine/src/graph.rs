use std::sync::Arc;

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Bfs;
use rustc_hash::FxHashMap;

use keel_resource::{ResourceState, Snapshot};
use keel_urn::Urn;

/// The live states transitively dependent on any of `roots`, reachable
/// through `Dependencies`, `PropertyDependencies`, parent, or provider
/// references, in snapshot (topological) order, excluding the roots
/// themselves.
///
/// This is the replace closure: when a resource must be deleted before its
/// replacement is created, everything in this set must be deleted first,
/// in reverse of the returned order.
pub(crate) fn dependent_closure(snapshot: &Snapshot, roots: &[Urn]) -> Vec<Arc<ResourceState>> {
    let live: Vec<(usize, &Arc<ResourceState>)> = snapshot
        .resources
        .iter()
        .enumerate()
        .filter(|(_, state)| !state.delete)
        .collect();
    let index: FxHashMap<&Urn, usize> = live.iter().map(|(at, state)| (&state.urn, *at)).collect();

    // Edges point from a dependency to its dependents; reachability from a
    // root is then exactly the set that must go before it. The dependency
    // graph is acyclic by construction, but the closure can reach a node
    // along several paths, so this is a reachability walk rather than a
    // recursive expansion.
    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for (at, state) in &live {
        graph.add_node(*at);
        for dependency in state.all_dependencies() {
            if let Some(&dep_at) = index.get(&dependency) {
                graph.add_edge(dep_at, *at, ());
            }
        }
    }

    let mut reached: Vec<usize> = Vec::new();
    for root in roots {
        let Some(&root_at) = index.get(root) else {
            continue;
        };
        let mut bfs = Bfs::new(&graph, root_at);
        while let Some(at) = bfs.next(&graph) {
            if at != root_at && !reached.contains(&at) {
                reached.push(at);
            }
        }
    }
    reached.sort_unstable();
    reached
        .into_iter()
        .map(|at| Arc::clone(&snapshot.resources[at]))
        .collect()
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
    fn closure_is_transitive_and_ordered() {
        let snapshot = Snapshot::new(vec![
            state("a", &[]),
            state("b", &["a"]),
            state("c", &["b"]),
            state("d", &[]),
        ]);
        let closure = dependent_closure(&snapshot, &[urn("a")]);
        let names: Vec<&str> = closure.iter().map(|s| s.urn.name()).collect();
        assert_eq!(names, ["b", "c"]);
    }

    #[test]
    fn diamond_dependents_appear_once() {
        let snapshot = Snapshot::new(vec![
            state("a", &[]),
            state("left", &["a"]),
            state("right", &["a"]),
            state("join", &["left", "right"]),
        ]);
        let closure = dependent_closure(&snapshot, &[urn("a")]);
        let names: Vec<&str> = closure.iter().map(|s| s.urn.name()).collect();
        assert_eq!(names, ["left", "right", "join"]);
    }

    #[test]
    fn unrelated_roots_merge() {
        let snapshot = Snapshot::new(vec![
            state("a", &[]),
            state("b", &[]),
            state("a-dep", &["a"]),
            state("b-dep", &["b"]),
        ]);
        let closure = dependent_closure(&snapshot, &[urn("a"), urn("b")]);
        let names: Vec<&str> = closure.iter().map(|s| s.urn.name()).collect();
        assert_eq!(names, ["a-dep", "b-dep"]);
    }
}
