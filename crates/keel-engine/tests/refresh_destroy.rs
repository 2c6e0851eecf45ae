//! Refresh and destroy deployments against a scripted provider.

use std::sync::Arc;

use keel_engine::{Deployment, DeploymentMode, EngineError, EventSink, Outcome, StepOp};
use keel_provider::{ReadResult, ResultStatus};
use keel_resource::{ResourceId, ResourceState, Snapshot};
use keel_source::{FixtureSource, SourceEvent};

use crate::common::*;

mod common;

fn chained_prior() -> (Snapshot, Vec<Arc<ResourceState>>) {
    let reference = provider_ref("pkgA", "default", "p1");
    let a = custom_state("pkgA:m:typA", "A", "ida", reference.clone(), props(&[]));
    let b = {
        let mut state = (*custom_state("pkgA:m:typA", "B", "idb", reference.clone(), props(&[]))).clone();
        state.dependencies = vec![a.urn.clone()];
        Arc::new(state)
    };
    let c = {
        let mut state = (*custom_state("pkgA:m:typA", "C", "idc", reference, props(&[]))).clone();
        state.dependencies = vec![a.urn.clone(), b.urn.clone()];
        Arc::new(state)
    };
    let states = vec![provider_state("pkgA", "default", "p1"), a, b, c];
    (Snapshot::new(states.clone()), states)
}

#[tokio::test]
async fn refresh_removes_deleted_resources_and_rewrites_dependencies() {
    let provider = ScriptedProvider::new();
    provider.missing_read("A");
    let host = ScriptedHost::new(Arc::clone(&provider));
    let (prior, _) = chained_prior();

    let deployment = Deployment::new(host, prior, options(DeploymentMode::Refresh));
    let (result, _) = run(deployment).await;

    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(live_names(&result.snapshot), ["default", "B", "C"]);
    let b = &result.snapshot.resources[1];
    let c = &result.snapshot.resources[2];
    assert!(b.dependencies.is_empty());
    assert_eq!(c.dependencies, vec![urn("pkgA:m:typA", "B")]);
    result.snapshot.verify_integrity().unwrap();
}

#[tokio::test]
async fn noop_refresh_is_structurally_identical() {
    let provider = ScriptedProvider::new();
    let host = ScriptedHost::new(Arc::clone(&provider));
    let (prior, states) = chained_prior();

    let deployment = Deployment::new(host, prior, options(DeploymentMode::Refresh));
    let (result, steps) = run(deployment).await;

    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(result.counts.get(&StepOp::Refresh), Some(&3));
    assert_eq!(result.snapshot.resources.len(), states.len());
    for (refreshed, prior_state) in result.snapshot.resources.iter().zip(&states) {
        assert!(
            Arc::ptr_eq(refreshed, prior_state),
            "`{}` should be carried forward untouched",
            prior_state.urn
        );
    }
    assert!(steps
        .iter()
        .all(|(op, _)| matches!(op, StepOp::Refresh | StepOp::Same)));
}

#[tokio::test]
async fn cancelled_refresh_preserves_unrefreshed_states() {
    let provider = ScriptedProvider::new();
    let reference = provider_ref("pkgA", "default", "p1");
    let a = custom_state("pkgA:m:typA", "A", "ida", reference.clone(), props(&[]));
    let b = custom_state("pkgA:m:typA", "B", "idb", reference.clone(), props(&[]));
    let c = custom_state("pkgA:m:typA", "C", "idc", reference, props(&[]));
    let prior = Snapshot::new(vec![
        provider_state("pkgA", "default", "p1"),
        Arc::clone(&a),
        Arc::clone(&b),
        Arc::clone(&c),
    ]);
    provider.read_for(
        "A",
        ReadResult {
            id: Some(ResourceId::new("ida")),
            inputs: props(&[]),
            outputs: props(&[("state", "drifted")]),
            status: ResultStatus::Ok,
            init_errors: Vec::new(),
        },
    );
    let (mut entered, release) = provider.gate_next_read();
    let host = ScriptedHost::new(Arc::clone(&provider));

    let (sink, events) = EventSink::new();
    let (cancel_tx, cancel_rx) = Deployment::cancellation();
    let deployment =
        Deployment::new(host, prior, options(DeploymentMode::Refresh)).with_events(sink);
    let handle = tokio::spawn(deployment.run(cancel_rx));

    // Cancel while the first read is in flight; it is allowed to finish.
    entered.recv().await.unwrap();
    cancel_tx.send(true).unwrap();
    release.send(()).unwrap();

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result.outcome, Outcome::Cancelled);

    let refreshed_a = result
        .snapshot
        .resources
        .iter()
        .find(|state| state.urn.name() == "A")
        .unwrap();
    assert_eq!(refreshed_a.outputs, props(&[("state", "drifted")]));
    for (name, prior_state) in [("B", &b), ("C", &c)] {
        let unrefreshed = result
            .snapshot
            .resources
            .iter()
            .find(|state| state.urn.name() == name)
            .unwrap();
        assert!(
            Arc::ptr_eq(unrefreshed, prior_state),
            "`{name}` should be byte-identical to the prior snapshot"
        );
    }
    let reads = provider
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("read"))
        .count();
    assert_eq!(reads, 1, "only the in-flight read should have run");

    // Cancellation fanned out to the provider.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(provider.calls().iter().any(|call| call == "cancel"));
    let _ = successes(events);
}

#[tokio::test]
async fn refresh_targets_skip_provider_round_trips() {
    let provider = ScriptedProvider::new();
    let reference = provider_ref("pkgA", "default", "p1");
    let a = custom_state("pkgA:m:typA", "A", "ida", reference.clone(), props(&[]));
    let b = custom_state("pkgA:m:typA", "B", "idb", reference, props(&[]));
    let prior = Snapshot::new(vec![
        provider_state("pkgA", "default", "p1"),
        a,
        Arc::clone(&b),
    ]);
    let host = ScriptedHost::new(Arc::clone(&provider));

    let deployment = Deployment::new(
        host,
        prior,
        options(DeploymentMode::Refresh).refresh_targets([urn("pkgA:m:typA", "A")]),
    );
    let (result, _) = run(deployment).await;

    assert_eq!(result.outcome, Outcome::Succeeded);
    let calls = provider.calls();
    assert!(calls.iter().any(|call| call == "read A"));
    assert!(!calls.iter().any(|call| call == "read B"));
    let untouched = result
        .snapshot
        .resources
        .iter()
        .find(|state| state.urn.name() == "B")
        .unwrap();
    assert!(Arc::ptr_eq(untouched, &b));
}

#[tokio::test]
async fn destroy_deletes_live_and_pending_delete_siblings() {
    let provider = ScriptedProvider::new();
    let reference = provider_ref("pkgA", "default", "p1");
    let tombstone = {
        let mut state =
            (*custom_state("pkgA:m:typA", "resA", "0", reference.clone(), props(&[]))).clone();
        state.delete = true;
        Arc::new(state)
    };
    let live = custom_state("pkgA:m:typA", "resA", "1", reference, props(&[]));
    let prior = Snapshot::new(vec![provider_state("pkgA", "default", "p1"), tombstone, live]);
    let host = ScriptedHost::new(Arc::clone(&provider));

    let deployment = Deployment::new(host, prior, options(DeploymentMode::Destroy));
    let (result, steps) = run(deployment).await;

    assert_eq!(result.outcome, Outcome::Succeeded);
    assert_eq!(
        steps,
        vec![
            (StepOp::Delete, "resA".to_string()),
            (StepOp::DeleteReplaced, "resA".to_string()),
            (StepOp::Delete, "default".to_string()),
        ]
    );
    let calls = provider.calls();
    let live_delete = calls.iter().position(|c| c == "delete resA id=1").unwrap();
    let tomb_delete = calls.iter().position(|c| c == "delete resA id=0").unwrap();
    assert!(live_delete < tomb_delete);
    assert!(result.snapshot.is_empty());
    assert!(result.snapshot.pending_operations.is_empty());
}

#[tokio::test]
async fn destroying_a_protected_resource_fails_before_any_step() {
    let provider = ScriptedProvider::new();
    let reference = provider_ref("pkgA", "default", "p1");
    let protected = {
        let mut state =
            (*custom_state("pkgA:m:typA", "resA", "r1", reference, props(&[]))).clone();
        state.protect = true;
        Arc::new(state)
    };
    let prior = Snapshot::new(vec![provider_state("pkgA", "default", "p1"), protected]);
    let host = ScriptedHost::new(Arc::clone(&provider));

    let (_tx, cancel) = Deployment::cancellation();
    let error = Deployment::new(host, prior, options(DeploymentMode::Destroy))
        .run(cancel)
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::ProtectedResource(_)));
    assert!(!provider.calls().iter().any(|call| call.starts_with("delete")));
}

#[tokio::test]
async fn update_then_destroy_then_refresh_yields_an_empty_snapshot() {
    let provider = ScriptedProvider::new();
    let host = ScriptedHost::new(Arc::clone(&provider));

    let deployment = Deployment::new(
        Arc::clone(&host) as _,
        Snapshot::empty(),
        options(DeploymentMode::Update),
    )
    .with_source(FixtureSource::new([SourceEvent::RegisterResource(register(
        "pkgA:m:typA",
        "resA",
    ))]));
    let (updated, _) = run(deployment).await;
    assert_eq!(updated.outcome, Outcome::Succeeded);
    assert_eq!(updated.snapshot.resources.len(), 2);

    let deployment = Deployment::new(
        Arc::clone(&host) as _,
        updated.snapshot,
        options(DeploymentMode::Destroy),
    );
    let (destroyed, _) = run(deployment).await;
    assert_eq!(destroyed.outcome, Outcome::Succeeded);
    assert!(destroyed.snapshot.is_empty());

    let deployment = Deployment::new(host, destroyed.snapshot, options(DeploymentMode::Refresh));
    let (refreshed, steps) = run(deployment).await;
    assert_eq!(refreshed.outcome, Outcome::Succeeded);
    assert!(steps.is_empty());
    assert!(refreshed.snapshot.is_empty());
}
