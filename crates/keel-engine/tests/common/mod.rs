#![allow(dead_code)]

//! A scripted provider, host, and snapshot fixtures shared by the
//! deployment suites.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use keel_engine::{
    Deployment, DeploymentMode, DeploymentOptions, DeploymentResult, EngineEvent, EventSink,
    StepOp,
};
use keel_property::{PropertyKey, PropertyMap, PropertyPath, PropertyValue};
use keel_provider::{
    CheckFailure, CheckResult, CreateResult, DiffResult, HostError, Provider, ProviderError,
    ProviderHost, ReadResult, ResultStatus, UpdateResult,
};
use keel_resource::{
    PackageDescriptor, ProviderId, ProviderReference, ResourceId, ResourceState, Snapshot,
};
use keel_source::RegistrationRequest;
use keel_urn::{Type, Urn};

pub const STACK: &str = "dev";
pub const PROJECT: &str = "proj";

pub fn ty(token: &str) -> Type {
    Type::parse(token).unwrap()
}

pub fn urn(token: &str, name: &str) -> Urn {
    Urn::new(STACK, PROJECT, None, &ty(token), name)
}

pub fn provider_urn(package: &str, name: &str) -> Urn {
    Urn::new(STACK, PROJECT, None, &Type::provider(package), name)
}

pub fn props(entries: &[(&str, &str)]) -> PropertyMap {
    entries
        .iter()
        .map(|(k, v)| (PropertyKey::from(*k), PropertyValue::from(*v)))
        .collect()
}

/// A provider resource state as it would appear in a prior snapshot.
pub fn provider_state(package: &str, name: &str, id: &str) -> Arc<ResourceState> {
    let mut state = ResourceState::new(provider_urn(package, name), Type::provider(package), true);
    state.id = Some(ResourceId::new(id));
    Arc::new(state)
}

pub fn provider_ref(package: &str, name: &str, id: &str) -> ProviderReference {
    ProviderReference::new(provider_urn(package, name), ProviderId::new(id)).unwrap()
}

/// A custom resource state bound to a provider reference.
pub fn custom_state(
    token: &str,
    name: &str,
    id: &str,
    provider: ProviderReference,
    inputs: PropertyMap,
) -> Arc<ResourceState> {
    let mut state = ResourceState::new(urn(token, name), ty(token), true);
    state.id = Some(ResourceId::new(id));
    state.provider = Some(provider);
    state.inputs = inputs.clone();
    state.outputs = inputs;
    Arc::new(state)
}

pub fn options(mode: DeploymentMode) -> DeploymentOptions {
    DeploymentOptions::new(mode, STACK, PROJECT)
}

pub fn register(token: &str, name: &str) -> RegistrationRequest {
    RegistrationRequest::new(token, name, true)
}

/// Pauses the scripted provider's first read until released, so tests can
/// cancel a deployment at a precise point.
pub struct ReadGate {
    entered: mpsc::UnboundedSender<()>,
    release: Mutex<Option<oneshot::Receiver<()>>>,
}

#[derive(Default)]
pub struct ScriptedProvider {
    next_id: AtomicU64,
    /// Every lifecycle call, in order, as `"<call> <urn name>"`.
    pub calls: Mutex<Vec<String>>,
    diffs: Mutex<HashMap<String, DiffResult>>,
    config_diff: Mutex<Option<DiffResult>>,
    reads: Mutex<HashMap<String, ReadResult>>,
    missing_reads: Mutex<HashSet<String>>,
    check_failures: Mutex<HashMap<String, Vec<CheckFailure>>>,
    partial_creates: Mutex<HashSet<String>>,
    slow_creates: Mutex<HashSet<String>>,
    read_gate: Mutex<Option<Arc<ReadGate>>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Use `result` for diffs of the resource named `name` whenever the
    /// structural diff reports changes.
    pub fn diff_for(&self, name: &str, result: DiffResult) {
        self.diffs.lock().unwrap().insert(name.to_string(), result);
    }

    /// Use `result` for configuration diffs whenever the structural diff
    /// reports changes.
    pub fn config_diff(&self, result: DiffResult) {
        *self.config_diff.lock().unwrap() = Some(result);
    }

    pub fn read_for(&self, name: &str, result: ReadResult) {
        self.reads.lock().unwrap().insert(name.to_string(), result);
    }

    /// Reads of `name` report the resource gone.
    pub fn missing_read(&self, name: &str) {
        self.missing_reads.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_check(&self, name: &str, failures: Vec<CheckFailure>) {
        self.check_failures
            .lock()
            .unwrap()
            .insert(name.to_string(), failures);
    }

    pub fn partial_create(&self, name: &str) {
        self.partial_creates.lock().unwrap().insert(name.to_string());
    }

    /// Creates of `name` stall long enough to trip any sub-second timeout.
    pub fn slow_create(&self, name: &str) {
        self.slow_creates.lock().unwrap().insert(name.to_string());
    }

    /// Gate the next read: the returned receiver fires when the read
    /// starts, and the read does not return until the sender is used.
    pub fn gate_next_read(&self) -> (mpsc::UnboundedReceiver<()>, oneshot::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::unbounded_channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.read_gate.lock().unwrap() = Some(Arc::new(ReadGate {
            entered: entered_tx,
            release: Mutex::new(Some(release_rx)),
        }));
        (entered_rx, release_tx)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, call: &str, urn: &Urn) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{call} {}", urn.name()));
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn configure(&self, _inputs: &PropertyMap) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push("configure".to_string());
        Ok(())
    }

    async fn check(
        &self,
        urn: &Urn,
        _olds: &PropertyMap,
        news: &PropertyMap,
    ) -> Result<CheckResult, ProviderError> {
        self.log("check", urn);
        let failures = self
            .check_failures
            .lock()
            .unwrap()
            .get(urn.name())
            .cloned()
            .unwrap_or_default();
        Ok(CheckResult {
            inputs: news.clone(),
            failures,
        })
    }

    async fn diff(
        &self,
        urn: &Urn,
        _id: &ResourceId,
        olds: &PropertyMap,
        news: &PropertyMap,
        ignore_changes: &[PropertyPath],
    ) -> Result<DiffResult, ProviderError> {
        self.log("diff", urn);
        let structural = DiffResult::from_maps(olds, news, ignore_changes)
            .map_err(|err| ProviderError::call(err.to_string()))?;
        if !structural.has_changes() {
            return Ok(structural);
        }
        match self.diffs.lock().unwrap().get(urn.name()) {
            Some(scripted) => Ok(scripted.clone()),
            None => Ok(structural),
        }
    }

    async fn diff_config(
        &self,
        urn: &Urn,
        olds: &PropertyMap,
        news: &PropertyMap,
        ignore_changes: &[PropertyPath],
    ) -> Result<DiffResult, ProviderError> {
        self.log("diff-config", urn);
        let structural = DiffResult::from_maps(olds, news, ignore_changes)
            .map_err(|err| ProviderError::call(err.to_string()))?;
        if !structural.has_changes() {
            return Ok(structural);
        }
        match self.config_diff.lock().unwrap().clone() {
            Some(scripted) => Ok(scripted),
            None => Ok(structural),
        }
    }

    async fn create(
        &self,
        urn: &Urn,
        news: &PropertyMap,
        _timeout: Option<Duration>,
    ) -> Result<CreateResult, ProviderError> {
        self.log("create", urn);
        if self.slow_creates.lock().unwrap().contains(urn.name()) {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let partial = self.partial_creates.lock().unwrap().contains(urn.name());
        Ok(CreateResult {
            id: ResourceId::new(format!("{}-{n}", urn.name())),
            outputs: news.clone(),
            status: if partial {
                ResultStatus::PartialFailure
            } else {
                ResultStatus::Ok
            },
            init_errors: if partial {
                vec!["resource did not become ready".to_string()]
            } else {
                Vec::new()
            },
        })
    }

    async fn read(
        &self,
        urn: &Urn,
        id: &ResourceId,
        inputs: &PropertyMap,
        state: &PropertyMap,
    ) -> Result<ReadResult, ProviderError> {
        self.log("read", urn);
        let gate = self.read_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let release = gate.release.lock().unwrap().take();
            if let Some(release) = release {
                let _ = release.await;
            }
        }
        if self.missing_reads.lock().unwrap().contains(urn.name()) {
            return Ok(ReadResult::missing());
        }
        if let Some(scripted) = self.reads.lock().unwrap().get(urn.name()) {
            return Ok(scripted.clone());
        }
        Ok(ReadResult {
            id: Some(id.clone()),
            inputs: inputs.clone(),
            outputs: state.clone(),
            status: ResultStatus::Ok,
            init_errors: Vec::new(),
        })
    }

    async fn update(
        &self,
        urn: &Urn,
        _id: &ResourceId,
        _olds: &PropertyMap,
        news: &PropertyMap,
        _timeout: Option<Duration>,
        _ignore_changes: &[PropertyPath],
    ) -> Result<UpdateResult, ProviderError> {
        self.log("update", urn);
        Ok(UpdateResult {
            outputs: news.clone(),
            status: ResultStatus::Ok,
            init_errors: Vec::new(),
        })
    }

    async fn delete(
        &self,
        urn: &Urn,
        id: &ResourceId,
        _olds: &PropertyMap,
        _timeout: Option<Duration>,
    ) -> Result<ResultStatus, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("delete {} id={id}", urn.name()));
        Ok(ResultStatus::Ok)
    }

    async fn cancel(&self) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push("cancel".to_string());
        Ok(())
    }
}

/// A host that vends the one scripted provider for every package.
pub struct ScriptedHost {
    provider: Arc<ScriptedProvider>,
    pub loads: AtomicUsize,
}

impl ScriptedHost {
    pub fn new(provider: Arc<ScriptedProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            loads: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ProviderHost for ScriptedHost {
    async fn provider(
        &self,
        _descriptor: &PackageDescriptor,
    ) -> Result<Arc<dyn Provider>, HostError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(&self.provider) as Arc<dyn Provider>)
    }
}

/// A host that fails every load.
pub struct UnavailableHost;

#[async_trait]
impl ProviderHost for UnavailableHost {
    async fn provider(
        &self,
        descriptor: &PackageDescriptor,
    ) -> Result<Arc<dyn Provider>, HostError> {
        Err(HostError::NotFound {
            package: descriptor.package.clone(),
            version: descriptor.version.clone(),
        })
    }
}

/// Run a deployment to completion, returning the result and the ordered
/// `(op, urn name)` list of successful steps.
pub async fn run(deployment: Deployment) -> (DeploymentResult, Vec<(StepOp, String)>) {
    let (sink, events) = EventSink::new();
    let (_cancel_tx, cancel_rx) = Deployment::cancellation();
    let result = deployment
        .with_events(sink)
        .run(cancel_rx)
        .await
        .expect("deployment should not fail pre-flight");
    (result, successes(events))
}

/// Drain the event stream into the ordered list of successful steps.
pub fn successes(mut events: mpsc::UnboundedReceiver<EngineEvent>) -> Vec<(StepOp, String)> {
    let mut result = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::ResourceOutputs { op, urn } = event {
            result.push((op, urn.name().to_string()));
        }
    }
    result
}

/// The names of the live resources in snapshot order.
pub fn live_names(snapshot: &Snapshot) -> Vec<String> {
    snapshot
        .resources
        .iter()
        .filter(|state| !state.delete)
        .map(|state| state.urn.name().to_string())
        .collect()
}
