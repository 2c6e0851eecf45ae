use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use keel_provider::{Provider, ProviderError, ResultStatus};
use keel_registry::{ProviderRegistry, RegistryError};
use keel_resource::{ResourceState, ResourceId};
use keel_source::RegistrationResponse;
use keel_urn::Urn;

use crate::events::{EngineEvent, EventSink, StepOpCounts};
use crate::manager::{SnapshotManager, StepOutcome};
use crate::refresh::refreshed_state;
use crate::step::{Step, StepChain, StepOp};
use crate::{EngineError, JournalError};

pub(crate) struct ExecutorContext {
    pub registry: Arc<ProviderRegistry>,
    pub manager: Arc<dyn SnapshotManager>,
    pub events: EventSink,
    pub parallel: usize,
    pub continue_on_error: bool,
    pub dry_run: bool,
    pub cancel: watch::Receiver<bool>,
    /// Signalled when the executor stops accepting new chains, so the
    /// source pump stops planning work that will never run.
    pub aborted: watch::Sender<bool>,
}

#[derive(Debug, Default)]
pub(crate) struct ExecutorResult {
    pub counts: StepOpCounts,
    pub errors: Vec<EngineError>,
    pub cancelled: bool,
    pub corrupt: Option<JournalError>,
}

/// Start the executor: a scheduler task owning the pending-step DAG and a
/// pool of at most `parallel` concurrently-executing chains. Chains arrive
/// on the returned channel; the scheduler wires ordering edges as they
/// arrive and dispatches whatever has no unmet antecedents.
pub(crate) fn start(ctx: ExecutorContext) -> (mpsc::Sender<StepChain>, JoinHandle<ExecutorResult>) {
    let (tx, rx) = mpsc::channel(64);
    let handle = tokio::spawn(schedule(ctx, rx));
    (tx, handle)
}

struct ChainEntry {
    chain: Option<StepChain>,
    unmet: usize,
}

async fn schedule(ctx: ExecutorContext, mut intake: mpsc::Receiver<StepChain>) -> ExecutorResult {
    let semaphore = Arc::new(Semaphore::new(ctx.parallel));
    let step_ctx = Arc::new(StepContext {
        registry: Arc::clone(&ctx.registry),
        manager: Arc::clone(&ctx.manager),
        events: ctx.events.clone(),
        dry_run: ctx.dry_run,
        cancel: ctx.cancel.clone(),
    });

    let mut result = ExecutorResult::default();
    let mut running: JoinSet<(u64, ChainResult)> = JoinSet::new();
    let mut entries: FxHashMap<u64, ChainEntry> = FxHashMap::default();
    let mut dependents: FxHashMap<u64, Vec<u64>> = FxHashMap::default();
    let mut latest_for_urn: FxHashMap<Urn, u64> = FxHashMap::default();
    let mut delete_dependents: FxHashMap<Urn, Vec<u64>> = FxHashMap::default();
    let mut completed: FxHashSet<u64> = FxHashSet::default();
    let mut next_id: u64 = 0;

    let mut intake_open = true;
    // Once a failure or cancellation lands, in-flight chains finish but
    // nothing new starts. Halting also releases anything suspended on a
    // provider whose configuring step will now never run.
    let mut accepting = true;
    let halt = |accepting: &mut bool| {
        *accepting = false;
        let _ = ctx.aborted.send(true);
        ctx.registry.release_waiters();
    };
    let mut cancel = ctx.cancel.clone();
    let mut cancel_open = true;

    loop {
        if !intake_open && running.is_empty() {
            break;
        }
        tokio::select! {
            maybe_chain = intake.recv(), if intake_open => {
                match maybe_chain {
                    None => intake_open = false,
                    Some(chain) if !accepting => drop(chain),
                    Some(chain) => {
                        let id = next_id;
                        next_id += 1;
                        let unmet = register_chain(
                            id,
                            &chain,
                            &mut latest_for_urn,
                            &mut delete_dependents,
                            &mut dependents,
                            &completed,
                        );
                        entries.insert(id, ChainEntry { chain: Some(chain), unmet });
                        if unmet == 0 {
                            dispatch(id, &mut entries, &mut running, &semaphore, &step_ctx);
                        }
                    }
                }
            }
            maybe_done = running.join_next(), if !running.is_empty() => {
                let Some(joined) = maybe_done else { continue };
                let (id, chain_result) = match joined {
                    Ok(done) => done,
                    Err(join_error) => {
                        warn!(%join_error, "step execution task failed");
                        result.errors.push(EngineError::invalid(join_error.to_string()));
                        halt(&mut accepting);
                        continue;
                    }
                };
                completed.insert(id);
                entries.remove(&id);
                for op in chain_result.succeeded {
                    *result.counts.entry(op).or_default() += 1;
                }
                if let Some(corrupt) = chain_result.corrupt {
                    result.corrupt = Some(corrupt);
                    halt(&mut accepting);
                }
                if !chain_result.errors.is_empty() {
                    result.errors.extend(chain_result.errors);
                    if !ctx.continue_on_error {
                        halt(&mut accepting);
                    }
                }
                for dependent in dependents.remove(&id).unwrap_or_default() {
                    if let Some(entry) = entries.get_mut(&dependent) {
                        entry.unmet -= 1;
                        if entry.unmet == 0 && accepting {
                            dispatch(dependent, &mut entries, &mut running, &semaphore, &step_ctx);
                        }
                    }
                }
            }
            changed = cancel.changed(), if cancel_open && accepting => {
                match changed {
                    Ok(()) if *cancel.borrow() => {
                        debug!("cancellation observed; draining in-flight steps");
                        result.cancelled = true;
                        halt(&mut accepting);
                    }
                    Ok(()) => {}
                    Err(_) => cancel_open = false,
                }
            }
        }
    }
    result
}

/// Wire the ordering edges for an arriving chain and return how many of
/// its antecedents are still outstanding.
fn register_chain(
    id: u64,
    chain: &StepChain,
    latest_for_urn: &mut FxHashMap<Urn, u64>,
    delete_dependents: &mut FxHashMap<Urn, Vec<u64>>,
    dependents: &mut FxHashMap<u64, Vec<u64>>,
    completed: &FxHashSet<u64>,
) -> usize {
    let mut antecedents: FxHashSet<u64> = FxHashSet::default();
    let mut consider = |dep: u64, antecedents: &mut FxHashSet<u64>| {
        if dep != id && !completed.contains(&dep) {
            antecedents.insert(dep);
        }
    };
    for step in &chain.steps {
        if step.op.is_deletion() {
            // A deletion waits for the already-announced deletions of
            // everything that depends on it, and announces itself as a
            // dependent-deleter of everything its old state depends on.
            if let Some(waiters) = delete_dependents.get(&step.urn) {
                for &dep in waiters {
                    consider(dep, &mut antecedents);
                }
            }
            if let Some(old) = &step.old {
                for dependency in old.all_dependencies() {
                    delete_dependents.entry(dependency).or_default().push(id);
                }
            }
        } else if let Some(new) = &step.new {
            for dependency in new.all_dependencies() {
                if let Some(&dep) = latest_for_urn.get(&dependency) {
                    consider(dep, &mut antecedents);
                }
            }
        }
        // Steps touching the same URN serialize in arrival order.
        if let Some(&dep) = latest_for_urn.get(&step.urn) {
            consider(dep, &mut antecedents);
        }
        latest_for_urn.insert(step.urn.clone(), id);
    }
    for &dep in &antecedents {
        dependents.entry(dep).or_default().push(id);
    }
    antecedents.len()
}

fn dispatch(
    id: u64,
    entries: &mut FxHashMap<u64, ChainEntry>,
    running: &mut JoinSet<(u64, ChainResult)>,
    semaphore: &Arc<Semaphore>,
    step_ctx: &Arc<StepContext>,
) {
    let Some(entry) = entries.get_mut(&id) else {
        return;
    };
    let Some(chain) = entry.chain.take() else {
        return;
    };
    let semaphore = Arc::clone(semaphore);
    let ctx = Arc::clone(step_ctx);
    running.spawn(async move {
        let _permit = semaphore
            .acquire_owned()
            .await
            .expect("the executor never closes the semaphore");
        let result = execute_chain(chain, &ctx).await;
        (id, result)
    });
}

struct StepContext {
    registry: Arc<ProviderRegistry>,
    manager: Arc<dyn SnapshotManager>,
    events: EventSink,
    dry_run: bool,
    cancel: watch::Receiver<bool>,
}

#[derive(Debug, Default)]
struct ChainResult {
    succeeded: Vec<StepOp>,
    errors: Vec<EngineError>,
    corrupt: Option<JournalError>,
}

async fn execute_chain(chain: StepChain, ctx: &StepContext) -> ChainResult {
    let mut result = ChainResult::default();
    let acting = chain.acting_urn().clone();
    let mut response_state: Option<Arc<ResourceState>> = None;
    let mut failed = false;

    for step in &chain.steps {
        // A chain that reaches the front of the queue after cancellation
        // landed never starts; in-flight steps are the only ones allowed
        // to finish.
        if *ctx.cancel.borrow() {
            failed = true;
            break;
        }
        match execute_step(step, ctx).await {
            Ok((state, partial)) => {
                result.succeeded.push(step.op);
                if step.urn == acting {
                    if let Some(state) = &state {
                        response_state = Some(Arc::clone(state));
                    }
                }
                if let Some(partial) = partial {
                    result.errors.push(partial);
                }
            }
            Err(EngineError::Corrupt(journal_error)) => {
                result.corrupt = Some(journal_error);
                failed = true;
                break;
            }
            Err(error) => {
                result.errors.push(error);
                failed = true;
                break;
            }
        }
    }

    if !failed {
        if let Some(done) = chain.done {
            let response = RegistrationResponse {
                urn: acting,
                id: response_state.as_ref().and_then(|state| state.id.clone()),
                outputs: response_state
                    .as_ref()
                    .map(|state| state.outputs.clone())
                    .unwrap_or_default(),
            };
            let _ = done.send(response);
        }
    }
    result
}

/// Run one step: record the begin entry, make the provider call, close the
/// mutation with the outcome. Returns the resulting state plus a non-fatal
/// partial-failure error when the provider reported one.
async fn execute_step(
    step: &Step,
    ctx: &StepContext,
) -> Result<(Option<Arc<ResourceState>>, Option<EngineError>), EngineError> {
    ctx.events.send(EngineEvent::ResourcePre {
        op: step.op,
        urn: step.urn.clone(),
    });
    debug!(op = %step.op, urn = %step.urn, "executing step");

    let record = Arc::new(step.clone());
    let mutation = ctx
        .manager
        .begin_mutation(record)
        .await
        .map_err(EngineError::Corrupt)?;

    match perform(step, ctx).await {
        Ok((state, partial)) => {
            mutation
                .end(StepOutcome::Success {
                    state: state.clone(),
                })
                .await
                .map_err(EngineError::Corrupt)?;
            match &partial {
                None => ctx.events.send(EngineEvent::ResourceOutputs {
                    op: step.op,
                    urn: step.urn.clone(),
                }),
                Some(error) => ctx.events.send(EngineEvent::ResourceFailed {
                    urn: step.urn.clone(),
                    message: error.to_string(),
                }),
            }
            Ok((state, partial))
        }
        Err(error) => {
            mutation
                .end(StepOutcome::Failure)
                .await
                .map_err(EngineError::Corrupt)?;
            ctx.events.send(EngineEvent::ResourceFailed {
                urn: step.urn.clone(),
                message: error.to_string(),
            });
            Err(error)
        }
    }
}

/// The provider call behind each step operation.
async fn perform(
    step: &Step,
    ctx: &StepContext,
) -> Result<(Option<Arc<ResourceState>>, Option<EngineError>), EngineError> {
    let urn = &step.urn;
    match step.op {
        StepOp::Same => {
            let new = step.new.clone().expect("same steps carry a new state");
            if step.is_provider_step() {
                ctx.registry.same(&new).await.map_err(registry_error)?;
            }
            Ok((Some(new), None))
        }
        StepOp::Create | StepOp::CreateReplacement => {
            let new = step.new.clone().expect("create steps carry a new state");
            if step.is_provider_step() {
                let created = Provider::create(ctx.registry.as_ref(), urn, &new.inputs, None)
                    .await
                    .map_err(|source| provider_failure(urn, source))?;
                let mut state = (*new).clone();
                state.id = Some(created.id);
                state.outputs = created.outputs;
                return Ok((Some(Arc::new(state)), None));
            }
            if !new.custom || ctx.dry_run {
                // Component resources are bookkeeping: no provider call.
                let mut state = (*new).clone();
                state.outputs = state.inputs.clone();
                return Ok((Some(Arc::new(state)), None));
            }
            let provider = resolve(ctx, step).await?;
            let timeout = new.custom_timeouts.as_ref().and_then(|t| t.create_timeout());
            let created = call(urn, timeout, provider.create(urn, &new.inputs, timeout)).await?;
            let mut state = (*new).clone();
            state.id = Some(created.id);
            state.outputs = created.outputs;
            state.init_errors = created.init_errors.clone();
            let partial = partial_failure(urn, created.status, created.init_errors);
            Ok((Some(Arc::new(state)), partial))
        }
        StepOp::Update => {
            let new = step.new.clone().expect("update steps carry a new state");
            let old = step.old.clone().expect("update steps carry an old state");
            if step.is_provider_step() {
                let id = new.id.clone().unwrap_or_else(ResourceId::unknown);
                let updated = Provider::update(
                    ctx.registry.as_ref(),
                    urn,
                    &id,
                    &old.outputs,
                    &new.inputs,
                    None,
                    &[],
                )
                .await
                .map_err(|source| provider_failure(urn, source))?;
                let mut state = (*new).clone();
                state.outputs = updated.outputs;
                return Ok((Some(Arc::new(state)), None));
            }
            if !new.custom || ctx.dry_run {
                let mut state = (*new).clone();
                state.outputs = state.inputs.clone();
                return Ok((Some(Arc::new(state)), None));
            }
            let id = new
                .id
                .clone()
                .ok_or_else(|| EngineError::invalid(format!("`{urn}` has no ID to update")))?;
            let provider = resolve(ctx, step).await?;
            let timeout = new.custom_timeouts.as_ref().and_then(|t| t.update_timeout());
            let paths = parse_recorded_paths(&new.ignore_changes);
            let updated = call(
                urn,
                timeout,
                provider.update(urn, &id, &old.outputs, &new.inputs, timeout, &paths),
            )
            .await?;
            let mut state = (*new).clone();
            state.outputs = updated.outputs;
            state.init_errors = updated.init_errors.clone();
            let partial = partial_failure(urn, updated.status, updated.init_errors);
            Ok((Some(Arc::new(state)), partial))
        }
        StepOp::Delete | StepOp::DeleteReplaced => {
            let old = step.old.clone().expect("delete steps carry an old state");
            if step.is_provider_step() || ctx.dry_run || !old.custom || old.external {
                return Ok((None, None));
            }
            let Some(id) = old.id.clone() else {
                return Ok((None, None));
            };
            let provider = resolve(ctx, step).await?;
            let timeout = old.custom_timeouts.as_ref().and_then(|t| t.delete_timeout());
            let status = call(urn, timeout, provider.delete(urn, &id, &old.outputs, timeout)).await?;
            let partial = partial_failure(urn, status, Vec::new());
            Ok((None, partial))
        }
        StepOp::Read | StepOp::ReadReplacement => {
            let new = step.new.clone().expect("read steps carry a new state");
            let id = new.id.clone().expect("read steps carry an ID");
            let provider = resolve(ctx, step).await?;
            let read = call(urn, None, provider.read(urn, &id, &new.inputs, &new.outputs)).await?;
            let Some(read_id) = read.id else {
                return Err(EngineError::Provider {
                    urn: urn.clone(),
                    source: ProviderError::call(format!("resource `{id}` does not exist")),
                });
            };
            let mut state = (*new).clone();
            state.id = Some(read_id);
            if !read.inputs.is_empty() {
                state.inputs = read.inputs;
            }
            state.outputs = read.outputs;
            state.init_errors = read.init_errors.clone();
            let partial = partial_failure(urn, read.status, read.init_errors);
            Ok((Some(Arc::new(state)), partial))
        }
        StepOp::Import | StepOp::ImportReplacement => {
            let new = step.new.clone().expect("import steps carry a new state");
            let id = new
                .import_id
                .clone()
                .expect("import steps carry an import ID");
            let provider = resolve(ctx, step).await?;
            let read = call(urn, None, provider.read(urn, &id, &new.inputs, &new.outputs)).await?;
            let Some(read_id) = read.id else {
                return Err(EngineError::Provider {
                    urn: urn.clone(),
                    source: ProviderError::call(format!("no resource to import under `{id}`")),
                });
            };
            let check = call(urn, None, provider.check(urn, &read.inputs, &read.inputs)).await?;
            if !check.failures.is_empty() {
                return Err(EngineError::CheckFailed {
                    urn: urn.clone(),
                    failures: check.failures,
                });
            }
            let mut state = (*new).clone();
            state.id = Some(read_id);
            state.inputs = check.inputs;
            state.outputs = read.outputs;
            Ok((Some(Arc::new(state)), None))
        }
        StepOp::Refresh => {
            let old = step.old.clone().expect("refresh steps carry an old state");
            let Some(id) = old.id.clone() else {
                return Ok((Some(old), None));
            };
            let provider = resolve(ctx, step).await?;
            let read = call(urn, None, provider.read(urn, &id, &old.inputs, &old.outputs)).await?;
            // Partial failures land on the state's init errors; the
            // refresh itself does not fail.
            Ok((refreshed_state(&old, &read), None))
        }
        StepOp::Replace
        | StepOp::ReadDiscard
        | StepOp::DiscardReplaced
        | StepOp::RemovePendingReplace => Ok((None, None)),
    }
}

async fn resolve(ctx: &StepContext, step: &Step) -> Result<Arc<dyn Provider>, EngineError> {
    let reference = step
        .provider
        .as_ref()
        .ok_or_else(|| EngineError::invalid(format!("`{}` has no provider", step.urn)))?;
    ctx.registry.provider(reference).await.map_err(registry_error)
}

async fn call<T>(
    urn: &Urn,
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, EngineError> {
    let result = match timeout {
        None => fut.await,
        Some(timeout) => match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => return Err(EngineError::Timeout { urn: urn.clone() }),
        },
    };
    result.map_err(|source| provider_failure(urn, source))
}

fn provider_failure(urn: &Urn, source: ProviderError) -> EngineError {
    match source {
        ProviderError::Cancelled => EngineError::Cancelled,
        source => EngineError::Provider {
            urn: urn.clone(),
            source,
        },
    }
}

fn registry_error(error: RegistryError) -> EngineError {
    match error {
        RegistryError::Cancelled => EngineError::Cancelled,
        other => EngineError::ProviderUnavailable(other),
    }
}

fn partial_failure(
    urn: &Urn,
    status: ResultStatus,
    init_errors: Vec<String>,
) -> Option<EngineError> {
    match status {
        ResultStatus::Ok => None,
        ResultStatus::PartialFailure => Some(EngineError::PartialFailure {
            urn: urn.clone(),
            init_errors,
        }),
    }
}

fn parse_recorded_paths(raw: &[String]) -> Vec<keel_property::PropertyPath> {
    raw.iter().filter_map(|path| path.parse().ok()).collect()
}
