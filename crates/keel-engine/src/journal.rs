use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use keel_resource::{OperationKind, PendingOperation, ResourceState, Snapshot};

use crate::manager::{Mutation, SnapshotManager, StepOutcome};
use crate::persist::SnapshotPersister;
use crate::step::{Step, StepOp};
use crate::JournalError;

/// One record on the append-only log.
#[derive(Debug, Clone)]
enum Entry {
    Begin(Arc<Step>),
    Success {
        step: Arc<Step>,
        state: Option<Arc<ResourceState>>,
    },
    Failure(Arc<Step>),
    /// Program-registered outputs for `step.urn`, carried on `step.new`.
    Outputs(Arc<Step>),
}

enum Command {
    Entry(Entry, oneshot::Sender<Result<(), JournalError>>),
    /// Replace the base snapshot and the log with a fresh base.
    Write(Snapshot, oneshot::Sender<Result<(), JournalError>>),
}

struct JournalState {
    base: Snapshot,
    entries: Vec<Entry>,
    corrupt: Option<JournalError>,
}

/// The append-only snapshot journal.
///
/// Executor workers emit entries concurrently; a single drain task orders
/// them, appends them to the log, and hands the reconstructed snapshot to
/// the persister after every entry. Workers block only until their entry
/// is durably recorded; independent provider calls continue in parallel
/// with persistence.
pub struct Journal {
    tx: Mutex<Option<mpsc::Sender<Command>>>,
    state: Arc<Mutex<JournalState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Journal {
    /// Channel capacity for in-flight entries; writers block, not fail,
    /// when the persister falls behind.
    const BUFFER: usize = 128;

    pub fn new(base: Snapshot, persister: Arc<dyn SnapshotPersister>) -> Self {
        let (tx, rx) = mpsc::channel(Self::BUFFER);
        let state = Arc::new(Mutex::new(JournalState {
            base,
            entries: Vec::new(),
            corrupt: None,
        }));
        let worker = tokio::spawn(drain(rx, Arc::clone(&state), persister));
        Self {
            tx: Mutex::new(Some(tx)),
            state,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Reconstruct the snapshot as of the latest recorded entry.
    pub fn snap(&self) -> Snapshot {
        let state = self.state.lock().unwrap();
        reconstruct(&state.base, &state.entries)
    }

    /// Stop the drain task and return the final snapshot. Fails if any
    /// entry could not be persisted.
    pub async fn into_snapshot(self) -> Result<Snapshot, JournalError> {
        self.close().await?;
        Ok(self.snap())
    }

    async fn record(&self, entry: Entry) -> Result<(), JournalError> {
        let tx = {
            let guard = self.tx.lock().unwrap();
            guard.clone().ok_or(JournalError::Closed)?
        };
        let (ack, done) = oneshot::channel();
        tx.send(Command::Entry(entry, ack))
            .await
            .map_err(|_| JournalError::Closed)?;
        done.await.map_err(|_| JournalError::Closed)?
    }
}

#[async_trait]
impl SnapshotManager for Journal {
    async fn begin_mutation(&self, step: Arc<Step>) -> Result<Box<dyn Mutation>, JournalError> {
        self.record(Entry::Begin(Arc::clone(&step))).await?;
        Ok(Box::new(JournalMutation {
            journal_tx: self.tx.lock().unwrap().clone(),
            step,
        }))
    }

    async fn register_resource_outputs(&self, step: Arc<Step>) -> Result<(), JournalError> {
        self.record(Entry::Outputs(step)).await
    }

    async fn write(&self, snapshot: Snapshot) -> Result<(), JournalError> {
        let tx = {
            let guard = self.tx.lock().unwrap();
            guard.clone().ok_or(JournalError::Closed)?
        };
        let (ack, done) = oneshot::channel();
        tx.send(Command::Write(snapshot, ack))
            .await
            .map_err(|_| JournalError::Closed)?;
        done.await.map_err(|_| JournalError::Closed)?
    }

    async fn rebuilt_base_state(&self) -> Result<(), JournalError> {
        self.snap()
            .verify_integrity()
            .map_err(|err| JournalError::Integrity(err.to_string()))
    }

    async fn close(&self) -> Result<(), JournalError> {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        match &self.state.lock().unwrap().corrupt {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

struct JournalMutation {
    journal_tx: Option<mpsc::Sender<Command>>,
    step: Arc<Step>,
}

#[async_trait]
impl Mutation for JournalMutation {
    async fn end(self: Box<Self>, outcome: StepOutcome) -> Result<(), JournalError> {
        let JournalMutation { journal_tx, step } = *self;
        let entry = match outcome {
            StepOutcome::Success { state } => Entry::Success { step, state },
            StepOutcome::Failure => Entry::Failure(step),
        };
        let tx = journal_tx.ok_or(JournalError::Closed)?;
        let (ack, done) = oneshot::channel();
        tx.send(Command::Entry(entry, ack))
            .await
            .map_err(|_| JournalError::Closed)?;
        done.await.map_err(|_| JournalError::Closed)?
    }
}

/// The single background task that orders entries and persists after each.
async fn drain(
    mut rx: mpsc::Receiver<Command>,
    state: Arc<Mutex<JournalState>>,
    persister: Arc<dyn SnapshotPersister>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Entry(entry, ack) => {
                let snapshot = {
                    let mut guard = state.lock().unwrap();
                    if let Some(corrupt) = &guard.corrupt {
                        let _ = ack.send(Err(corrupt.clone()));
                        continue;
                    }
                    guard.entries.push(entry);
                    reconstruct(&guard.base, &guard.entries)
                };
                let result = persister.save(&snapshot).await;
                if let Err(error) = &result {
                    warn!(%error, "snapshot persist failed; journal is corrupt");
                    state.lock().unwrap().corrupt = Some(error.clone());
                }
                let _ = ack.send(result);
            }
            Command::Write(snapshot, ack) => {
                let result = persister.save(&snapshot).await;
                match &result {
                    Ok(()) => {
                        let mut guard = state.lock().unwrap();
                        guard.base = snapshot;
                        guard.entries.clear();
                        debug!("journal rebased onto written snapshot");
                    }
                    Err(error) => {
                        state.lock().unwrap().corrupt = Some(error.clone());
                    }
                }
                let _ = ack.send(result);
            }
        }
    }
}

fn pending_kind(op: StepOp) -> Option<OperationKind> {
    match op {
        StepOp::Create | StepOp::CreateReplacement => Some(OperationKind::Creating),
        StepOp::Update => Some(OperationKind::Updating),
        StepOp::Delete | StepOp::DeleteReplaced => Some(OperationKind::Deleting),
        StepOp::Read | StepOp::ReadReplacement | StepOp::Refresh => Some(OperationKind::Reading),
        StepOp::Import | StepOp::ImportReplacement => Some(OperationKind::Importing),
        StepOp::Same
        | StepOp::Replace
        | StepOp::ReadDiscard
        | StepOp::DiscardReplaced
        | StepOp::RemovePendingReplace => None,
    }
}

fn pending_state(step: &Step) -> Option<Arc<ResourceState>> {
    match step.op {
        StepOp::Delete | StepOp::DeleteReplaced | StepOp::Refresh => step.old.clone(),
        _ => step.new.clone().or_else(|| step.old.clone()),
    }
}

fn ptr(state: &Arc<ResourceState>) -> usize {
    Arc::as_ptr(state) as usize
}

/// Replay the log over `base`: maintain the ordered list of live states,
/// the set of retired old states, and the operations begun but not ended;
/// finish by carrying forward every base state that was not retired.
fn reconstruct(base: &Snapshot, entries: &[Entry]) -> Snapshot {
    let mut resources: Vec<Arc<ResourceState>> = Vec::new();
    let mut dones: rustc_hash::FxHashSet<usize> = rustc_hash::FxHashSet::default();
    let mut pending: FxHashMap<usize, PendingOperation> = FxHashMap::default();

    for entry in entries {
        match entry {
            Entry::Begin(step) => {
                if let (Some(kind), Some(state)) = (pending_kind(step.op), pending_state(step)) {
                    pending.insert(
                        Arc::as_ptr(step) as usize,
                        PendingOperation {
                            resource: state,
                            kind,
                        },
                    );
                }
            }
            Entry::Success { step, state } => {
                pending.remove(&(Arc::as_ptr(step) as usize));
                apply_success(step, state.clone(), &mut resources, &mut dones);
            }
            // The mutation did not complete: the old state is carried
            // forward untouched and the begun operation stays pending.
            Entry::Failure(_) => {}
            Entry::Outputs(step) => {
                if let Some(new) = &step.new {
                    let updated = resources
                        .iter()
                        .rposition(|state| state.urn == step.urn && !state.delete);
                    if let Some(at) = updated {
                        let mut merged = (*resources[at]).clone();
                        merged.outputs = new.outputs.clone();
                        resources[at] = Arc::new(merged);
                    }
                    // No live state: the step failed or never ran; the
                    // outputs are dropped.
                }
            }
        }
    }

    let mut result = base.clone();
    result.resources = resources;
    for state in &base.resources {
        if !dones.contains(&ptr(state)) {
            result.resources.push(Arc::clone(state));
        }
    }
    result.pending_operations = pending.into_values().collect();
    result
        .pending_operations
        .sort_by(|a, b| a.resource.urn.cmp(&b.resource.urn));
    result
}


fn apply_success(
    step: &Arc<Step>,
    state: Option<Arc<ResourceState>>,
    resources: &mut Vec<Arc<ResourceState>>,
    dones: &mut rustc_hash::FxHashSet<usize>,
) {
    match step.op {
        StepOp::Replace => {}
        op if op.is_deletion() => {
            if let Some(old) = &step.old {
                dones.insert(ptr(old));
                if step.pending_replace {
                    // Delete-before-replace: the retired state lingers as a
                    // pending-replacement tombstone until the matching
                    // create lands.
                    let mut tombstone = (**old).clone();
                    tombstone.delete = true;
                    tombstone.pending_replacement = true;
                    resources.push(Arc::new(tombstone));
                } else if let Some(at) = resources
                    .iter()
                    .position(|r| Arc::ptr_eq(r, old) || (r.urn == old.urn && r.delete))
                {
                    // Drop the in-log twin as well: a pushed pending-delete
                    // tombstone for a create-before-delete replacement, or
                    // the state itself if this log both created and deleted
                    // it.
                    resources.remove(at);
                }
            }
        }
        StepOp::CreateReplacement => {
            // The create completes any pending replacement for this URN.
            if let Some(at) = resources
                .iter()
                .position(|r| r.urn == step.urn && r.delete && r.pending_replacement)
            {
                resources.remove(at);
            }
            if let Some(old) = &step.old {
                // Create-before-delete: the outgoing state lingers as a
                // pending-delete tombstone until its DeleteReplaced lands.
                if dones.insert(ptr(old)) {
                    let mut tombstone = (**old).clone();
                    tombstone.delete = true;
                    resources.push(Arc::new(tombstone));
                }
            }
            if let Some(state) = state {
                resources.push(state);
            }
        }
        StepOp::Refresh => {
            if let Some(old) = &step.old {
                dones.insert(ptr(old));
            }
            if let Some(state) = state {
                resources.push(state);
            }
        }
        _ => {
            if let Some(old) = &step.old {
                dones.insert(ptr(old));
            }
            if let Some(state) = state {
                resources.push(state);
            }
        }
    }
}
