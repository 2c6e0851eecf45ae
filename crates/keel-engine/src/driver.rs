use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument, warn};

use keel_provider::ProviderHost;
use keel_registry::{ProviderRegistry, RegistryError};
use keel_resource::{SecretsConfig, Snapshot};
use keel_source::{Source, SourceEvent};

use crate::events::{EngineEvent, EventSink, StepOpCounts};
use crate::executor::{self, ExecutorContext, ExecutorResult};
use crate::generator::StepGenerator;
use crate::journal::Journal;
use crate::manager::{CombinedManager, SnapshotManager};
use crate::options::{DeploymentMode, DeploymentOptions};
use crate::persist::{InMemoryPersister, SnapshotPersister};
use crate::step::StepChain;
use crate::{destroy, refresh, EngineError};

/// Validates that persisted secrets configuration is usable before any
/// step runs; actual decryption belongs to the configuration layer.
pub trait SecretsDecrypter: Send + Sync {
    fn check(&self, config: &SecretsConfig) -> Result<(), String>;
}

/// How a deployment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug)]
pub struct DeploymentResult {
    /// The post-deployment snapshot, as reconstructed from the journal.
    pub snapshot: Snapshot,
    /// Success counts by step operation.
    pub counts: StepOpCounts,
    pub duration: Duration,
    pub outcome: Outcome,
    /// Every step or generation error observed, in completion order.
    pub errors: Vec<EngineError>,
}

/// One deployment, driven to completion or cancellation.
///
/// Construction wires the collaborators; [`Deployment::run`] owns the
/// lifecycle: gate checks, provider registry warm-up from the prior
/// snapshot, the source pump feeding the step generator, the executor, and
/// the journal teardown that yields the final snapshot.
pub struct Deployment {
    host: Arc<dyn ProviderHost>,
    prior: Snapshot,
    options: DeploymentOptions,
    source: Option<Box<dyn Source>>,
    persister: Arc<dyn SnapshotPersister>,
    mirror: Option<Arc<dyn SnapshotManager>>,
    events: EventSink,
    decrypter: Option<Arc<dyn SecretsDecrypter>>,
}

impl Deployment {
    pub fn new(host: Arc<dyn ProviderHost>, prior: Snapshot, options: DeploymentOptions) -> Self {
        Self {
            host,
            prior,
            options,
            source: None,
            persister: Arc::new(InMemoryPersister::new()),
            mirror: None,
            events: EventSink::discard(),
            decrypter: None,
        }
    }

    /// The program whose registrations drive an update or preview.
    #[must_use]
    pub fn with_source(mut self, source: impl Source + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn with_persister(mut self, persister: Arc<dyn SnapshotPersister>) -> Self {
        self.persister = persister;
        self
    }

    /// Mirror every journal entry into a secondary manager whose failures
    /// are collected rather than fatal.
    #[must_use]
    pub fn with_mirror(mut self, mirror: Arc<dyn SnapshotManager>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_decrypter(mut self, decrypter: Arc<dyn SecretsDecrypter>) -> Self {
        self.decrypter = Some(decrypter);
        self
    }

    /// A cancellation pair for [`Deployment::run`]; send `true` to cancel.
    pub fn cancellation() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    /// Run the deployment to completion, cancellation, or failure.
    ///
    /// Pre-flight failures (integrity, pending operations, decryption,
    /// protected destroy) return `Err` before any step executes; anything
    /// later is reported through [`DeploymentResult::outcome`] so the
    /// caller still receives the snapshot the journal reconstructed.
    #[instrument(skip_all, fields(mode = ?self.options.mode, stack = %self.options.stack, project = %self.options.project))]
    pub async fn run(mut self, cancel: watch::Receiver<bool>) -> Result<DeploymentResult, EngineError> {
        let start = Instant::now();
        let mode = self.options.mode;

        self.prior.verify_integrity()?;
        if mode == DeploymentMode::Update && !self.prior.pending_operations.is_empty() {
            return Err(EngineError::PendingOperations(
                self.prior.pending_operations.len(),
            ));
        }
        if let (Some(decrypter), Some(config)) = (&self.decrypter, &self.prior.secrets) {
            decrypter
                .check(config)
                .map_err(EngineError::DecryptFailed)?;
        }
        // Destroy refuses protected resources before anything executes.
        let destroy_chains = if mode == DeploymentMode::Destroy {
            Some(destroy::plan(&self.prior)?)
        } else {
            None
        };

        self.events.send(EngineEvent::Prelude {
            mode,
            resources_in_snapshot: self.prior.resources.len(),
        });

        let registry = Arc::new(ProviderRegistry::new(
            Arc::clone(&self.host),
            &self.options.stack,
            &self.options.project,
            mode.dry_run(),
        ));
        registry
            .load_prior_state(&self.prior)
            .await
            .map_err(EngineError::ProviderUnavailable)?;

        // Previews never touch real storage.
        let persister: Arc<dyn SnapshotPersister> = if mode.dry_run() {
            Arc::new(InMemoryPersister::new())
        } else {
            Arc::clone(&self.persister)
        };
        let journal = Arc::new(Journal::new(self.prior.clone(), persister));
        let manager: Arc<dyn SnapshotManager> = match &self.mirror {
            None => Arc::clone(&journal) as Arc<dyn SnapshotManager>,
            Some(mirror) => Arc::new(
                CombinedManager::new()
                    .with_manager(Arc::clone(&journal) as Arc<dyn SnapshotManager>)
                    .with_collect_only(Arc::clone(mirror)),
            ),
        };

        let (aborted_tx, aborted_rx) = watch::channel(false);
        let (intake, executor) = executor::start(ExecutorContext {
            registry: Arc::clone(&registry),
            manager: Arc::clone(&manager),
            events: self.events.clone(),
            parallel: self.options.parallel,
            continue_on_error: self.options.continue_on_error,
            dry_run: mode.dry_run(),
            cancel: cancel.clone(),
            aborted: aborted_tx,
        });

        let mut soft_errors: Vec<EngineError> = Vec::new();
        let planning = match mode {
            DeploymentMode::Update | DeploymentMode::Preview => {
                self.pump_source(
                    Arc::clone(&registry),
                    Arc::clone(&manager),
                    &intake,
                    cancel.clone(),
                    aborted_rx,
                    &mut soft_errors,
                )
                .await
            }
            DeploymentMode::Refresh => {
                let chains = refresh::plan(&self.prior, self.options.refresh_targets.as_ref());
                send_all(&intake, chains).await
            }
            DeploymentMode::Destroy => {
                send_all(&intake, destroy_chains.unwrap_or_default()).await
            }
        };
        drop(intake);

        let exec = match executor.await {
            Ok(exec) => exec,
            Err(join_error) => {
                warn!(%join_error, "executor task failed");
                let mut exec = ExecutorResult::default();
                exec.errors.push(EngineError::invalid(join_error.to_string()));
                exec
            }
        };

        let cancelled = exec.cancelled || *cancel.borrow();
        if cancelled {
            // Two cancellation scopes: the deployment's, observed above,
            // and each provider's own, which `cancel_all` enters and which
            // an in-flight `Provider::cancel` finishes on its own clock.
            registry.cancel_all();
        }

        let mut corrupt = exec.corrupt.clone();
        if mode == DeploymentMode::Refresh && corrupt.is_none() {
            let reconstructed = journal.snap();
            let pruned = refresh::prune_dangling_references(&reconstructed, &self.prior);
            if pruned != reconstructed {
                debug!("rewriting refreshed snapshot to drop dangling references");
                if let Err(error) = manager.write(pruned).await {
                    corrupt = Some(error);
                }
            }
            if corrupt.is_none() {
                if let Err(error) = manager.rebuilt_base_state().await {
                    corrupt = Some(error);
                }
            }
        }
        if let Err(error) = manager.close().await {
            corrupt.get_or_insert(error);
        }
        if let Some(corrupt) = corrupt {
            return Err(EngineError::Corrupt(corrupt));
        }

        let snapshot = journal.snap();
        snapshot.verify_integrity()?;

        let mut errors = soft_errors;
        errors.extend(exec.errors);
        let planning_error = match planning {
            Ok(()) => None,
            Err(EngineError::Cancelled) => None,
            Err(error) => Some(error),
        };
        if let Some(error) = planning_error {
            errors.push(error);
        }
        let outcome = if cancelled {
            Outcome::Cancelled
        } else if errors.is_empty() {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        };

        let duration = start.elapsed();
        self.events.send(EngineEvent::Summary {
            counts: exec.counts.clone(),
            duration,
        });
        debug!(?outcome, steps = exec.counts.values().sum::<usize>(), "deployment finished");

        Ok(DeploymentResult {
            snapshot,
            counts: exec.counts,
            duration,
            outcome,
            errors,
        })
    }

    /// Drive the source to exhaustion, feeding the generator and
    /// forwarding its chains to the executor; at end-of-program, plan
    /// deletions for everything the program no longer wants.
    async fn pump_source(
        &mut self,
        registry: Arc<ProviderRegistry>,
        manager: Arc<dyn SnapshotManager>,
        intake: &mpsc::Sender<StepChain>,
        mut cancel: watch::Receiver<bool>,
        mut aborted: watch::Receiver<bool>,
        soft_errors: &mut Vec<EngineError>,
    ) -> Result<(), EngineError> {
        let mut source = self
            .source
            .take()
            .ok_or_else(|| EngineError::invalid("updates require a source"))?;
        let mut generator = StepGenerator::new(
            &self.options.stack,
            &self.options.project,
            registry,
            self.prior.clone(),
            self.events.clone(),
        );

        loop {
            let event = tokio::select! {
                event = source.next() => event?,
                changed = cancel.changed() => {
                    if changed.is_ok() && *cancel.borrow() {
                        return Err(EngineError::Cancelled);
                    }
                    continue;
                }
                changed = aborted.changed() => {
                    // The executor stopped accepting chains; planning more
                    // work is pointless.
                    if changed.is_err() || *aborted.borrow() {
                        return Ok(());
                    }
                    continue;
                }
            };
            let Some(event) = event else {
                break;
            };
            let handled = match event {
                SourceEvent::RegisterResource(req) => generator.register(req, intake).await,
                SourceEvent::ReadResource(req) => generator.register_read(req, intake).await,
                SourceEvent::RegisterOutputs(req) => manager
                    .register_resource_outputs(generator.outputs_step(&req))
                    .await
                    .map_err(EngineError::Corrupt),
            };
            match handled {
                Ok(()) => {}
                Err(error @ (EngineError::Cancelled | EngineError::Corrupt(_))) => {
                    return Err(error);
                }
                Err(error) if self.options.continue_on_error => {
                    self.events.send(EngineEvent::Diag {
                        severity: crate::events::DiagSeverity::Error,
                        urn: None,
                        message: error.to_string(),
                    });
                    soft_errors.push(error);
                }
                Err(error) => return Err(error),
            }
        }

        for chain in generator.end_of_source()? {
            intake.send(chain).await.map_err(|_| EngineError::Cancelled)?;
        }
        Ok(())
    }
}

async fn send_all(
    intake: &mpsc::Sender<StepChain>,
    chains: Vec<StepChain>,
) -> Result<(), EngineError> {
    for chain in chains {
        intake.send(chain).await.map_err(|_| EngineError::Cancelled)?;
    }
    Ok(())
}

impl From<RegistryError> for EngineError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::Cancelled => EngineError::Cancelled,
            other => EngineError::ProviderUnavailable(other),
        }
    }
}
