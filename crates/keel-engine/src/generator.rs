use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::debug;

use keel_property::{apply_ignore_changes, PropertyMap, PropertyPath};
use keel_provider::{DiffChanges, DiffResult, Provider};
use keel_registry::ProviderRegistry;
use keel_resource::{Goal, ProviderId, ProviderReference, ResourceState, Snapshot};
use keel_source::{OutputsRequest, ReadRequest, RegistrationRequest};
use keel_urn::{Type, Urn};

use crate::events::{DiagSeverity, EngineEvent, EventSink};
use crate::graph::dependent_closure;
use crate::step::{Step, StepChain, StepOp};
use crate::EngineError;

/// Turns registrations into step chains.
///
/// The generator is driven serially by the deployment driver, one source
/// event at a time, while the executor runs the produced chains
/// concurrently. It owns the bookkeeping that spans registrations: which
/// URNs have been seen, which prior states have been claimed, which
/// default providers have been injected, and which providers were replaced
/// this run.
pub(crate) struct StepGenerator {
    stack: String,
    project: String,
    registry: Arc<ProviderRegistry>,
    prior: Snapshot,
    events: EventSink,
    /// URNs produced by this deployment, for duplicate and parent checks.
    registered: FxHashSet<Urn>,
    /// Prior states claimed by a registration (by pointer identity).
    consumed: FxHashSet<usize>,
    /// Default providers already injected, by URN.
    defaults: FxHashMap<Urn, ProviderReference>,
    /// Provider resources replaced this run; their dependents are forced
    /// to replace as well.
    replaced_providers: FxHashSet<Urn>,
    /// States deleted ahead of re-registration by a delete-before-replace
    /// closure; their registrations complete the replacement.
    pending_creates: FxHashMap<Urn, Arc<ResourceState>>,
}

/// The chain generated for a goal, plus the reference a provider resource
/// will be reachable under once the chain executes.
struct GeneratedSteps {
    steps: Vec<Step>,
    provider_reference: Option<ProviderReference>,
}

impl StepGenerator {
    pub(crate) fn new(
        stack: impl Into<String>,
        project: impl Into<String>,
        registry: Arc<ProviderRegistry>,
        prior: Snapshot,
        events: EventSink,
    ) -> Self {
        Self {
            stack: stack.into(),
            project: project.into(),
            registry,
            prior,
            events,
            registered: FxHashSet::default(),
            consumed: FxHashSet::default(),
            defaults: FxHashMap::default(),
            replaced_providers: FxHashSet::default(),
            pending_creates: FxHashMap::default(),
        }
    }

    /// Handle one registration: generate (and submit) the steps for the
    /// resource, injecting its default provider first when needed.
    pub(crate) async fn register(
        &mut self,
        req: RegistrationRequest,
        intake: &mpsc::Sender<StepChain>,
    ) -> Result<(), EngineError> {
        let ty = Type::parse(req.ty.clone()).map_err(|err| EngineError::invalid(err.to_string()))?;
        let urn = self.urn_for(&ty, &req.name, req.parent.as_ref())?;
        debug!(urn = %urn, "registering resource");

        let ignore_changes = parse_paths(&req.ignore_changes)?;
        let explicit: Option<ProviderReference> = req
            .provider
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|err: keel_resource::SnapshotError| EngineError::invalid(err.to_string()))?;

        let provider = if req.custom && !ty.is_provider_type() {
            match explicit {
                Some(reference) => Some(reference),
                None => Some(
                    self.inject_default(req.package_descriptor(ty.package()), intake)
                        .await?,
                ),
            }
        } else {
            None
        };

        let mut goal = Goal::new(ty, req.name.clone(), req.custom);
        goal.parent = req.parent.clone();
        goal.protect = req.protect;
        goal.dependencies = req.dependencies.clone();
        goal.property_dependencies = req.property_dependencies.clone();
        goal.provider = provider.clone();
        goal.inputs = req.inputs.clone();
        goal.ignore_changes = ignore_changes;
        goal.aliases = req.aliases.clone();
        goal.import_id = req.import_id.clone();
        goal.custom_timeouts = req.custom_timeouts;
        goal.delete_before_replace = req.delete_before_replace;

        let old = self.resolve_old(&urn, &req.aliases);
        let generated = self.steps_for_goal(&urn, &goal, provider, old).await?;
        let mut chain = StepChain::new(generated.steps);
        chain.done = req.done;
        intake.send(chain).await.map_err(|_| EngineError::Cancelled)
    }

    /// Handle a read registration: observe an existing resource without
    /// managing it.
    pub(crate) async fn register_read(
        &mut self,
        req: ReadRequest,
        intake: &mpsc::Sender<StepChain>,
    ) -> Result<(), EngineError> {
        let ty = Type::parse(req.ty.clone()).map_err(|err| EngineError::invalid(err.to_string()))?;
        let urn = self.urn_for(&ty, &req.name, req.parent.as_ref())?;

        let explicit: Option<ProviderReference> = req
            .provider
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|err: keel_resource::SnapshotError| EngineError::invalid(err.to_string()))?;
        let provider = match explicit {
            Some(reference) => reference,
            None => {
                let mut descriptor = keel_resource::PackageDescriptor::package(ty.package());
                descriptor.version = req.version.clone();
                self.inject_default(descriptor, intake).await?
            }
        };

        let old = self.resolve_old(&urn, &[]);
        let mut new = ResourceState::new(urn.clone(), ty, true);
        new.id = Some(req.id.clone());
        new.external = true;
        new.inputs = req.inputs.clone();
        new.dependencies = req.dependencies.clone();
        new.parent = req.parent.clone();
        new.provider = Some(provider.clone());
        let new = Arc::new(new);

        let steps = match old {
            None => vec![Step::new(StepOp::Read, urn)
                .with_new(new)
                .with_provider(Some(provider))],
            Some(old) => {
                self.consumed.insert(ptr(&old));
                if old.id.as_ref() == Some(&req.id) {
                    vec![Step::new(StepOp::Read, urn)
                        .with_old(old)
                        .with_new(new)
                        .with_provider(Some(provider))]
                } else {
                    // The external resource's identity changed: read the
                    // new one, then discard the stale observation.
                    vec![
                        Step::new(StepOp::ReadReplacement, urn.clone())
                            .with_old(Arc::clone(&old))
                            .with_new(new)
                            .with_provider(Some(provider)),
                        Step::new(StepOp::DiscardReplaced, urn).with_old(old),
                    ]
                }
            }
        };
        let mut chain = StepChain::new(steps);
        chain.done = req.done;
        intake.send(chain).await.map_err(|_| EngineError::Cancelled)
    }

    /// The step carrying program-registered outputs to the journal.
    pub(crate) fn outputs_step(&self, req: &OutputsRequest) -> Arc<Step> {
        let mut state = ResourceState::new(req.urn.clone(), req.urn.ty(), false);
        state.outputs = req.outputs.clone();
        Arc::new(Step::new(StepOp::Same, req.urn.clone()).with_new(Arc::new(state)))
    }

    /// The program is done registering: plan deletions for everything in
    /// the prior snapshot that was not claimed, in reverse dependency
    /// order, and clear stale pending-replacement tombstones.
    pub(crate) fn end_of_source(&mut self) -> Result<Vec<StepChain>, EngineError> {
        let mut chains = Vec::new();
        for state in self.prior.resources.iter().rev() {
            if self.consumed.contains(&ptr(state)) {
                continue;
            }
            let step = if state.pending_replacement {
                Step::new(StepOp::RemovePendingReplace, state.urn.clone())
                    .with_old(Arc::clone(state))
            } else if state.delete {
                Step::new(StepOp::DeleteReplaced, state.urn.clone())
                    .with_old(Arc::clone(state))
                    .with_provider(state.provider.clone())
            } else {
                if state.protect {
                    return Err(EngineError::ProtectedResource(state.urn.clone()));
                }
                let op = if state.external {
                    StepOp::ReadDiscard
                } else {
                    StepOp::Delete
                };
                Step::new(op, state.urn.clone())
                    .with_old(Arc::clone(state))
                    .with_provider(state.provider.clone())
            };
            chains.push(StepChain::single(step));
        }
        Ok(chains)
    }

    fn urn_for(&mut self, ty: &Type, name: &str, parent: Option<&Urn>) -> Result<Urn, EngineError> {
        if name.is_empty() {
            return Err(EngineError::invalid("resource names may not be empty"));
        }
        let parent_type = match parent {
            None => None,
            Some(parent) => {
                if !self.registered.contains(parent) {
                    return Err(EngineError::invalid(format!("unknown parent `{parent}`")));
                }
                Some(parent.qualified_type())
            }
        };
        let urn = Urn::new(&self.stack, &self.project, parent_type.as_ref(), ty, name);
        if !self.registered.insert(urn.clone()) {
            return Err(EngineError::invalid(format!("duplicate resource URN `{urn}`")));
        }
        Ok(urn)
    }

    /// Walk the computed URN plus the registration's aliases and claim the
    /// first matching prior state.
    fn resolve_old(&self, urn: &Urn, aliases: &[Urn]) -> Option<Arc<ResourceState>> {
        std::iter::once(urn)
            .chain(aliases)
            .find_map(|candidate| self.find_prior(candidate))
    }

    fn find_prior(&self, urn: &Urn) -> Option<Arc<ResourceState>> {
        self.prior
            .resources
            .iter()
            .find(|state| !state.delete && &state.urn == urn && !self.consumed.contains(&ptr(state)))
            .map(Arc::clone)
    }

    /// Ensure the default provider for `descriptor` has been registered
    /// into the step stream, and return its reference.
    async fn inject_default(
        &mut self,
        descriptor: keel_resource::PackageDescriptor,
        intake: &mpsc::Sender<StepChain>,
    ) -> Result<ProviderReference, EngineError> {
        let (urn, goal) = self.registry.default_provider_goal(&descriptor);
        if let Some(reference) = self.defaults.get(&urn) {
            return Ok(reference.clone());
        }
        debug!(urn = %urn, "injecting default provider");
        self.registered.insert(urn.clone());
        // Any prior default for the package answers this one: a change of
        // pin is an identity switch, not a replacement, so resources stay
        // attached to their old default until re-registered.
        let old = self
            .find_prior(&urn)
            .or_else(|| self.find_prior_default(&descriptor.package));
        let generated = self.steps_for_goal(&urn, &goal, None, old).await?;
        let reference = generated
            .provider_reference
            .clone()
            .expect("provider goals always yield a reference");
        self.defaults.insert(urn, reference.clone());
        intake
            .send(StepChain::new(generated.steps))
            .await
            .map_err(|_| EngineError::Cancelled)?;
        Ok(reference)
    }

    fn find_prior_default(&self, package: &str) -> Option<Arc<ResourceState>> {
        self.prior
            .resources
            .iter()
            .find(|state| {
                !state.delete
                    && !self.consumed.contains(&ptr(state))
                    && state.ty.provider_package() == Some(package)
                    && state.urn.name().starts_with("default")
            })
            .map(Arc::clone)
    }

    /// The heart of step generation: decide what has to happen to drive
    /// one resource from its prior state to its goal.
    async fn steps_for_goal(
        &mut self,
        urn: &Urn,
        goal: &Goal,
        provider: Option<ProviderReference>,
        old: Option<Arc<ResourceState>>,
    ) -> Result<GeneratedSteps, EngineError> {
        let is_provider = goal.ty.is_provider_type();

        // Check: providers apply defaults and validate before anything
        // else sees the inputs.
        let empty = PropertyMap::new();
        let inputs = if goal.custom && !is_provider {
            let reference = provider.as_ref().expect("custom resources carry a provider");
            let instance = self.registry.provider(reference).await?;
            let olds = old.as_ref().map_or(&empty, |state| &state.inputs);
            let check = instance
                .check(urn, olds, &goal.inputs)
                .await
                .map_err(|source| EngineError::Provider {
                    urn: urn.clone(),
                    source,
                })?;
            if !check.failures.is_empty() {
                for failure in &check.failures {
                    self.events.send(EngineEvent::Diag {
                        severity: DiagSeverity::Error,
                        urn: Some(urn.clone()),
                        message: match &failure.property {
                            Some(property) => format!("{property}: {}", failure.reason),
                            None => failure.reason.clone(),
                        },
                    });
                }
                return Err(EngineError::CheckFailed {
                    urn: urn.clone(),
                    failures: check.failures,
                });
            }
            check.inputs
        } else {
            goal.inputs.clone()
        };

        if let Some(old) = &old {
            self.consumed.insert(ptr(old));
        }

        // Imports adopt existing resources rather than diffing them.
        if goal.import_id.is_some() && !is_provider {
            let new = Arc::new(self.make_state(urn, goal, inputs, provider.clone(), None, PropertyMap::new()));
            let op = if old.is_some() {
                StepOp::ImportReplacement
            } else {
                StepOp::Import
            };
            let mut step = Step::new(op, urn.clone()).with_new(new).with_provider(provider);
            if let Some(old) = old {
                step = step.with_old(old);
            }
            return Ok(GeneratedSteps {
                steps: vec![step],
                provider_reference: None,
            });
        }

        // A delete-before-replace closure already deleted this state; the
        // registration completes the replacement.
        if let Some(deleted) = self.pending_creates.remove(urn) {
            let reference = self.provider_reference_for(urn, None, is_provider)?;
            let new = Arc::new(self.make_state(
                urn,
                goal,
                inputs,
                provider.clone(),
                None,
                PropertyMap::new(),
            ));
            return Ok(GeneratedSteps {
                steps: vec![Step::new(StepOp::CreateReplacement, urn.clone())
                    .with_old(deleted)
                    .with_new(new)
                    .with_provider(provider)],
                provider_reference: reference,
            });
        }

        let Some(old) = old else {
            // No prior state: create.
            let reference = self.provider_reference_for(urn, None, is_provider)?;
            let new = Arc::new(self.make_state(
                urn,
                goal,
                inputs,
                provider.clone(),
                None,
                PropertyMap::new(),
            ));
            return Ok(GeneratedSteps {
                steps: vec![Step::new(StepOp::Create, urn.clone())
                    .with_new(new)
                    .with_provider(provider)],
                provider_reference: reference,
            });
        };

        // Replacing a provider forces every dependent to replace,
        // regardless of its own diff.
        let forced = !is_provider
            && goal.custom
            && old
                .provider
                .as_ref()
                .is_some_and(|reference| self.replaced_providers.contains(&reference.urn));

        let diff = if forced {
            DiffResult {
                changes: DiffChanges::Some,
                replace_keys: vec!["provider".into()],
                ..DiffResult::none()
            }
        } else {
            self.diff_goal(urn, goal, &old, &inputs, provider.as_ref()).await?
        };

        if let DiffChanges::Unknown(reason) = &diff.changes {
            self.events.send(EngineEvent::Diag {
                severity: DiagSeverity::Warning,
                urn: Some(urn.clone()),
                message: format!("the provider could not compute a diff: {reason}"),
            });
        }

        let replacing = diff.requires_replacement();
        if !diff.has_changes() {
            // Same; the carried-forward state still picks up the new
            // provider reference and dependency set.
            let reference =
                self.provider_reference_for(urn, old.id.as_ref().map(|id| id.as_str()), is_provider)?;
            let new = Arc::new(self.make_state(
                urn,
                goal,
                inputs,
                provider.clone(),
                old.id.clone(),
                old.outputs.clone(),
            ));
            return Ok(GeneratedSteps {
                steps: vec![Step::new(StepOp::Same, urn.clone())
                    .with_old(old)
                    .with_new(new)
                    .with_provider(provider)],
                provider_reference: reference,
            });
        }

        if !replacing {
            let reference =
                self.provider_reference_for(urn, old.id.as_ref().map(|id| id.as_str()), is_provider)?;
            let new = Arc::new(self.make_state(
                urn,
                goal,
                inputs,
                provider.clone(),
                old.id.clone(),
                old.outputs.clone(),
            ));
            let mut step = Step::new(StepOp::Update, urn.clone())
                .with_old(old)
                .with_new(new)
                .with_provider(provider);
            step.diff_keys = diff.changed_keys.clone();
            step.detailed_diff = diff.detailed_diff.clone();
            return Ok(GeneratedSteps {
                steps: vec![step],
                provider_reference: reference,
            });
        }

        // Replacement.
        if old.protect {
            return Err(EngineError::ProtectedResource(urn.clone()));
        }
        if is_provider {
            self.replaced_providers.insert(urn.clone());
        }
        let reference = self.provider_reference_for(urn, None, is_provider)?;
        let new = Arc::new(self.make_state(
            urn,
            goal,
            inputs,
            provider.clone(),
            None,
            PropertyMap::new(),
        ));
        let delete_first =
            diff.delete_before_replace || goal.delete_before_replace.unwrap_or(false);

        let steps = if delete_first {
            // Everything transitively dependent on this resource has to go
            // first, in reverse dependency order; each comes back when its
            // own registration arrives.
            let closure: Vec<Arc<ResourceState>> = dependent_closure(&self.prior, &[urn.clone()])
                .into_iter()
                .filter(|state| !self.consumed.contains(&ptr(state)))
                .collect();
            let mut steps = Vec::with_capacity(closure.len() + 2);
            for dependent in closure.iter().rev() {
                self.consumed.insert(ptr(dependent));
                self.pending_creates
                    .insert(dependent.urn.clone(), Arc::clone(dependent));
                let mut step = Step::new(StepOp::DeleteReplaced, dependent.urn.clone())
                    .with_old(Arc::clone(dependent))
                    .with_provider(dependent.provider.clone());
                step.pending_replace = true;
                steps.push(step);
            }
            let mut delete = Step::new(StepOp::DeleteReplaced, urn.clone())
                .with_old(Arc::clone(&old))
                .with_provider(old.provider.clone());
            delete.pending_replace = true;
            steps.push(delete);
            let mut create = Step::new(StepOp::CreateReplacement, urn.clone())
                .with_old(old)
                .with_new(new)
                .with_provider(provider);
            create.replace_keys = diff.replace_keys.clone();
            create.detailed_diff = diff.detailed_diff.clone();
            steps.push(create);
            steps
        } else {
            let mut create = Step::new(StepOp::CreateReplacement, urn.clone())
                .with_old(Arc::clone(&old))
                .with_new(Arc::clone(&new))
                .with_provider(provider.clone());
            create.replace_keys = diff.replace_keys.clone();
            create.detailed_diff = diff.detailed_diff.clone();
            let pivot = Step::new(StepOp::Replace, urn.clone())
                .with_old(Arc::clone(&old))
                .with_new(new);
            let delete = Step::new(StepOp::DeleteReplaced, urn.clone())
                .with_old(old.clone())
                .with_provider(old.provider.clone());
            vec![create, pivot, delete]
        };
        Ok(GeneratedSteps {
            steps,
            provider_reference: reference,
        })
    }

    async fn diff_goal(
        &self,
        urn: &Urn,
        goal: &Goal,
        old: &Arc<ResourceState>,
        inputs: &PropertyMap,
        provider: Option<&ProviderReference>,
    ) -> Result<DiffResult, EngineError> {
        // Rewrite ignored paths before the provider ever sees the delta.
        let news = apply_ignore_changes(&old.inputs, inputs, &goal.ignore_changes)
            .map_err(|err| EngineError::invalid(err.to_string()))?;
        if goal.ty.is_provider_type() {
            return Provider::diff_config(
                self.registry.as_ref(),
                urn,
                &old.inputs,
                &news,
                &goal.ignore_changes,
            )
            .await
            .map_err(|source| EngineError::Provider {
                urn: urn.clone(),
                source,
            });
        }
        if !goal.custom {
            return DiffResult::from_maps(&old.inputs, &news, &goal.ignore_changes)
                .map_err(|err| EngineError::invalid(err.to_string()));
        }
        let reference = provider.expect("custom resources carry a provider");
        let instance = self.registry.provider(reference).await?;
        let id = old.id.clone().unwrap_or_else(keel_resource::ResourceId::unknown);
        instance
            .diff(urn, &id, &old.inputs, &news, &goal.ignore_changes)
            .await
            .map_err(|source| EngineError::Provider {
                urn: urn.clone(),
                source,
            })
    }

    /// The reference a provider resource will be reachable under: the
    /// carried-forward ID for same/update, a freshly reserved one for
    /// create and replace.
    fn provider_reference_for(
        &self,
        urn: &Urn,
        existing_id: Option<&str>,
        is_provider: bool,
    ) -> Result<Option<ProviderReference>, EngineError> {
        if !is_provider {
            return Ok(None);
        }
        let reference = match existing_id {
            Some(id) => {
                let reference = ProviderReference {
                    urn: urn.clone(),
                    id: ProviderId::new(id),
                };
                self.registry.expect_reference(&reference);
                reference
            }
            None => self.registry.reserve_reference(urn)?,
        };
        Ok(Some(reference))
    }

    fn make_state(
        &self,
        urn: &Urn,
        goal: &Goal,
        inputs: PropertyMap,
        provider: Option<ProviderReference>,
        id: Option<keel_resource::ResourceId>,
        outputs: PropertyMap,
    ) -> ResourceState {
        let mut state = ResourceState::new(urn.clone(), goal.ty.clone(), goal.custom);
        state.id = id;
        state.inputs = inputs;
        state.outputs = outputs;
        state.provider = provider;
        state.parent = goal.parent.clone();
        state.dependencies = goal.dependencies.clone();
        // Languages that cannot report per-property dependencies get a
        // conservative shim: every input property depends on everything
        // the resource depends on.
        state.property_dependencies = if goal.property_dependencies.is_empty()
            && !goal.dependencies.is_empty()
        {
            state
                .inputs
                .keys()
                .map(|key| (key.clone(), goal.dependencies.clone()))
                .collect()
        } else {
            goal.property_dependencies.clone()
        };
        state.protect = goal.protect;
        state.aliases = goal.aliases.clone();
        state.custom_timeouts = goal.custom_timeouts;
        state.import_id = goal.import_id.clone();
        state.ignore_changes = goal
            .ignore_changes
            .iter()
            .map(|path| path.to_string())
            .collect();
        state
    }
}

fn parse_paths(raw: &[String]) -> Result<Vec<PropertyPath>, EngineError> {
    raw.iter()
        .map(|path| {
            path.parse()
                .map_err(|err: keel_property::PropertyError| EngineError::invalid(err.to_string()))
        })
        .collect()
}

fn ptr(state: &Arc<ResourceState>) -> usize {
    Arc::as_ptr(state) as usize
}
