use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use keel_resource::{ResourceState, Snapshot};

use crate::step::Step;
use crate::JournalError;

/// How a step ended, as far as the snapshot is concerned.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The mutation completed; `state` is the resource's final state, or
    /// `None` for deletions (and refreshes that discovered a deletion).
    Success { state: Option<Arc<ResourceState>> },
    /// The mutation did not complete. The old state is carried forward and
    /// the begun operation stays pending.
    Failure,
}

/// An open mutation: the begin entry has been recorded, the provider call
/// may proceed, and exactly one `end` must follow.
#[async_trait]
pub trait Mutation: Send {
    async fn end(self: Box<Self>, outcome: StepOutcome) -> Result<(), JournalError>;
}

/// What the engine sees of snapshot persistence.
///
/// The canonical implementation is the [`Journal`](crate::Journal);
/// [`CombinedManager`] fans out to several managers, and
/// [`RoutingManager`] partitions steps by project for multi-stack
/// deployments.
#[async_trait]
pub trait SnapshotManager: Send + Sync {
    /// Record the begin entry for `step` and return the open mutation.
    /// Failure here is fatal: the deployment is marked corrupt.
    async fn begin_mutation(&self, step: Arc<Step>) -> Result<Box<dyn Mutation>, JournalError>;

    /// Merge program-registered outputs (carried on `step.new`) into the
    /// step's resource. Outputs for resources whose step failed are
    /// silently dropped.
    async fn register_resource_outputs(&self, step: Arc<Step>) -> Result<(), JournalError>;

    /// Persist `snapshot` as the new base, superseding the journal so far.
    async fn write(&self, snapshot: Snapshot) -> Result<(), JournalError>;

    /// Verify the integrity of the reconstructed state.
    async fn rebuilt_base_state(&self) -> Result<(), JournalError>;

    /// Flush and stop. No further mutations may begin.
    async fn close(&self) -> Result<(), JournalError>;
}

/// Fans every call out to several managers.
///
/// Children marked *collect-only* have their errors recorded rather than
/// propagated; a secondary manager (say, a metrics mirror) must not be
/// able to fail the deployment.
pub struct CombinedManager {
    children: Vec<CombinedChild>,
    collected: Arc<Mutex<Vec<JournalError>>>,
}

struct CombinedChild {
    manager: Arc<dyn SnapshotManager>,
    collect_only: bool,
}

impl CombinedManager {
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            collected: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn with_manager(mut self, manager: Arc<dyn SnapshotManager>) -> Self {
        self.children.push(CombinedChild {
            manager,
            collect_only: false,
        });
        self
    }

    #[must_use]
    pub fn with_collect_only(mut self, manager: Arc<dyn SnapshotManager>) -> Self {
        self.children.push(CombinedChild {
            manager,
            collect_only: true,
        });
        self
    }

    /// Errors recorded from collect-only children so far.
    pub fn collected_errors(&self) -> Vec<JournalError> {
        self.collected.lock().unwrap().clone()
    }

    fn collect<T>(
        &self,
        collect_only: bool,
        result: Result<T, JournalError>,
    ) -> Result<Option<T>, JournalError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(error) if collect_only => {
                self.collected.lock().unwrap().push(error);
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}

impl Default for CombinedManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotManager for CombinedManager {
    async fn begin_mutation(&self, step: Arc<Step>) -> Result<Box<dyn Mutation>, JournalError> {
        let mut mutations = Vec::with_capacity(self.children.len());
        for child in &self.children {
            let result = child.manager.begin_mutation(Arc::clone(&step)).await;
            if let Some(mutation) = self.collect(child.collect_only, result)? {
                mutations.push(CombinedMutation {
                    mutation,
                    collect_only: child.collect_only,
                });
            }
        }
        Ok(Box::new(CombinedMutations {
            mutations,
            collected: Arc::clone(&self.collected),
        }))
    }

    async fn register_resource_outputs(&self, step: Arc<Step>) -> Result<(), JournalError> {
        for child in &self.children {
            let result = child.manager.register_resource_outputs(Arc::clone(&step)).await;
            self.collect(child.collect_only, result)?;
        }
        Ok(())
    }

    async fn write(&self, snapshot: Snapshot) -> Result<(), JournalError> {
        for child in &self.children {
            let result = child.manager.write(snapshot.clone()).await;
            self.collect(child.collect_only, result)?;
        }
        Ok(())
    }

    async fn rebuilt_base_state(&self) -> Result<(), JournalError> {
        for child in &self.children {
            let result = child.manager.rebuilt_base_state().await;
            self.collect(child.collect_only, result)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), JournalError> {
        for child in &self.children {
            let result = child.manager.close().await;
            self.collect(child.collect_only, result)?;
        }
        Ok(())
    }
}

struct CombinedMutation {
    mutation: Box<dyn Mutation>,
    collect_only: bool,
}

struct CombinedMutations {
    mutations: Vec<CombinedMutation>,
    collected: Arc<Mutex<Vec<JournalError>>>,
}

#[async_trait]
impl Mutation for CombinedMutations {
    async fn end(self: Box<Self>, outcome: StepOutcome) -> Result<(), JournalError> {
        let CombinedMutations {
            mutations,
            collected,
        } = *self;
        let mut first_error = None;
        for child in mutations {
            match child.mutation.end(outcome.clone()).await {
                Ok(()) => {}
                Err(error) if child.collect_only => {
                    collected.lock().unwrap().push(error);
                }
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}

/// Routes each step to the manager for its URN's project; whole-snapshot
/// calls fan out to every child.
pub struct RoutingManager {
    routes: FxHashMap<String, Arc<dyn SnapshotManager>>,
    fallback: Arc<dyn SnapshotManager>,
}

impl RoutingManager {
    pub fn new(fallback: Arc<dyn SnapshotManager>) -> Self {
        Self {
            routes: FxHashMap::default(),
            fallback,
        }
    }

    #[must_use]
    pub fn with_route(mut self, project: impl Into<String>, manager: Arc<dyn SnapshotManager>) -> Self {
        self.routes.insert(project.into(), manager);
        self
    }

    fn route(&self, project: &str) -> &Arc<dyn SnapshotManager> {
        self.routes.get(project).unwrap_or(&self.fallback)
    }

    fn children(&self) -> impl Iterator<Item = &Arc<dyn SnapshotManager>> {
        self.routes.values().chain(std::iter::once(&self.fallback))
    }
}

#[async_trait]
impl SnapshotManager for RoutingManager {
    async fn begin_mutation(&self, step: Arc<Step>) -> Result<Box<dyn Mutation>, JournalError> {
        let project = step.urn.project().to_string();
        self.route(&project).begin_mutation(step).await
    }

    async fn register_resource_outputs(&self, step: Arc<Step>) -> Result<(), JournalError> {
        let project = step.urn.project().to_string();
        self.route(&project).register_resource_outputs(step).await
    }

    async fn write(&self, snapshot: Snapshot) -> Result<(), JournalError> {
        for child in self.children() {
            child.write(snapshot.clone()).await?;
        }
        Ok(())
    }

    async fn rebuilt_base_state(&self) -> Result<(), JournalError> {
        for child in self.children() {
            child.rebuilt_base_state().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), JournalError> {
        for child in self.children() {
            child.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keel_urn::Type;

    use crate::journal::Journal;
    use crate::persist::InMemoryPersister;
    use crate::step::StepOp;

    use super::*;

    struct FailingManager;

    #[async_trait]
    impl SnapshotManager for FailingManager {
        async fn begin_mutation(&self, _step: Arc<Step>) -> Result<Box<dyn Mutation>, JournalError> {
            Err(JournalError::Persist("mirror is down".to_string()))
        }

        async fn register_resource_outputs(&self, _step: Arc<Step>) -> Result<(), JournalError> {
            Err(JournalError::Persist("mirror is down".to_string()))
        }

        async fn write(&self, _snapshot: Snapshot) -> Result<(), JournalError> {
            Err(JournalError::Persist("mirror is down".to_string()))
        }

        async fn rebuilt_base_state(&self) -> Result<(), JournalError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), JournalError> {
            Ok(())
        }
    }

    fn step(project: &str, name: &str) -> Arc<Step> {
        let ty = Type::parse("pkg:m:T").unwrap();
        let urn = keel_urn::Urn::new("dev", project, None, &ty, name);
        let mut state = ResourceState::new(urn.clone(), ty, true);
        state.id = Some(keel_resource::ResourceId::new("id1"));
        Arc::new(Step::new(StepOp::Create, urn).with_new(Arc::new(state)))
    }

    #[tokio::test]
    async fn collect_only_children_cannot_fail_the_deployment() {
        let journal = Arc::new(Journal::new(
            Snapshot::empty(),
            Arc::new(InMemoryPersister::new()),
        ));
        let combined = CombinedManager::new()
            .with_manager(Arc::clone(&journal) as Arc<dyn SnapshotManager>)
            .with_collect_only(Arc::new(FailingManager));

        let step = step("proj", "a");
        let mutation = combined.begin_mutation(Arc::clone(&step)).await.unwrap();
        mutation
            .end(StepOutcome::Success {
                state: step.new.clone(),
            })
            .await
            .unwrap();

        assert_eq!(journal.snap().resources.len(), 1);
        assert!(!combined.collected_errors().is_empty());
    }

    #[tokio::test]
    async fn primary_failures_still_propagate() {
        let combined = CombinedManager::new().with_manager(Arc::new(FailingManager));
        assert!(combined.begin_mutation(step("proj", "a")).await.is_err());
    }

    #[tokio::test]
    async fn routing_partitions_by_project() {
        let left = Arc::new(Journal::new(
            Snapshot::empty(),
            Arc::new(InMemoryPersister::new()),
        ));
        let right = Arc::new(Journal::new(
            Snapshot::empty(),
            Arc::new(InMemoryPersister::new()),
        ));
        let routing = RoutingManager::new(Arc::clone(&left) as Arc<dyn SnapshotManager>)
            .with_route("other", Arc::clone(&right) as Arc<dyn SnapshotManager>);

        for (project, name) in [("proj", "a"), ("other", "b")] {
            let step = step(project, name);
            let mutation = routing.begin_mutation(Arc::clone(&step)).await.unwrap();
            mutation
                .end(StepOutcome::Success {
                    state: step.new.clone(),
                })
                .await
                .unwrap();
        }

        assert_eq!(left.snap().resources.len(), 1);
        assert_eq!(left.snap().resources[0].urn.project(), "proj");
        assert_eq!(right.snap().resources.len(), 1);
        assert_eq!(right.snap().resources[0].urn.project(), "other");
    }
}
