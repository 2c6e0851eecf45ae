use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::debug;

use keel_once_map::OnceMap;
use keel_property::{PropertyMap, PropertyPath};
use keel_provider::{
    CheckResult, CreateResult, DiffResult, Provider, ProviderError, ProviderHost, ReadResult,
    ResultStatus, UpdateResult,
};
use keel_resource::{
    Goal, PackageDescriptor, ProviderId, ProviderReference, ResourceId, ResourceState, Snapshot,
};
use keel_urn::{Type, Urn};

use crate::descriptor::{default_provider_name, descriptor_from_inputs, inputs_from_descriptor};
use crate::RegistryError;

/// Input keys that pin the plugin rather than configure the provider; the
/// registry strips them before delegating a config diff, so a version-only
/// change reads as no change.
const PIN_KEYS: &[&str] = &[
    "version",
    "pluginDownloadURL",
    "pluginChecksums",
    "parameterization",
];

/// Owns and vends the deployment's configured providers. See the crate
/// docs for the full contract.
pub struct ProviderRegistry {
    host: Arc<dyn ProviderHost>,
    stack: String,
    project: String,
    dry_run: bool,
    /// Configured providers by reference; callers suspend here until the
    /// reference they need is published.
    providers: OnceMap<ProviderReference, Arc<dyn Provider>>,
    /// Every instance ever configured, for cancellation fan-out.
    instances: Mutex<Vec<Arc<dyn Provider>>>,
    /// IDs handed out at generation time, consumed by `create`.
    reserved: Mutex<FxHashMap<Urn, ProviderId>>,
    id_counter: AtomicU64,
    /// Set on the first load/configure failure; the registry then refuses
    /// further waits so callers cannot deadlock on a provider that will
    /// never arrive.
    terminal: Mutex<Option<RegistryError>>,
}

impl ProviderRegistry {
    pub fn new(
        host: Arc<dyn ProviderHost>,
        stack: impl Into<String>,
        project: impl Into<String>,
        dry_run: bool,
    ) -> Self {
        Self {
            host,
            stack: stack.into(),
            project: project.into(),
            dry_run,
            providers: OnceMap::default(),
            instances: Mutex::new(Vec::new()),
            reserved: Mutex::new(FxHashMap::default()),
            id_counter: AtomicU64::new(1),
            terminal: Mutex::new(None),
        }
    }

    /// The deterministic URN and registration goal of the default provider
    /// for `descriptor`.
    pub fn default_provider_goal(&self, descriptor: &PackageDescriptor) -> (Urn, Goal) {
        let ty = Type::provider(&descriptor.package);
        let name = default_provider_name(descriptor);
        let urn = Urn::new(&self.stack, &self.project, None, &ty, &name);
        let mut goal = Goal::new(ty, name, true);
        goal.inputs = inputs_from_descriptor(descriptor);
        goal.package = descriptor.clone();
        (urn, goal)
    }

    /// Reserve the reference a provider resource's create step will
    /// publish under. Previews reserve the unknown ID.
    pub fn reserve_reference(&self, urn: &Urn) -> Result<ProviderReference, RegistryError> {
        if !urn.ty().is_provider_type() {
            return Err(RegistryError::NotProviderType(urn.clone()));
        }
        let id = if self.dry_run {
            ProviderId::unknown()
        } else {
            self.fresh_id()
        };
        self.reserved.lock().unwrap().insert(urn.clone(), id.clone());
        let reference = ProviderReference {
            urn: urn.clone(),
            id,
        };
        // Mark the reference as in flight so resolvers wait for the create
        // step instead of failing fast.
        self.providers.register(&reference);
        Ok(reference)
    }

    fn fresh_id(&self) -> ProviderId {
        let n = self.id_counter.fetch_add(1, Ordering::Relaxed);
        ProviderId::new(format!("{n:08x}"))
    }

    /// The configured provider for `reference`, suspending until its
    /// configuration completes or the deployment is cancelled.
    pub async fn provider(
        &self,
        reference: &ProviderReference,
    ) -> Result<Arc<dyn Provider>, RegistryError> {
        if let Some(error) = self.terminal.lock().unwrap().clone() {
            return Err(error);
        }
        if !self.providers.is_registered(reference) {
            return Err(RegistryError::unavailable(
                reference,
                "no provider has been registered under this reference",
            ));
        }
        match self.providers.wait(reference).await {
            Ok(provider) => Ok(provider),
            Err(keel_once_map::Error::Cancelled) => {
                let terminal = self.terminal.lock().unwrap().clone();
                Err(terminal.unwrap_or(RegistryError::Cancelled))
            }
        }
    }

    /// Re-register an unchanged provider resource from its persisted
    /// state. Idempotent per reference.
    pub async fn same(&self, state: &ResourceState) -> Result<ProviderReference, RegistryError> {
        let package = state
            .ty
            .provider_package()
            .map(str::to_string)
            .ok_or_else(|| RegistryError::NotProviderType(state.urn.clone()))?;
        let id = match &state.id {
            Some(id) => ProviderId::new(id.as_str()),
            None if self.dry_run => ProviderId::unknown(),
            None => return Err(RegistryError::MissingProviderId(state.urn.clone())),
        };
        let reference = ProviderReference {
            urn: state.urn.clone(),
            id,
        };
        // The reference may already be marked in flight by the generator;
        // what matters is whether a configured instance has been published
        // under it yet.
        if self.providers.get(&reference).is_none() {
            self.providers.register(&reference);
            let descriptor = descriptor_from_inputs(&package, &state.inputs);
            self.configure_and_publish(reference.clone(), &descriptor, &state.inputs)
                .await?;
        }
        Ok(reference)
    }

    /// Load and configure every provider in the prior snapshot, in
    /// dependency order, before any step executes.
    pub async fn load_prior_state(&self, snapshot: &Snapshot) -> Result<(), RegistryError> {
        for state in &snapshot.resources {
            if state.is_provider() {
                self.same(state).await?;
            }
        }
        Ok(())
    }

    /// Mark a reference as expected: a step that will configure it has
    /// been generated, so resolvers should wait for it rather than fail
    /// fast.
    pub fn expect_reference(&self, reference: &ProviderReference) {
        self.providers.register(reference);
    }

    /// Release every task waiting on an unconfigured reference. Used when
    /// the deployment stops starting new steps: a provider whose
    /// configuring step will never run must fail its waiters, not hang
    /// them.
    pub fn release_waiters(&self) {
        self.providers.cancel_all();
    }

    /// Fan `Provider::cancel` out to every configured instance. Each call
    /// runs in its own task so that cancelling the deployment cannot
    /// interrupt an in-flight `cancel`; waiters on unconfigured references
    /// are released.
    pub fn cancel_all(&self) {
        let instances = self.instances.lock().unwrap().clone();
        debug!("cancelling {} provider instance(s)", instances.len());
        for instance in instances {
            tokio::spawn(async move {
                let _ = instance.cancel().await;
            });
        }
        self.providers.cancel_all();
    }

    async fn configure_and_publish(
        &self,
        reference: ProviderReference,
        descriptor: &PackageDescriptor,
        inputs: &PropertyMap,
    ) -> Result<Arc<dyn Provider>, RegistryError> {
        match self.load_and_configure(&reference, descriptor, inputs).await {
            Ok(provider) => {
                self.providers.done(reference, Arc::clone(&provider));
                Ok(provider)
            }
            Err(error) => {
                // Enter the terminal error state and release every waiter;
                // a missing provider must fail callers, not hang them.
                *self.terminal.lock().unwrap() = Some(error.clone());
                self.providers.cancel_all();
                Err(error)
            }
        }
    }

    async fn load_and_configure(
        &self,
        reference: &ProviderReference,
        descriptor: &PackageDescriptor,
        inputs: &PropertyMap,
    ) -> Result<Arc<dyn Provider>, RegistryError> {
        debug!(reference = %reference, package = %descriptor.package, "configuring provider");
        let provider = self
            .host
            .provider(descriptor)
            .await
            .map_err(|err| RegistryError::unavailable(reference, err.to_string()))?;
        provider
            .configure(inputs)
            .await
            .map_err(|err| RegistryError::unavailable(reference, err.to_string()))?;
        self.instances.lock().unwrap().push(Arc::clone(&provider));
        Ok(provider)
    }

    fn descriptor_for(&self, urn: &Urn, inputs: &PropertyMap) -> Result<PackageDescriptor, ProviderError> {
        let ty = urn.ty();
        let package = ty
            .provider_package()
            .ok_or_else(|| ProviderError::call(format!("`{urn}` is not a provider resource")))?;
        Ok(descriptor_from_inputs(package, inputs))
    }
}

fn strip_pin_keys(inputs: &PropertyMap) -> PropertyMap {
    inputs
        .iter()
        .filter(|(key, _)| !PIN_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Provider resources are driven through the registry itself: creating one
/// loads and configures a plugin instance, updating one reconfigures it,
/// and diffs ignore the pin keys that select the plugin rather than
/// configure it.
#[async_trait]
impl Provider for ProviderRegistry {
    async fn configure(&self, _inputs: &PropertyMap) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn check(
        &self,
        _urn: &Urn,
        _olds: &PropertyMap,
        news: &PropertyMap,
    ) -> Result<CheckResult, ProviderError> {
        Ok(CheckResult {
            inputs: news.clone(),
            failures: Vec::new(),
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
        self.diff_config(urn, olds, news, ignore_changes).await
    }

    async fn diff_config(
        &self,
        urn: &Urn,
        olds: &PropertyMap,
        news: &PropertyMap,
        ignore_changes: &[PropertyPath],
    ) -> Result<DiffResult, ProviderError> {
        let descriptor = self.descriptor_for(urn, news)?;
        let instance = self
            .host
            .provider(&descriptor)
            .await
            .map_err(|err| ProviderError::call(err.to_string()))?;
        let olds = strip_pin_keys(olds);
        let news = strip_pin_keys(news);
        instance.diff_config(urn, &olds, &news, ignore_changes).await
    }

    async fn create(
        &self,
        urn: &Urn,
        news: &PropertyMap,
        _timeout: Option<Duration>,
    ) -> Result<CreateResult, ProviderError> {
        let descriptor = self.descriptor_for(urn, news)?;
        let id = self
            .reserved
            .lock()
            .unwrap()
            .remove(urn)
            .unwrap_or_else(|| {
                if self.dry_run {
                    ProviderId::unknown()
                } else {
                    self.fresh_id()
                }
            });
        let reference = ProviderReference {
            urn: urn.clone(),
            id: id.clone(),
        };
        self.providers.register(&reference);
        self.configure_and_publish(reference, &descriptor, news)
            .await
            .map_err(provider_error)?;
        Ok(CreateResult {
            id: ResourceId::new(id.as_str()),
            outputs: news.clone(),
            status: ResultStatus::Ok,
            init_errors: Vec::new(),
        })
    }

    async fn read(
        &self,
        urn: &Urn,
        _id: &ResourceId,
        _inputs: &PropertyMap,
        _state: &PropertyMap,
    ) -> Result<ReadResult, ProviderError> {
        Err(ProviderError::call(format!(
            "provider resource `{urn}` cannot be read"
        )))
    }

    async fn update(
        &self,
        urn: &Urn,
        id: &ResourceId,
        _olds: &PropertyMap,
        news: &PropertyMap,
        _timeout: Option<Duration>,
        _ignore_changes: &[PropertyPath],
    ) -> Result<UpdateResult, ProviderError> {
        let descriptor = self.descriptor_for(urn, news)?;
        let reference = ProviderReference {
            urn: urn.clone(),
            id: ProviderId::new(id.as_str()),
        };
        // Reconfiguration keeps the instance ID: dependents that resolved
        // the old instance have already finished, and later resolvers get
        // the newly configured one.
        self.providers.register(&reference);
        self.configure_and_publish(reference, &descriptor, news)
            .await
            .map_err(provider_error)?;
        Ok(UpdateResult {
            outputs: news.clone(),
            status: ResultStatus::Ok,
            init_errors: Vec::new(),
        })
    }

    async fn delete(
        &self,
        urn: &Urn,
        _id: &ResourceId,
        _olds: &PropertyMap,
        _timeout: Option<Duration>,
    ) -> Result<ResultStatus, ProviderError> {
        debug!(urn = %urn, "retiring provider resource");
        Ok(ResultStatus::Ok)
    }

    async fn cancel(&self) -> Result<(), ProviderError> {
        self.cancel_all();
        Ok(())
    }
}

fn provider_error(err: RegistryError) -> ProviderError {
    match err {
        RegistryError::Cancelled => ProviderError::Cancelled,
        other => ProviderError::call(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use keel_property::PropertyKey;
    use keel_provider::HostError;

    use super::*;

    struct NullProvider;

    #[async_trait]
    impl Provider for NullProvider {
        async fn configure(&self, _inputs: &PropertyMap) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn check(
            &self,
            _urn: &Urn,
            _olds: &PropertyMap,
            news: &PropertyMap,
        ) -> Result<CheckResult, ProviderError> {
            Ok(CheckResult {
                inputs: news.clone(),
                failures: Vec::new(),
            })
        }

        async fn diff(
            &self,
            _urn: &Urn,
            _id: &ResourceId,
            olds: &PropertyMap,
            news: &PropertyMap,
            ignore_changes: &[PropertyPath],
        ) -> Result<DiffResult, ProviderError> {
            DiffResult::from_maps(olds, news, ignore_changes)
                .map_err(|err| ProviderError::call(err.to_string()))
        }

        async fn diff_config(
            &self,
            urn: &Urn,
            olds: &PropertyMap,
            news: &PropertyMap,
            ignore_changes: &[PropertyPath],
        ) -> Result<DiffResult, ProviderError> {
            self.diff(urn, &ResourceId::new(""), olds, news, ignore_changes)
                .await
        }

        async fn create(
            &self,
            _urn: &Urn,
            news: &PropertyMap,
            _timeout: Option<Duration>,
        ) -> Result<CreateResult, ProviderError> {
            Ok(CreateResult {
                id: ResourceId::new("id"),
                outputs: news.clone(),
                status: ResultStatus::Ok,
                init_errors: Vec::new(),
            })
        }

        async fn read(
            &self,
            _urn: &Urn,
            id: &ResourceId,
            inputs: &PropertyMap,
            state: &PropertyMap,
        ) -> Result<ReadResult, ProviderError> {
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
            _urn: &Urn,
            _id: &ResourceId,
            _olds: &PropertyMap,
            news: &PropertyMap,
            _timeout: Option<Duration>,
            _ignore_changes: &[PropertyPath],
        ) -> Result<UpdateResult, ProviderError> {
            Ok(UpdateResult {
                outputs: news.clone(),
                status: ResultStatus::Ok,
                init_errors: Vec::new(),
            })
        }

        async fn delete(
            &self,
            _urn: &Urn,
            _id: &ResourceId,
            _olds: &PropertyMap,
            _timeout: Option<Duration>,
        ) -> Result<ResultStatus, ProviderError> {
            Ok(ResultStatus::Ok)
        }

        async fn cancel(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    struct NullHost {
        fail: bool,
    }

    #[async_trait]
    impl ProviderHost for NullHost {
        async fn provider(
            &self,
            descriptor: &PackageDescriptor,
        ) -> Result<Arc<dyn Provider>, HostError> {
            if self.fail {
                return Err(HostError::NotFound {
                    package: descriptor.package.clone(),
                    version: descriptor.version.clone(),
                });
            }
            Ok(Arc::new(NullProvider))
        }
    }

    fn registry(fail: bool) -> ProviderRegistry {
        ProviderRegistry::new(Arc::new(NullHost { fail }), "dev", "proj", false)
    }

    fn provider_state(name: &str, id: &str) -> ResourceState {
        let ty = Type::provider("aws");
        let urn = Urn::new("dev", "proj", None, &ty, name);
        let mut state = ResourceState::new(urn, ty, true);
        state.id = Some(ResourceId::new(id));
        state
    }

    #[tokio::test]
    async fn same_publishes_the_reference() {
        let registry = registry(false);
        let reference = registry.same(&provider_state("default", "p1")).await.unwrap();
        assert!(registry.provider(&reference).await.is_ok());
    }

    #[tokio::test]
    async fn create_publishes_the_reserved_reference() {
        let registry = registry(false);
        let urn = Urn::new("dev", "proj", None, &Type::provider("aws"), "default");
        let reference = registry.reserve_reference(&urn).unwrap();
        let result = registry
            .create(&urn, &PropertyMap::new(), None)
            .await
            .unwrap();
        assert_eq!(result.id.as_str(), reference.id.as_str());
        assert!(registry.provider(&reference).await.is_ok());
    }

    #[tokio::test]
    async fn load_failure_is_terminal() {
        let registry = registry(true);
        let err = registry.same(&provider_state("default", "p1")).await.unwrap_err();
        assert!(matches!(err, RegistryError::ProviderUnavailable { .. }));
        // Waiters for any reference now fail instead of hanging.
        let reference = ProviderReference {
            urn: Urn::new("dev", "proj", None, &Type::provider("aws"), "default"),
            id: ProviderId::new("p1"),
        };
        assert!(matches!(
            registry.provider(&reference).await,
            Err(RegistryError::ProviderUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn unregistered_reference_fails_fast() {
        let registry = registry(false);
        let reference = ProviderReference {
            urn: Urn::new("dev", "proj", None, &Type::provider("aws"), "default"),
            id: ProviderId::new("nope"),
        };
        assert!(matches!(
            registry.provider(&reference).await,
            Err(RegistryError::ProviderUnavailable { .. })
        ));
    }

    #[test]
    fn default_goal_carries_pin_inputs() {
        let registry = registry(false);
        let mut descriptor = PackageDescriptor::package("aws");
        descriptor.version = Some("0.17.10".to_string());
        let (urn, goal) = registry.default_provider_goal(&descriptor);
        assert_eq!(
            urn.as_str(),
            "urn:keel:dev::proj::keel:providers:aws::default_0_17_10"
        );
        assert_eq!(
            goal.inputs.get(&PropertyKey::new("version")),
            Some(&keel_property::PropertyValue::string("0.17.10"))
        );
    }
}
