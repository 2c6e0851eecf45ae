use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use keel_property::{PropertyMap, PropertyPath};
use keel_resource::ResourceId;
use keel_urn::Urn;

use crate::diff_result::DiffResult;
use crate::ProviderError;

/// Whether a lifecycle call fully succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Ok,
    /// The resource was mutated but did not initialize cleanly; the
    /// accompanying `init_errors` describe why. Non-fatal: the engine
    /// records the errors on the state and continues.
    PartialFailure,
}

/// A user-visible validation failure from [`Provider::check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckFailure {
    /// The property at fault, when the failure is attributable.
    pub property: Option<String>,
    pub reason: String,
}

/// The outcome of [`Provider::check`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    /// The inputs with provider defaults applied; these feed every
    /// downstream call.
    pub inputs: PropertyMap,
    /// Explicit validation failures. Non-empty failures fail the step
    /// before any mutation happens.
    pub failures: Vec<CheckFailure>,
}

/// The outcome of [`Provider::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreateResult {
    pub id: ResourceId,
    pub outputs: PropertyMap,
    pub status: ResultStatus,
    pub init_errors: Vec<String>,
}

/// The outcome of [`Provider::read`]. `id: None` means the resource no
/// longer exists.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub id: Option<ResourceId>,
    pub inputs: PropertyMap,
    pub outputs: PropertyMap,
    pub status: ResultStatus,
    pub init_errors: Vec<String>,
}

impl ReadResult {
    /// A read that found nothing.
    pub fn missing() -> Self {
        Self {
            id: None,
            inputs: PropertyMap::new(),
            outputs: PropertyMap::new(),
            status: ResultStatus::Ok,
            init_errors: Vec::new(),
        }
    }
}

/// The outcome of [`Provider::update`].
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    pub outputs: PropertyMap,
    pub status: ResultStatus,
    pub init_errors: Vec<String>,
}

/// The lifecycle contract a resource provider implements.
///
/// Calls that mutate infrastructure take a `timeout`; the engine also
/// enforces it on its side, cancelling the call when exceeded. All calls
/// may suspend for unbounded time and must unblock promptly after
/// [`Provider::cancel`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Configure the provider with its inputs. Must be called exactly once,
    /// before any other lifecycle call.
    async fn configure(&self, inputs: &PropertyMap) -> Result<(), ProviderError>;

    /// Validate and default the inputs for a resource.
    async fn check(
        &self,
        urn: &Urn,
        olds: &PropertyMap,
        news: &PropertyMap,
    ) -> Result<CheckResult, ProviderError>;

    /// Compare the persisted inputs against the proposed ones.
    async fn diff(
        &self,
        urn: &Urn,
        id: &ResourceId,
        olds: &PropertyMap,
        news: &PropertyMap,
        ignore_changes: &[PropertyPath],
    ) -> Result<DiffResult, ProviderError>;

    /// Compare provider configuration; replace keys here replace the
    /// provider resource itself and, transitively, its dependents.
    async fn diff_config(
        &self,
        urn: &Urn,
        olds: &PropertyMap,
        news: &PropertyMap,
        ignore_changes: &[PropertyPath],
    ) -> Result<DiffResult, ProviderError>;

    async fn create(
        &self,
        urn: &Urn,
        news: &PropertyMap,
        timeout: Option<Duration>,
    ) -> Result<CreateResult, ProviderError>;

    /// Read the live state of a resource. `inputs`/`state` carry the
    /// persisted values for providers that need them to locate the
    /// resource.
    async fn read(
        &self,
        urn: &Urn,
        id: &ResourceId,
        inputs: &PropertyMap,
        state: &PropertyMap,
    ) -> Result<ReadResult, ProviderError>;

    async fn update(
        &self,
        urn: &Urn,
        id: &ResourceId,
        olds: &PropertyMap,
        news: &PropertyMap,
        timeout: Option<Duration>,
        ignore_changes: &[PropertyPath],
    ) -> Result<UpdateResult, ProviderError>;

    async fn delete(
        &self,
        urn: &Urn,
        id: &ResourceId,
        olds: &PropertyMap,
        timeout: Option<Duration>,
    ) -> Result<ResultStatus, ProviderError>;

    /// Signal cancellation. Must return promptly; pending calls unblock
    /// with [`ProviderError::Cancelled`].
    async fn cancel(&self) -> Result<(), ProviderError>;
}
