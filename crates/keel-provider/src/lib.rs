//! The provider contract.
//!
//! A provider owns the CRUD lifecycle of the custom resources of one
//! package. The engine drives providers exclusively through the [`Provider`]
//! trait; plugin discovery, process management, and transport live behind
//! the [`ProviderHost`] collaborator and are not the engine's concern.
//!
//! All lifecycle calls are cancellable: [`Provider::cancel`] must return
//! promptly and cause in-flight calls to unblock with
//! [`ProviderError::Cancelled`].

pub use crate::diff_result::{DiffChanges, DiffResult, PropertyDiff, PropertyDiffKind};
pub use crate::host::{HostError, ProviderHost};
pub use crate::provider::{
    CheckFailure, CheckResult, CreateResult, Provider, ReadResult, ResultStatus, UpdateResult,
};

mod diff_result;
mod host;
mod provider;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The call was interrupted by [`Provider::cancel`].
    #[error("the provider call was cancelled")]
    Cancelled,

    /// The provider rejected or failed the call.
    #[error("{0}")]
    Call(String),
}

impl ProviderError {
    pub fn call(message: impl Into<String>) -> Self {
        Self::Call(message.into())
    }
}
