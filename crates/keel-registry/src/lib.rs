//! The provider registry.
//!
//! The registry owns every running provider instance for the duration of a
//! deployment. It satisfies two kinds of requests:
//!
//! * **explicit**: the program supplied a `<urn>::<id>` reference;
//!   [`ProviderRegistry::provider`] suspends until that reference has been
//!   configured (provider steps execute concurrently with their
//!   dependents' generation) and fails with
//!   [`RegistryError::ProviderUnavailable`] if the plugin cannot be
//!   loaded;
//! * **default**: the program supplied only a package name, optionally
//!   pinned to a version, download URL, checksums, or a parameterization.
//!   Default providers are themselves resources; their names are a
//!   deterministic function of the pin, so a version upgrade yields a
//!   *new* provider resource rather than a configuration change, and
//!   existing resources stay attached to their old default until
//!   re-registered.
//!
//! The registry is also the [`Provider`](keel_provider::Provider) for provider resources
//! themselves: steps acting on `keel:providers:*` URNs call straight into
//! it, and it translates creates/updates/deletes into plugin loading and
//! configuration.

use keel_urn::Urn;

pub use crate::descriptor::{
    default_provider_name, descriptor_from_inputs, inputs_from_descriptor,
};
pub use crate::registry::ProviderRegistry;

mod descriptor;
mod registry;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("provider `{reference}` is unavailable: {reason}")]
    ProviderUnavailable { reference: String, reason: String },

    #[error("the deployment was cancelled")]
    Cancelled,

    #[error("provider resource `{0}` has no ID")]
    MissingProviderId(Urn),

    #[error("`{0}` is not a provider resource")]
    NotProviderType(Urn),
}

impl RegistryError {
    pub(crate) fn unavailable(reference: impl ToString, reason: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }
}
