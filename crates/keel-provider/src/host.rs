use std::sync::Arc;

use async_trait::async_trait;

use keel_resource::PackageDescriptor;

use crate::provider::Provider;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HostError {
    #[error("no provider plugin found for package `{package}`{}", version_suffix(.version))]
    NotFound {
        package: String,
        version: Option<String>,
    },

    #[error("failed to load provider plugin for `{package}`: {reason}")]
    Load { package: String, reason: String },
}

fn version_suffix(version: &Option<String>) -> String {
    match version {
        Some(version) => format!(" at version {version}"),
        None => String::new(),
    }
}

/// Loads provider plugins. Implementations own process management,
/// download, and transport; the engine only asks for a ready-to-configure
/// [`Provider`].
#[async_trait]
pub trait ProviderHost: Send + Sync {
    async fn provider(
        &self,
        descriptor: &PackageDescriptor,
    ) -> Result<Arc<dyn Provider>, HostError>;
}
