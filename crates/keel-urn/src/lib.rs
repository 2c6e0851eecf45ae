//! Resource identity.
//!
//! Every resource managed by the engine is named by a [`Urn`], a stable
//! textual identity derived from the stack, the project, the resource's type
//! (qualified by its ancestors' types), and the resource's name. URNs are
//! what the snapshot, the step generator, and the dependency graph key on;
//! provider-assigned IDs may change across a resource's lifetime, URNs may
//! not.
//!
//! Type tokens ([`Type`]) have the shape `package:module:name`. Provider
//! resources use the reserved `keel:providers:<package>` tokens and are
//! recognized by [`Type::is_provider_type`].

pub use crate::type_token::{QualifiedType, Type, PROVIDERS_MODULE};
pub use crate::urn::Urn;

mod type_token;
mod urn;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrnError {
    #[error("invalid URN `{0}`")]
    InvalidUrn(String),

    #[error("invalid type token `{0}`")]
    InvalidType(String),
}
