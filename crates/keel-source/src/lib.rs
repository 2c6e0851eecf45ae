//! The source: the stream of resource registrations a running program
//! produces.
//!
//! A [`Source`] yields [`SourceEvent`]s lazily, interleaved with the
//! provider calls the engine makes on the program's behalf: a program
//! typically blocks on each resource it registers until the engine answers
//! with the resource's URN, ID, and outputs. [`ChannelSource`] is the live
//! wiring: the language host pushes events onto a bounded channel from its
//! own task and carries failure out-of-band, so that a crashed program
//! surfaces as a [`SourceError`] rather than a silent end-of-stream.
//! [`FixtureSource`] replays a pre-built script of events; tests and the
//! synthetic deployment modes use it.

pub use crate::channel::{ChannelSource, SourceSender};
pub use crate::event::{
    OutputsRequest, ReadRequest, RegistrationRequest, RegistrationResponse, SourceEvent,
};
pub use crate::fixture::FixtureSource;

mod channel;
mod event;
mod fixture;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// The program exited with an error.
    #[error("the program failed: {0}")]
    Program(String),

    /// The deployment was cancelled while the program was still running.
    #[error("the program was cancelled")]
    Cancelled,
}

/// A stream of registration events.
///
/// `Ok(None)` is a clean end-of-program. Implementations must stop
/// emitting promptly once the deployment is cancelled.
#[async_trait::async_trait]
pub trait Source: Send {
    async fn next(&mut self) -> Result<Option<SourceEvent>, SourceError>;
}
