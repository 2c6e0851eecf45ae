use std::collections::VecDeque;

use crate::event::SourceEvent;
use crate::{Source, SourceError};

/// A source that replays a pre-built script of events.
///
/// Used by tests and by deployment modes whose "program" is synthetic
/// (destroy runs with an empty fixture).
#[derive(Debug, Default)]
pub struct FixtureSource {
    events: VecDeque<SourceEvent>,
}

impl FixtureSource {
    pub fn new(events: impl IntoIterator<Item = SourceEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }

    /// The empty program.
    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Source for FixtureSource {
    async fn next(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        Ok(self.events.pop_front())
    }
}
