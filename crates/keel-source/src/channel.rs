use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::event::SourceEvent;
use crate::{Source, SourceError};

/// The producing half handed to the program task.
#[derive(Clone)]
pub struct SourceSender {
    tx: mpsc::Sender<SourceEvent>,
    error: Arc<Mutex<Option<SourceError>>>,
}

impl SourceSender {
    /// Publish one event; blocks when the engine is behind. Fails once the
    /// engine has stopped consuming (cancellation).
    pub async fn send(&self, event: SourceEvent) -> Result<(), SourceError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| SourceError::Cancelled)
    }

    /// Record a program failure and close the stream. The engine observes
    /// the failure after draining already-queued events.
    pub fn fail(self, error: SourceError) {
        *self.error.lock().unwrap() = Some(error);
    }
}

/// A [`Source`] fed by a program task over a bounded channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<SourceEvent>,
    error: Arc<Mutex<Option<SourceError>>>,
}

impl ChannelSource {
    /// A bounded source; `capacity` events may be in flight before the
    /// program task blocks.
    pub fn new(capacity: usize) -> (SourceSender, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let error = Arc::new(Mutex::new(None));
        (
            SourceSender {
                tx,
                error: Arc::clone(&error),
            },
            Self { rx, error },
        )
    }
}

#[async_trait::async_trait]
impl Source for ChannelSource {
    async fn next(&mut self) -> Result<Option<SourceEvent>, SourceError> {
        match self.rx.recv().await {
            Some(event) => Ok(Some(event)),
            // Channel closed: either a clean program exit or a recorded
            // failure carried out-of-band.
            None => match self.error.lock().unwrap().take() {
                Some(error) => Err(error),
                None => Ok(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::event::RegistrationRequest;

    use super::*;

    #[tokio::test]
    async fn clean_exit_yields_none() {
        let (sender, mut source) = ChannelSource::new(4);
        sender
            .send(SourceEvent::RegisterResource(RegistrationRequest::new(
                "pkg:m:T", "res", true,
            )))
            .await
            .unwrap();
        drop(sender);
        assert!(matches!(source.next().await, Ok(Some(_))));
        assert!(matches!(source.next().await, Ok(None)));
    }

    #[tokio::test]
    async fn failure_surfaces_after_drain() {
        let (sender, mut source) = ChannelSource::new(4);
        sender
            .send(SourceEvent::RegisterResource(RegistrationRequest::new(
                "pkg:m:T", "res", true,
            )))
            .await
            .unwrap();
        sender.fail(SourceError::Program("boom".to_string()));
        assert!(matches!(source.next().await, Ok(Some(_))));
        assert!(matches!(source.next().await, Err(SourceError::Program(_))));
    }
}
