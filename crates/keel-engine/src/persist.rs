use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use keel_resource::Snapshot;

use crate::JournalError;

/// Writes snapshots durably. If `save` returns `Ok`, the snapshot must be
/// crash-recoverable.
#[async_trait]
pub trait SnapshotPersister: Send + Sync {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), JournalError>;
}

/// Keeps the latest snapshot in memory. The test persister, and the
/// preview persister: previews must never touch real storage.
#[derive(Debug, Default)]
pub struct InMemoryPersister {
    inner: Mutex<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    last: Option<Snapshot>,
    saves: usize,
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently saved snapshot.
    pub fn last(&self) -> Option<Snapshot> {
        self.inner.lock().unwrap().last.clone()
    }

    /// How many times `save` has been called.
    pub fn saves(&self) -> usize {
        self.inner.lock().unwrap().saves
    }
}

#[async_trait]
impl SnapshotPersister for InMemoryPersister {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), JournalError> {
        let mut inner = self.inner.lock().unwrap();
        inner.last = Some(snapshot.clone());
        inner.saves += 1;
        Ok(())
    }
}

/// Persists snapshots as JSON, atomically: the snapshot is written to a
/// temporary file in the target directory and renamed over the previous
/// one, so a crash mid-write leaves the old snapshot intact.
#[derive(Debug)]
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl SnapshotPersister for FilePersister {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), JournalError> {
        let persist = |err: &dyn std::fmt::Display| JournalError::Persist(err.to_string());
        let directory = self
            .path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let contents = serde_json::to_vec_pretty(snapshot).map_err(|err| persist(&err))?;
        let file = tempfile::NamedTempFile::new_in(&directory).map_err(|err| persist(&err))?;
        fs_err::write(file.path(), contents).map_err(|err| persist(&err))?;
        file.persist(&self.path).map_err(|err| persist(&err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_persister_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let persister = FilePersister::new(&path);
        let snapshot = Snapshot::empty();
        persister.save(&snapshot).await.unwrap();
        let raw = fs_err::read(&path).unwrap();
        let restored: Snapshot = serde_json::from_slice(&raw).unwrap();
        assert!(restored.resources.is_empty());
    }

    #[tokio::test]
    async fn in_memory_persister_counts_saves() {
        let persister = InMemoryPersister::new();
        persister.save(&Snapshot::empty()).await.unwrap();
        persister.save(&Snapshot::empty()).await.unwrap();
        assert_eq!(persister.saves(), 2);
        assert!(persister.last().unwrap().is_empty());
    }
}
