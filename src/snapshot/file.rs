//! File-backed Snapshot Store
//!
//! Layout of the snapshot directory:
//!
//! ```text
//! 0000000001.json   revision 1
//! 0000000002.json   revision 2
//! .lock             present while a writer holds the lock
//! ```
//!
//! Revision files are never rewritten. A new revision is written to a
//! temporary file and hard-linked into place, so two writers racing for
//! the same revision cannot both succeed.

use super::{Snapshot, SnapshotMetadata, SnapshotStore, StoreLock, LOCK_POLL_INTERVAL};
use crate::error::{MigrateError, Result};
use crate::model::Schema;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LOCK_FILE: &str = ".lock";

pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    /// Open (creating if needed) the snapshot directory
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!("Snapshot store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn revision_path(&self, revision: u64) -> PathBuf {
        self.dir.join(format!("{:010}.json", revision))
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Revisions present on disk, ascending
    async fn revisions(&self) -> Result<Vec<u64>> {
        let mut revisions = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(revision) = name.strip_suffix(".json").and_then(|stem| stem.parse::<u64>().ok()) {
                revisions.push(revision);
            }
        }
        revisions.sort_unstable();
        Ok(revisions)
    }

    async fn read_snapshot(&self, revision: u64) -> Result<Option<Snapshot>> {
        match fs::read(self.revision_path(revision)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn current_holder(&self) -> Result<Option<StoreLock>> {
        match fs::read(self.lock_path()).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn try_create_lock(&self, lock: &StoreLock) -> Result<bool> {
        let opened = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path())
            .await;
        match opened {
            Ok(mut file) => {
                file.write_all(&serde_json::to_vec(lock)?).await?;
                file.sync_all().await?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load_latest(&self) -> Result<Option<Snapshot>> {
        match self.revisions().await?.last() {
            Some(revision) => self.read_snapshot(*revision).await,
            None => Ok(None),
        }
    }

    async fn append(&self, lock: &StoreLock, schema: &Schema, label: Option<String>) -> Result<Snapshot> {
        match self.current_holder().await? {
            Some(holder) if holder.owner == lock.owner => {}
            Some(holder) => {
                return Err(MigrateError::ConcurrentModification(format!(
                    "lock is held by {}",
                    holder.describe()
                )))
            }
            None => {
                return Err(MigrateError::ConcurrentModification(
                    "append attempted without holding the lock".into(),
                ))
            }
        }

        let revision = self.revisions().await?.last().copied().unwrap_or(0) + 1;
        let snapshot = Snapshot::new(revision, schema.clone(), label);
        let target = self.revision_path(revision);
        let temp = self.dir.join(format!(".{:010}.{}.tmp", revision, Uuid::new_v4()));

        let mut file = fs::File::create(&temp).await?;
        file.write_all(&serde_json::to_vec_pretty(&snapshot)?).await?;
        file.sync_all().await?;
        drop(file);

        let linked = fs::hard_link(&temp, &target).await;
        if let Err(e) = fs::remove_file(&temp).await {
            warn!("Could not remove temporary snapshot {}: {}", temp.display(), e);
        }
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(MigrateError::ConcurrentModification(format!(
                    "revision {} was written by another process",
                    revision
                )))
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            "Saved snapshot r{} to {}: {} tables, {} enums",
            revision,
            target.display(),
            snapshot.schema.tables.len(),
            snapshot.schema.enums.len()
        );
        Ok(snapshot)
    }

    async fn history(&self) -> Result<Vec<SnapshotMetadata>> {
        let mut history = Vec::new();
        for revision in self.revisions().await? {
            if let Some(snapshot) = self.read_snapshot(revision).await? {
                history.push(SnapshotMetadata::from(&snapshot));
            }
        }
        Ok(history)
    }

    async fn load(&self, revision: u64) -> Result<Option<Snapshot>> {
        self.read_snapshot(revision).await
    }

    async fn lock(&self, timeout: Duration) -> Result<StoreLock> {
        let lock = StoreLock::new();
        let started = Instant::now();
        loop {
            if self.try_create_lock(&lock).await? {
                debug!("Acquired snapshot store lock {}", lock.owner);
                return Ok(lock);
            }
            if started.elapsed() >= timeout {
                let holder = self
                    .current_holder()
                    .await?
                    .map(|h| h.describe())
                    .unwrap_or_else(|| "an unknown process".to_string());
                return Err(MigrateError::LockTimeout {
                    holder,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lock: StoreLock) -> Result<()> {
        match self.current_holder().await? {
            Some(holder) if holder.owner == lock.owner => {
                fs::remove_file(self.lock_path()).await?;
                debug!("Released snapshot store lock {}", lock.owner);
            }
            _ => warn!("Lock {} was not held at release time", lock.owner),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, Constraint, LogicalType, Table};
    use pretty_assertions::assert_eq;

    fn schema() -> Schema {
        Schema::new("public").with_table(
            Table::new("users")
                .with_column(Column::new("id", LogicalType::Integer))
                .with_constraint(Constraint::primary_key(&["id"])),
        )
    }

    #[tokio::test]
    async fn test_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path()).await.unwrap();
        assert!(store.load_latest().await.unwrap().is_none());

        let lock = store.lock(Duration::from_millis(10)).await.unwrap();
        let first = store.append(&lock, &schema(), Some("initial".into())).await.unwrap();
        let second = store.append(&lock, &schema(), None).await.unwrap();
        store.release(lock).await.unwrap();

        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 2);
        assert!(dir.path().join("0000000001.json").exists());
        assert!(!dir.path().join(LOCK_FILE).exists());

        // A fresh handle sees the same history
        let reopened = FileSnapshotStore::open(dir.path()).await.unwrap();
        let latest = reopened.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.revision, 2);
        assert_eq!(latest.schema, schema());
        assert_eq!(latest.checksum, schema().checksum());

        let history = reopened.history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].label.as_deref(), Some("initial"));
        assert_eq!(reopened.load(1).await.unwrap().unwrap().id, first.id);
        assert!(reopened.load(9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileSnapshotStore::open(dir.path()).await.unwrap();
        let b = FileSnapshotStore::open(dir.path()).await.unwrap();

        let held = a.lock(Duration::from_millis(10)).await.unwrap();
        let err = b.lock(Duration::from_millis(100)).await.unwrap_err();
        match err {
            MigrateError::LockTimeout { holder, .. } => assert!(holder.contains(&held.owner)),
            other => panic!("expected LockTimeout, got {:?}", other),
        }

        a.release(held).await.unwrap();
        assert!(b.lock(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_append_under_foreign_lock_fails() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileSnapshotStore::open(dir.path()).await.unwrap();
        let b = FileSnapshotStore::open(dir.path()).await.unwrap();

        let _held = a.lock(Duration::from_millis(10)).await.unwrap();
        let forged = StoreLock::new();
        let err = b.append(&forged, &schema(), None).await.unwrap_err();
        assert!(matches!(err, MigrateError::ConcurrentModification(_)));
        assert!(a.load_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_never_overwrites_existing_revision() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path()).await.unwrap();
        let lock = store.lock(Duration::from_millis(10)).await.unwrap();
        store.append(&lock, &schema(), None).await.unwrap();

        // Revision 2 written by someone else
        let winner = Snapshot::new(2, schema(), None);
        std::fs::write(
            dir.path().join("0000000002.json"),
            serde_json::to_vec(&winner).unwrap(),
        )
        .unwrap();

        let next = store.append(&lock, &schema(), None).await.unwrap();
        assert_eq!(next.revision, 3);
        assert_eq!(store.load(2).await.unwrap().unwrap().id, winner.id);
    }
}
