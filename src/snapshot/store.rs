//! In-memory Snapshot Store
//!
//! Same contract as the file store, held in process memory. Used for dry
//! runs and tests.

use super::{Snapshot, SnapshotMetadata, SnapshotStore, StoreLock, LOCK_POLL_INTERVAL};
use crate::error::{MigrateError, Result};
use crate::model::Schema;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Store for managing schema snapshots in memory
#[derive(Default, Clone)]
pub struct MemorySnapshotStore {
    /// Revisions in append order
    snapshots: Arc<RwLock<Vec<Snapshot>>>,
    holder: Arc<Mutex<Option<StoreLock>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing baseline (revision 1)
    pub fn with_baseline(schema: Schema) -> Self {
        Self {
            snapshots: Arc::new(RwLock::new(vec![Snapshot::new(1, schema, Some("baseline".into()))])),
            holder: Arc::default(),
        }
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load_latest(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.read().await.last().cloned())
    }

    async fn append(&self, lock: &StoreLock, schema: &Schema, label: Option<String>) -> Result<Snapshot> {
        let holder = self.holder.lock().await;
        match holder.as_ref() {
            Some(current) if current.owner == lock.owner => {}
            Some(current) => {
                return Err(MigrateError::ConcurrentModification(format!(
                    "lock is held by {}",
                    current.describe()
                )))
            }
            None => {
                return Err(MigrateError::ConcurrentModification(
                    "append attempted without holding the lock".into(),
                ))
            }
        }

        let mut snapshots = self.snapshots.write().await;
        let revision = snapshots.last().map(|s| s.revision).unwrap_or(0) + 1;
        let snapshot = Snapshot::new(revision, schema.clone(), label);
        snapshots.push(snapshot.clone());

        info!(
            "Saved snapshot r{}: {} tables, {} enums",
            revision,
            snapshot.schema.tables.len(),
            snapshot.schema.enums.len()
        );
        Ok(snapshot)
    }

    async fn history(&self) -> Result<Vec<SnapshotMetadata>> {
        Ok(self.snapshots.read().await.iter().map(SnapshotMetadata::from).collect())
    }

    async fn load(&self, revision: u64) -> Result<Option<Snapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .iter()
            .find(|s| s.revision == revision)
            .cloned())
    }

    async fn lock(&self, timeout: Duration) -> Result<StoreLock> {
        let started = Instant::now();
        loop {
            {
                let mut holder = self.holder.lock().await;
                if holder.is_none() {
                    let lock = StoreLock::new();
                    *holder = Some(lock.clone());
                    debug!("Acquired in-memory store lock {}", lock.owner);
                    return Ok(lock);
                }
                if started.elapsed() >= timeout {
                    return Err(MigrateError::LockTimeout {
                        holder: holder.as_ref().map(StoreLock::describe).unwrap_or_default(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lock: StoreLock) -> Result<()> {
        let mut holder = self.holder.lock().await;
        if holder.as_ref().is_some_and(|h| h.owner == lock.owner) {
            *holder = None;
            debug!("Released in-memory store lock {}", lock.owner);
        }
        Ok(())
    }
}
