//! Schema Snapshot Module
//!
//! Append-only history of the schema states the engine has applied.
//! Think of this as "git commits" for your database schema: every run
//! records the state it actually achieved, and the latest revision is
//! the baseline for the next diff.

pub mod file;
pub mod store;

use crate::error::Result;
use crate::model::Schema;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub use file::FileSnapshotStore;
pub use store::MemorySnapshotStore;

/// A recorded schema state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Strictly increasing, starting at 1
    pub revision: u64,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub schema: Schema,
}

impl Snapshot {
    pub fn new(revision: u64, schema: Schema, label: Option<String>) -> Self {
        let schema = schema.normalized();
        Self {
            revision,
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            checksum: schema.checksum(),
            label,
            schema,
        }
    }
}

/// Metadata about a snapshot (lightweight, used for listing)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub revision: u64,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
    pub label: Option<String>,
    pub table_count: usize,
    pub enum_count: usize,
}

impl From<&Snapshot> for SnapshotMetadata {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            revision: snapshot.revision,
            id: snapshot.id,
            created_at: snapshot.created_at,
            checksum: snapshot.checksum.clone(),
            label: snapshot.label.clone(),
            table_count: snapshot.schema.tables.len(),
            enum_count: snapshot.schema.enums.len(),
        }
    }
}

/// Proof of holding the store's single-writer lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreLock {
    pub owner: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl StoreLock {
    pub(crate) fn new() -> Self {
        Self {
            owner: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    /// Human-readable holder description for lock errors
    pub fn describe(&self) -> String {
        format!("pid {} since {} ({})", self.pid, self.acquired_at.to_rfc3339(), self.owner)
    }
}

/// Interval between lock acquisition attempts
pub(crate) const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Persistent, append-only snapshot log with an advisory writer lock
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_latest(&self) -> Result<Option<Snapshot>>;

    /// Record `schema` as the next revision. The caller must hold `lock`.
    async fn append(&self, lock: &StoreLock, schema: &Schema, label: Option<String>) -> Result<Snapshot>;

    /// All revisions, oldest first
    async fn history(&self) -> Result<Vec<SnapshotMetadata>>;

    async fn load(&self, revision: u64) -> Result<Option<Snapshot>>;

    /// Wait up to `timeout` for the writer lock
    async fn lock(&self, timeout: Duration) -> Result<StoreLock>;

    async fn release(&self, lock: StoreLock) -> Result<()>;
}
