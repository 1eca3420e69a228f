//! Applier - executes a migration plan step by step
//!
//! Transactional steps run inside their own `BEGIN`/`COMMIT`; the rest run
//! standalone. The first failing step halts the run. Committed steps are
//! never undone, and the state actually reached is always recorded as a
//! new snapshot.

use crate::connection::Connection;
use crate::error::{MigrateError, Result};
use crate::model::Schema;
use crate::plan::{MigrationPlan, Step};
use crate::snapshot::{SnapshotMetadata, SnapshotStore, StoreLock};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// The step that halted a run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedStep {
    pub number: usize,
    pub description: String,
    pub code: String,
    pub message: String,
}

/// Result of applying a plan
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub id: Uuid,
    /// Step numbers that committed, in order
    pub applied_steps: Vec<usize>,
    pub failed_step: Option<FailedStep>,
    pub executed_statements: Vec<String>,
    pub snapshot: SnapshotMetadata,
    pub duration_ms: u64,
    pub executed_at: DateTime<Utc>,
    /// Schema reached, as recorded in the snapshot
    #[serde(skip)]
    pub achieved: Schema,
    #[serde(skip)]
    pub error: Option<MigrateError>,
}

impl ApplyReport {
    pub fn success(&self) -> bool {
        self.failed_step.is_none()
    }
}

pub struct Applier<'s> {
    store: &'s dyn SnapshotStore,
}

impl<'s> Applier<'s> {
    pub fn new(store: &'s dyn SnapshotStore) -> Self {
        Self { store }
    }

    /// Run `plan` against `conn`, starting from `before`.
    ///
    /// A failing step is reported in the returned [`ApplyReport`], not as
    /// an `Err`; errors are reserved for the snapshot store.
    pub async fn apply(
        &self,
        conn: &mut dyn Connection,
        lock: &StoreLock,
        before: &Schema,
        plan: &MigrationPlan,
        label: Option<String>,
    ) -> Result<ApplyReport> {
        let started = Instant::now();
        let executed_at = Utc::now();
        let mut applied_steps = Vec::new();
        let mut executed_statements = Vec::new();
        let mut failure = None;

        info!("Applying {} steps to schema {}", plan.len(), plan.namespace);

        for step in &plan.steps {
            match Self::run_step(conn, step).await {
                Ok(()) => {
                    info!("✅ Step {}/{}: {}", step.number, plan.len(), step.description);
                    applied_steps.push(step.number);
                    executed_statements.extend(step.statements.iter().cloned());
                }
                Err(e) => {
                    let e = Self::attribute(e, step, conn.is_closed());
                    error!("❌ Step {}/{} failed: {}", step.number, plan.len(), e);
                    failure = Some(e);
                    break;
                }
            }
        }

        let achieved = plan.fold_through(before, applied_steps.len());
        let snapshot = match self.store.append(lock, &achieved, label).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(
                    "Applied {} steps but could not record the resulting schema (checksum {}): {}",
                    applied_steps.len(),
                    achieved.checksum(),
                    e
                );
                return Err(e);
            }
        };

        let failed_step = failure.as_ref().and_then(|e| {
            let number = applied_steps.len() + 1;
            plan.steps.get(number - 1).map(|step| FailedStep {
                number,
                description: step.description.clone(),
                code: e.code().to_string(),
                message: e.to_string(),
            })
        });

        if failed_step.is_some() {
            warn!(
                "Stopped after {} of {} steps; snapshot r{} records the partial state",
                applied_steps.len(),
                plan.len(),
                snapshot.revision
            );
        }

        Ok(ApplyReport {
            id: Uuid::new_v4(),
            applied_steps,
            failed_step,
            executed_statements,
            snapshot: SnapshotMetadata::from(&snapshot),
            duration_ms: started.elapsed().as_millis() as u64,
            executed_at,
            achieved,
            error: failure,
        })
    }

    async fn run_step(conn: &mut dyn Connection, step: &Step) -> Result<()> {
        if !step.transactional {
            for statement in &step.statements {
                conn.execute(statement).await?;
            }
            return Ok(());
        }

        conn.begin().await?;
        for statement in &step.statements {
            if let Err(e) = conn.execute(statement).await {
                Self::rollback_quietly(conn).await;
                return Err(e);
            }
        }
        if let Err(e) = conn.commit().await {
            Self::rollback_quietly(conn).await;
            return Err(e);
        }
        Ok(())
    }

    async fn rollback_quietly(conn: &mut dyn Connection) {
        if conn.is_closed() {
            return;
        }
        if let Err(e) = conn.rollback().await {
            warn!("Rollback failed: {}", e);
        }
    }

    /// Pin an execution error to the step that raised it
    fn attribute(e: MigrateError, step: &Step, connection_closed: bool) -> MigrateError {
        if connection_closed {
            return MigrateError::ConnectionLost {
                step: step.number,
                reason: e.to_string(),
            };
        }
        let reason = match e {
            MigrateError::StatementFailed { reason, .. } => reason,
            other => other.to_string(),
        };
        MigrateError::StatementFailed {
            step: step.number,
            description: step.description.clone(),
            reason,
        }
    }
}
