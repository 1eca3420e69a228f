//! Migration engine
//!
//! Drives one run end to end: lock the snapshot store, read the current
//! state, diff it against the declared schema, plan, apply, and record.
//! The store lock is held from the first catalog read until the snapshot
//! is written.

use crate::apply::{Applier, ApplyReport};
use crate::config::{DiffBase, Settings};
use crate::connection::Connection;
use crate::diff::{Delta, DiffEngine};
use crate::error::{invalid_schema, MigrateError, Result};
use crate::introspection::PostgresIntrospector;
use crate::model::Schema;
use crate::plan::{Dialect, MigrationPlan, Planner, PostgresDialect};
use crate::snapshot::{SnapshotMetadata, SnapshotStore, StoreLock};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-run knobs
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub namespace: String,
    pub lock_timeout: Duration,
    pub diff_base: DiffBase,
    pub verify_after_apply: bool,
    /// Apply plans containing steps that are not `safe`
    pub allow_destructive: bool,
    pub label: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for EngineOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            namespace: settings.schema.clone(),
            lock_timeout: settings.lock_timeout,
            diff_base: settings.diff_base,
            verify_after_apply: settings.verify_after_apply,
            allow_destructive: false,
            label: None,
        }
    }
}

/// A plan together with the state it was computed from
#[derive(Debug, Clone)]
pub struct PreparedMigration {
    pub before: Schema,
    /// Snapshot revision used as the base, `None` when read live
    pub base_revision: Option<u64>,
    pub delta: Delta,
    pub plan: MigrationPlan,
}

/// Differences between the recorded state and the live database
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub namespace: String,
    pub revision: Option<u64>,
    pub recorded_checksum: Option<String>,
    pub live_checksum: String,
    /// Changes that turn the recorded state into the live one
    pub delta: Delta,
}

impl DriftReport {
    pub fn has_drift(&self) -> bool {
        !self.delta.is_empty()
    }
}

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    UpToDate {
        revision: Option<u64>,
    },
    Applied {
        report: ApplyReport,
        drift: Option<DriftReport>,
    },
    /// Nothing ran; the plan has risky steps and destructive changes were
    /// not allowed
    ConfirmationRequired {
        plan: MigrationPlan,
    },
    PartialFailure {
        failed_step: usize,
        report: ApplyReport,
    },
    /// Rejected before any statement ran
    PlanningError(MigrateError),
}

impl RunOutcome {
    /// 0 = done, 4 = needs confirmation, 3 = partial apply, 2 = bad input
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::UpToDate { .. } | RunOutcome::Applied { .. } => 0,
            RunOutcome::ConfirmationRequired { .. } => 4,
            RunOutcome::PartialFailure { .. } => 3,
            RunOutcome::PlanningError(e) => e.exit_code(),
        }
    }
}

pub struct MigrationEngine<'a> {
    store: &'a dyn SnapshotStore,
    dialect: PostgresDialect,
    options: EngineOptions,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(store: &'a dyn SnapshotStore, options: EngineOptions) -> Self {
        Self {
            store,
            dialect: PostgresDialect::new(options.namespace.clone()),
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Compute the plan without taking the lock or changing anything
    pub async fn plan(&self, conn: &mut dyn Connection, declared: &Schema) -> Result<PreparedMigration> {
        if declared.name != self.options.namespace {
            return Err(invalid_schema(
                &declared.name,
                format!("declared schema targets '{}' but the engine manages '{}'", declared.name, self.options.namespace),
            ));
        }
        let declared = declared.clone().normalized();
        declared.validate()?;
        debug!("Planning '{}' for {:?} with the {} dialect", declared.name, conn.database_type(), self.dialect.name());

        let (before, base_revision) = self.current_state(conn).await?;
        let delta = DiffEngine::diff(&before, &declared);
        debug!("Delta has {} changes", delta.len());

        let needs_check = Planner::tables_needing_row_check(&delta);
        let presence = if needs_check.is_empty() {
            Default::default()
        } else {
            PostgresIntrospector::row_presence(conn, &self.options.namespace, &needs_check).await?
        };

        let plan = Planner::new(&self.dialect).plan(&before, &delta, &presence)?;
        Ok(PreparedMigration {
            before,
            base_revision,
            delta,
            plan,
        })
    }

    /// Bring the database to `declared`
    pub async fn run(&self, conn: &mut dyn Connection, declared: &Schema) -> Result<RunOutcome> {
        let lock = self.store.lock(self.options.lock_timeout).await?;
        info!("🔒 Acquired migration lock ({})", lock.describe());

        let outcome = self.run_locked(conn, declared, &lock).await;

        if let Err(e) = self.store.release(lock).await {
            warn!("Failed to release migration lock: {}", e);
        }
        outcome
    }

    async fn run_locked(&self, conn: &mut dyn Connection, declared: &Schema, lock: &StoreLock) -> Result<RunOutcome> {
        let prepared = match self.plan(conn, declared).await {
            Ok(prepared) => prepared,
            Err(e) if e.is_planning_error() => {
                warn!("Planning rejected the declared schema: {}", e);
                return Ok(RunOutcome::PlanningError(e));
            }
            Err(e) => return Err(e),
        };

        if prepared.plan.is_empty() {
            let revision = match self.store.load_latest().await? {
                Some(latest) => latest.revision,
                None => {
                    let baseline = self
                        .store
                        .append(lock, &prepared.before, Some("baseline".to_string()))
                        .await?;
                    baseline.revision
                }
            };
            info!("✅ Schema '{}' is up to date (r{})", self.options.namespace, revision);
            return Ok(RunOutcome::UpToDate {
                revision: Some(revision),
            });
        }

        if prepared.plan.requires_confirmation() && !self.options.allow_destructive {
            for step in prepared.plan.risky_steps() {
                warn!("⚠️  Step {} [{}]: {}", step.number, step.classification, step.description);
            }
            return Ok(RunOutcome::ConfirmationRequired { plan: prepared.plan });
        }

        let report = Applier::new(self.store)
            .apply(conn, lock, &prepared.before, &prepared.plan, self.options.label.clone())
            .await?;

        if let Some(failed_step) = report.failed_step.as_ref().map(|f| f.number) {
            return Ok(RunOutcome::PartialFailure { failed_step, report });
        }

        let drift = if self.options.verify_after_apply {
            match PostgresIntrospector::introspect(conn, &self.options.namespace).await {
                Ok(live) => {
                    let drift = Self::compare(&report.achieved, Some(report.snapshot.revision), live);
                    Self::log_drift(&drift);
                    Some(drift)
                }
                Err(e) => {
                    warn!("Post-apply verification skipped: {}", e);
                    None
                }
            }
        } else {
            None
        };

        info!(
            "✅ Applied {} steps in {}ms, recorded as r{}",
            report.applied_steps.len(),
            report.duration_ms,
            report.snapshot.revision
        );
        Ok(RunOutcome::Applied { report, drift })
    }

    /// Compare the latest snapshot with the live database
    pub async fn check_drift(&self, conn: &mut dyn Connection) -> Result<DriftReport> {
        let latest = self.store.load_latest().await?;
        let live = PostgresIntrospector::introspect(conn, &self.options.namespace).await?;

        let drift = match latest {
            Some(snapshot) => Self::compare(&snapshot.schema, Some(snapshot.revision), live),
            None => {
                info!("No snapshot recorded yet; every live object counts as drift");
                let mut drift = Self::compare(&Schema::new(&self.options.namespace), None, live);
                drift.recorded_checksum = None;
                drift
            }
        };
        Self::log_drift(&drift);
        Ok(drift)
    }

    /// Snapshot metadata, oldest first
    pub async fn history(&self) -> Result<Vec<SnapshotMetadata>> {
        self.store.history().await
    }

    async fn current_state(&self, conn: &mut dyn Connection) -> Result<(Schema, Option<u64>)> {
        if self.options.diff_base == DiffBase::Snapshot {
            if let Some(snapshot) = self.store.load_latest().await? {
                debug!("Diffing against snapshot r{}", snapshot.revision);
                return Ok((snapshot.schema, Some(snapshot.revision)));
            }
            info!("No snapshot recorded yet, introspecting the live database");
        }
        let live = PostgresIntrospector::introspect(conn, &self.options.namespace).await?;
        Ok((live, None))
    }

    fn compare(recorded: &Schema, revision: Option<u64>, live: Schema) -> DriftReport {
        DriftReport {
            namespace: live.name.clone(),
            revision,
            recorded_checksum: Some(recorded.checksum()),
            live_checksum: live.checksum(),
            delta: DiffEngine::diff(recorded, &live),
        }
    }

    fn log_drift(drift: &DriftReport) {
        if !drift.has_drift() {
            info!("No drift between recorded and live schema '{}'", drift.namespace);
            return;
        }
        warn!("Live schema '{}' drifted by {} changes", drift.namespace, drift.delta.len());
        for change in drift.delta.iter() {
            warn!("  drift: {}", change.description());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::{Failure, ScriptedConnection};
    use crate::connection::Row;
    use crate::model::{Column, Constraint, LogicalType, Table};
    use crate::snapshot::MemorySnapshotStore;
    use pretty_assertions::assert_eq;

    fn column(name: &str, ty: &str, nullable: bool) -> Row {
        Row::new()
            .with("table_name", "users")
            .with("column_name", name)
            .with("data_type", ty)
            .with("is_nullable", nullable)
            .with("default_expr", Option::<&str>::None)
            .with("identity_kind", "")
            .with("generated_kind", "")
    }

    fn empty_database() -> ScriptedConnection {
        ScriptedConnection::new()
            .respond("server_version", vec![Row::new().with("server_version", 160002i64)])
            .respond("namespace_exists", vec![Row::new().with("namespace_exists", true)])
    }

    /// Live `users (id integer primary key, ...)`
    fn users_database(extra: Vec<Row>, has_rows: bool) -> ScriptedConnection {
        let mut columns = vec![column("id", "integer", false)];
        columns.extend(extra);
        empty_database()
            .respond("relation_name", vec![Row::new().with("relation_name", "users")])
            .respond("attgenerated", columns)
            .respond("indexrelid", vec![])
            .respond(
                "contype",
                vec![Row::new()
                    .with("table_name", "users")
                    .with("constraint_name", "users_pkey")
                    .with("constraint_type", "p")
                    .with("columns", vec!["id"])
                    .with("referenced_table", Option::<&str>::None)
                    .with("referenced_columns", Vec::<&str>::new())
                    .with("on_delete", " ")
                    .with("on_update", " ")
                    .with("is_deferrable", false)
                    .with("definition", "PRIMARY KEY (id)")],
            )
            .respond("has_rows", vec![Row::new().with("has_rows", has_rows)])
    }

    fn users(extra: Vec<Column>) -> Schema {
        let mut table = Table::new("users")
            .with_column(Column::new("id", LogicalType::Integer))
            .with_constraint(Constraint::primary_key(&["id"]));
        for c in extra {
            table = table.with_column(c);
        }
        Schema::new("public").with_table(table)
    }

    fn options() -> EngineOptions {
        EngineOptions {
            lock_timeout: Duration::from_millis(50),
            ..EngineOptions::default()
        }
    }

    #[tokio::test]
    async fn test_run_creates_missing_table() {
        let store = MemorySnapshotStore::new();
        let engine = MigrationEngine::new(&store, options());
        let mut conn = empty_database();

        let outcome = engine.run(&mut conn, &users(vec![])).await.unwrap();
        assert_eq!(outcome.exit_code(), 0);
        match outcome {
            RunOutcome::Applied { report, drift } => {
                assert_eq!(report.applied_steps, vec![1]);
                assert!(drift.is_none());
            }
            other => panic!("expected Applied, got {:?}", other),
        }
        assert!(conn.executed.iter().any(|s| s.starts_with(r#"CREATE TABLE "public"."users""#)));

        let latest = store.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.revision, 1);
        assert_eq!(latest.schema, users(vec![]).normalized());

        // Lock was released
        assert!(store.lock(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_up_to_date_records_baseline_once() {
        let store = MemorySnapshotStore::new();
        let engine = MigrationEngine::new(&store, options());

        let mut conn = users_database(vec![], true);
        let outcome = engine.run(&mut conn, &users(vec![])).await.unwrap();
        assert!(matches!(outcome, RunOutcome::UpToDate { revision: Some(1) }));
        assert!(conn.executed.is_empty());

        let mut conn = users_database(vec![], true);
        let outcome = engine.run(&mut conn, &users(vec![])).await.unwrap();
        assert!(matches!(outcome, RunOutcome::UpToDate { revision: Some(1) }));
        assert_eq!(engine.history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_risky_plan_needs_confirmation() {
        let store = MemorySnapshotStore::new();
        let live = || users_database(vec![column("nickname", "text", true)], true);

        let engine = MigrationEngine::new(&store, options());
        let mut conn = live();
        let outcome = engine.run(&mut conn, &users(vec![])).await.unwrap();
        assert_eq!(outcome.exit_code(), 4);
        match &outcome {
            RunOutcome::ConfirmationRequired { plan } => {
                assert_eq!(plan.steps[0].description, "Drop column users.nickname")
            }
            other => panic!("expected ConfirmationRequired, got {:?}", other),
        }
        assert!(conn.executed.is_empty());
        assert!(store.load_latest().await.unwrap().is_none());

        let engine = MigrationEngine::new(
            &store,
            EngineOptions {
                allow_destructive: true,
                ..options()
            },
        );
        let mut conn = live();
        let outcome = engine.run(&mut conn, &users(vec![])).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Applied { .. }));
        assert!(conn
            .executed
            .contains(&r#"ALTER TABLE "public"."users" DROP COLUMN "nickname""#.to_string()));
    }

    #[tokio::test]
    async fn test_ambiguous_column_is_a_planning_error() {
        let store = MemorySnapshotStore::new();
        let engine = MigrationEngine::new(&store, options());
        let declared = users(vec![Column::new("age", LogicalType::Integer).not_null()]);

        let mut conn = users_database(vec![], true);
        let outcome = engine.run(&mut conn, &declared).await.unwrap();
        match &outcome {
            RunOutcome::PlanningError(MigrateError::AmbiguousChange { entity, .. }) => {
                assert_eq!(entity, "users.age")
            }
            other => panic!("expected AmbiguousChange, got {:?}", other),
        }
        assert_eq!(outcome.exit_code(), 2);
        assert!(conn.executed.is_empty());
        assert!(store.lock(Duration::from_millis(10)).await.is_ok());

        // Same change on an empty table goes through
        let store = MemorySnapshotStore::new();
        let engine = MigrationEngine::new(&store, options());
        let mut conn = users_database(vec![], false);
        assert!(matches!(
            engine.run(&mut conn, &declared).await.unwrap(),
            RunOutcome::Applied { .. }
        ));
    }

    #[tokio::test]
    async fn test_partial_failure_is_recorded() {
        let store = MemorySnapshotStore::new();
        let engine = MigrationEngine::new(&store, options());
        let declared = users(vec![
            Column::new("email", LogicalType::text()),
            Column::new("nickname", LogicalType::text()),
        ]);
        let mut conn = users_database(vec![], true).fail_on("\"nickname\"", Failure::Reject);

        let outcome = engine.run(&mut conn, &declared).await.unwrap();
        assert_eq!(outcome.exit_code(), 3);
        let RunOutcome::PartialFailure { failed_step, report } = outcome else {
            panic!("expected PartialFailure");
        };
        assert_eq!(failed_step, 2);
        assert_eq!(report.applied_steps, vec![1]);

        let latest = store.load_latest().await.unwrap().unwrap();
        let users = latest.schema.table("users").unwrap();
        assert!(users.column("email").is_some());
        assert!(users.column("nickname").is_none());
    }

    #[tokio::test]
    async fn test_busy_store_times_out() {
        let store = MemorySnapshotStore::new();
        let _held = store.lock(Duration::from_millis(10)).await.unwrap();
        let engine = MigrationEngine::new(&store, options());

        let mut conn = empty_database();
        let err = engine.run(&mut conn, &users(vec![])).await.unwrap_err();
        assert!(matches!(err, MigrateError::LockTimeout { .. }));
        assert!(err.is_retryable());
        assert!(conn.executed.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_base_skips_introspection() {
        let store = MemorySnapshotStore::with_baseline(users(vec![]));
        let engine = MigrationEngine::new(
            &store,
            EngineOptions {
                diff_base: DiffBase::Snapshot,
                ..options()
            },
        );

        // The connection knows nothing; the snapshot alone decides
        let mut conn = ScriptedConnection::new();
        let prepared = engine
            .plan(&mut conn, &users(vec![Column::new("email", LogicalType::text())]))
            .await
            .unwrap();
        assert_eq!(prepared.base_revision, Some(1));
        assert_eq!(prepared.plan.len(), 1);
        assert!(conn.executed.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_namespace_is_rejected() {
        let store = MemorySnapshotStore::new();
        let engine = MigrationEngine::new(&store, options());
        let mut conn = empty_database();

        let outcome = engine.run(&mut conn, &Schema::new("billing")).await.unwrap();
        assert!(matches!(outcome, RunOutcome::PlanningError(MigrateError::InvalidSchema { .. })));
    }

    #[tokio::test]
    async fn test_check_drift() {
        let store = MemorySnapshotStore::with_baseline(users(vec![]));
        let engine = MigrationEngine::new(&store, options());

        let mut conn = users_database(vec![], true);
        assert!(!engine.check_drift(&mut conn).await.unwrap().has_drift());

        let mut conn = users_database(vec![column("nickname", "text", true)], true);
        let drift = engine.check_drift(&mut conn).await.unwrap();
        assert!(drift.has_drift());
        assert_eq!(drift.revision, Some(1));
        assert_eq!(drift.delta.len(), 1);
        assert_ne!(drift.recorded_checksum.as_deref(), Some(drift.live_checksum.as_str()));
    }

    #[tokio::test]
    async fn test_verification_reports_drift_after_apply() {
        let store = MemorySnapshotStore::new();
        let engine = MigrationEngine::new(
            &store,
            EngineOptions {
                verify_after_apply: true,
                ..options()
            },
        );

        // Scripted catalog never changes, so the new column shows as drift
        let mut conn = users_database(vec![], true);
        let outcome = engine
            .run(&mut conn, &users(vec![Column::new("email", LogicalType::text())]))
            .await
            .unwrap();
        let RunOutcome::Applied { drift: Some(drift), .. } = outcome else {
            panic!("expected Applied with verification");
        };
        assert!(drift.has_drift());
        assert_eq!(drift.revision, Some(1));
    }
}
