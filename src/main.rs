//! SchemaFlow Migrate CLI
//!
//! ```text
//! schemaflow-migrate plan    --schema declared.json
//! schemaflow-migrate apply   --schema declared.json [--allow-destructive]
//! schemaflow-migrate drift
//! schemaflow-migrate history
//! ```
//!
//! Exit codes: 0 done, 2 invalid input, 3 partial apply, 4 confirmation
//! required, 75 retry later, 1 anything else.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use schemaflow_migrate::config::{DiffBase, Settings};
use schemaflow_migrate::connection::PostgresConnection;
use schemaflow_migrate::engine::{EngineOptions, MigrationEngine, RunOutcome};
use schemaflow_migrate::error::{ErrorReport, MigrateError};
use schemaflow_migrate::model::Schema;
use schemaflow_migrate::snapshot::FileSnapshotStore;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "schemaflow-migrate", version, about = "Diff, plan and apply PostgreSQL schema changes")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Connection string (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Namespace to manage (overrides SCHEMAFLOW_SCHEMA)
    #[arg(long = "namespace", global = true)]
    namespace: Option<String>,

    /// Snapshot directory (overrides SCHEMAFLOW_SNAPSHOT_DIR)
    #[arg(long, global = true)]
    snapshot_dir: Option<PathBuf>,

    /// Seconds to wait for the migration lock
    #[arg(long, global = true)]
    lock_timeout: Option<u64>,

    /// Where the current state comes from: live or snapshot
    #[arg(long, global = true)]
    diff_base: Option<DiffBase>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "SCHEMAFLOW_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the plan without changing anything
    Plan {
        /// Declared schema (JSON)
        #[arg(long = "schema")]
        schema: PathBuf,

        /// Print the plan as JSON instead of SQL
        #[arg(long)]
        json: bool,
    },
    /// Apply the plan and record a snapshot
    Apply {
        #[arg(long = "schema")]
        schema: PathBuf,

        /// Run steps classified data-loss-risk or requires-manual-confirmation
        #[arg(long)]
        allow_destructive: bool,

        /// Re-introspect afterwards and report drift
        #[arg(long)]
        verify: bool,

        /// Label stored with the snapshot
        #[arg(long)]
        label: Option<String>,
    },
    /// Compare the latest snapshot with the live database
    Drift,
    /// List recorded snapshots
    History,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.global.json_logs);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let code = match e.downcast_ref::<MigrateError>() {
                Some(migrate) => {
                    let report = ErrorReport::from(migrate);
                    error!(code = %report.code, retryable = report.retryable, "❌ {}", report.message);
                    migrate.exit_code()
                }
                None => {
                    error!("❌ {:#}", e);
                    1
                }
            };
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let settings = apply_overrides(Settings::load().map_err(MigrateError::from)?, &cli.global);
    info!("📋 Configuration loaded (namespace '{}', snapshots in {})", settings.schema, settings.snapshot_dir.display());

    let store = FileSnapshotStore::open(&settings.snapshot_dir).await?;
    let mut options = EngineOptions::from(&settings);

    match cli.command {
        Command::History => {
            let engine = MigrationEngine::new(&store, options);
            let history = engine.history().await?;
            if history.is_empty() {
                println!("No snapshots recorded in {}", store.dir().display());
            }
            for meta in history {
                println!(
                    "r{:<5} {}  {:>3} tables {:>3} enums  {}  {}",
                    meta.revision,
                    meta.created_at.format("%Y-%m-%d %H:%M:%S"),
                    meta.table_count,
                    meta.enum_count,
                    &meta.checksum[..12.min(meta.checksum.len())],
                    meta.label.unwrap_or_default()
                );
            }
            Ok(0)
        }
        Command::Drift => {
            let mut conn = connect(&settings).await?;
            let engine = MigrationEngine::new(&store, options);
            let drift = engine.check_drift(&mut conn).await?;
            println!("{}", serde_json::to_string_pretty(&drift)?);
            Ok(if drift.has_drift() { 1 } else { 0 })
        }
        Command::Plan { schema, json } => {
            let declared = read_schema(&schema).await?;
            let mut conn = connect(&settings).await?;
            let engine = MigrationEngine::new(&store, options);
            let prepared = engine.plan(&mut conn, &declared).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&prepared.plan)?);
            } else if prepared.plan.is_empty() {
                println!("-- Schema '{}' is up to date", settings.schema);
            } else {
                print!("{}", prepared.plan.to_sql());
            }
            Ok(if prepared.plan.requires_confirmation() { 4 } else { 0 })
        }
        Command::Apply {
            schema,
            allow_destructive,
            verify,
            label,
        } => {
            let declared = read_schema(&schema).await?;
            options.allow_destructive = allow_destructive;
            options.verify_after_apply |= verify;
            options.label = label;

            let mut conn = connect(&settings).await?;
            let engine = MigrationEngine::new(&store, options);
            let outcome = engine.run(&mut conn, &declared).await?;
            report(&outcome)?;
            Ok(outcome.exit_code() as u8)
        }
    }
}

fn apply_overrides(mut settings: Settings, args: &GlobalArgs) -> Settings {
    if let Some(url) = &args.database_url {
        settings.database_url = Some(url.clone());
    }
    if let Some(namespace) = &args.namespace {
        settings.schema = namespace.clone();
    }
    if let Some(dir) = &args.snapshot_dir {
        settings.snapshot_dir = dir.clone();
    }
    if let Some(secs) = args.lock_timeout {
        settings.lock_timeout = Duration::from_secs(secs);
    }
    if let Some(base) = args.diff_base {
        settings.diff_base = base;
    }
    settings
}

async fn connect(settings: &Settings) -> anyhow::Result<PostgresConnection> {
    let params = settings.connection_params().map_err(MigrateError::from)?;
    info!("🔌 Connecting to {}", params.to_display_string());
    Ok(PostgresConnection::connect(&params, settings.connect_retries, settings.retry_backoff).await?)
}

async fn read_schema(path: &Path) -> anyhow::Result<Schema> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading declared schema {}", path.display()))?;
    let schema: Schema = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing declared schema {}", path.display()))?;
    Ok(schema)
}

fn report(outcome: &RunOutcome) -> anyhow::Result<()> {
    match outcome {
        RunOutcome::UpToDate { revision } => {
            println!("Up to date (snapshot r{})", revision.unwrap_or_default());
        }
        RunOutcome::Applied { report, drift } => {
            println!("{}", serde_json::to_string_pretty(report)?);
            if let Some(drift) = drift.as_ref().filter(|d| d.has_drift()) {
                warn!("Live schema differs from the recorded state after apply");
                println!("{}", serde_json::to_string_pretty(drift)?);
            }
        }
        RunOutcome::ConfirmationRequired { plan } => {
            print!("{}", plan.to_sql());
            warn!(
                "Plan contains {} step(s) that are not safe; re-run with --allow-destructive to apply",
                plan.risky_steps().count()
            );
        }
        RunOutcome::PartialFailure { failed_step, report } => {
            println!("{}", serde_json::to_string_pretty(report)?);
            error!(
                "Stopped at step {}; snapshot r{} records the partial state",
                failed_step, report.snapshot.revision
            );
        }
        RunOutcome::PlanningError(e) => {
            error!(code = e.code(), "❌ {}", e);
        }
    }
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,schemaflow_migrate=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_level(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}
