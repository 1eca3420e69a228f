//! SchemaFlow Migrate - declarative schema migrations
//!
//! Compare a declared schema with what a database actually holds, turn the
//! difference into an ordered and classified plan, apply it, and keep an
//! append-only history of every state reached.
//!
//! Pipeline:
//! - Introspect (`introspection`): read the live catalog into a [`model::Schema`]
//! - Diff (`diff`): structural delta between two schemas
//! - Plan (`plan`): dependency-ordered, classified DDL steps
//! - Apply (`apply`): per-step transactions, halt on first failure
//! - Record (`snapshot`): immutable, revisioned schema snapshots
//!
//! [`engine::MigrationEngine`] ties the stages together under the snapshot
//! store's writer lock.

pub mod apply;
pub mod config;
pub mod connection;
pub mod diff;
pub mod engine;
pub mod error;
pub mod introspection;
pub mod model;
pub mod plan;
pub mod snapshot;

pub use engine::{EngineOptions, MigrationEngine, RunOutcome};
pub use error::{MigrateError, Result};
pub use model::Schema;
