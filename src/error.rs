//! Error handling module
//!
//! Provides the unified error taxonomy for the migration engine.
//! Every fatal variant names the entity it concerns.

use serde::Serialize;
use thiserror::Error;

/// Engine-wide error type
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Transient failure talking to the database (retryable)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The connection dropped while a plan was being applied
    #[error("Connection lost while applying step {step}: {reason}")]
    ConnectionLost { step: usize, reason: String },

    #[error("Unsupported catalog: {0}")]
    UnsupportedCatalog(String),

    #[error("Invalid schema: {entity}: {reason}")]
    InvalidSchema { entity: String, reason: String },

    #[error("Concurrent modification of snapshot store: {0}")]
    ConcurrentModification(String),

    #[error("Timed out after {waited_ms}ms waiting for migration lock held by {holder}")]
    LockTimeout { holder: String, waited_ms: u64 },

    /// The delta needs information the engine refuses to guess
    #[error("Ambiguous change on {entity}: {reason}")]
    AmbiguousChange { entity: String, reason: String },

    #[error("Unresolvable foreign key cycle between tables [{}]: {reason}", .tables.join(", "))]
    UnresolvableCycle { tables: Vec<String>, reason: String },

    #[error("Statement failed in step {step} ({description}): {reason}")]
    StatementFailed {
        step: usize,
        description: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MigrateError {
    /// Transient errors that an operator (or caller) may simply retry later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrateError::ConnectionError(_)
                | MigrateError::ConcurrentModification(_)
                | MigrateError::LockTimeout { .. }
        )
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            MigrateError::ConnectionError(_) => "CONNECTION_ERROR",
            MigrateError::ConnectionLost { .. } => "CONNECTION_LOST",
            MigrateError::UnsupportedCatalog(_) => "UNSUPPORTED_CATALOG",
            MigrateError::InvalidSchema { .. } => "INVALID_SCHEMA",
            MigrateError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            MigrateError::LockTimeout { .. } => "LOCK_TIMEOUT",
            MigrateError::AmbiguousChange { .. } => "AMBIGUOUS_CHANGE",
            MigrateError::UnresolvableCycle { .. } => "UNRESOLVABLE_CYCLE",
            MigrateError::StatementFailed { .. } => "STATEMENT_FAILED",
            MigrateError::Config(_) => "CONFIG_ERROR",
            MigrateError::Io(_) => "IO_ERROR",
            MigrateError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Process exit code for the CLI layer.
    ///
    /// 2 = operator must fix input, 3 = partial apply,
    /// 75 (EX_TEMPFAIL) = retry later, 1 = anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            e if e.is_retryable() => 75,
            MigrateError::InvalidSchema { .. }
            | MigrateError::UnsupportedCatalog(_)
            | MigrateError::AmbiguousChange { .. }
            | MigrateError::UnresolvableCycle { .. }
            | MigrateError::Config(_) => 2,
            MigrateError::ConnectionLost { .. } | MigrateError::StatementFailed { .. } => 3,
            _ => 1,
        }
    }

    /// Planning errors halt before any statement runs
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            MigrateError::InvalidSchema { .. }
                | MigrateError::AmbiguousChange { .. }
                | MigrateError::UnresolvableCycle { .. }
        )
    }
}

impl From<tokio_postgres::Error> for MigrateError {
    fn from(e: tokio_postgres::Error) -> Self {
        MigrateError::ConnectionError(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for MigrateError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        MigrateError::ConnectionError(format!("Pool error: {}", e))
    }
}

/// Serializable error report for structured output
#[derive(Debug, Serialize)]
pub struct ErrorReport {
    pub success: bool,
    pub message: String,
    pub code: String,
    pub retryable: bool,
}

impl From<&MigrateError> for ErrorReport {
    fn from(e: &MigrateError) -> Self {
        Self {
            success: false,
            message: e.to_string(),
            code: e.code().to_string(),
            retryable: e.is_retryable(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, MigrateError>;

/// Helper function to create an invalid schema error
pub fn invalid_schema(entity: impl Into<String>, reason: impl Into<String>) -> MigrateError {
    MigrateError::InvalidSchema {
        entity: entity.into(),
        reason: reason.into(),
    }
}

/// Helper function to create an ambiguous change error
pub fn ambiguous_change(entity: impl Into<String>, reason: impl Into<String>) -> MigrateError {
    MigrateError::AmbiguousChange {
        entity: entity.into(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MigrateError::ConnectionError("reset".into()).is_retryable());
        assert!(MigrateError::LockTimeout { holder: "pid 1".into(), waited_ms: 10 }.is_retryable());
        assert!(!invalid_schema("users", "duplicate").is_retryable());
        assert!(!MigrateError::ConnectionLost { step: 2, reason: "eof".into() }.is_retryable());
    }

    #[test]
    fn test_messages_name_the_entity() {
        let err = ambiguous_change("users.age", "NOT NULL without default on non-empty table");
        assert!(err.to_string().contains("users.age"));

        let err = MigrateError::UnresolvableCycle {
            tables: vec!["a".into(), "b".into()],
            reason: "all NOT NULL".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unresolvable foreign key cycle between tables [a, b]: all NOT NULL"
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::ConnectionError("x".into()).exit_code(), 75);
        assert_eq!(invalid_schema("t", "r").exit_code(), 2);
        assert_eq!(MigrateError::ConnectionLost { step: 1, reason: "x".into() }.exit_code(), 3);
        assert_eq!(ErrorReport::from(&invalid_schema("t", "r")).code, "INVALID_SCHEMA");
    }
}
