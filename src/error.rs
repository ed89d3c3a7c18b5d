// ABOUTME: Error taxonomy for connection, migration, and access-control failures
// ABOUTME: Every variant carries the version/role/table it failed on for operators

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Low-level database failure, independent of which provisioning step hit it
#[derive(Error, Debug)]
pub enum DbError {
    #[error("{}", server_message(.0))]
    Postgres(tokio_postgres::Error),

    #[error("{hint}: {source}")]
    Connect {
        hint: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl From<tokio_postgres::Error> for DbError {
    fn from(error: tokio_postgres::Error) -> Self {
        DbError::Postgres(error)
    }
}

/// The server's own message (plus detail) when there is one, else the driver's text
fn server_message(error: &tokio_postgres::Error) -> String {
    match error.as_db_error() {
        Some(db) => match db.detail() {
            Some(detail) => format!("{} ({})", db.message(), detail),
            None => db.message().to_string(),
        },
        None => error.to_string(),
    }
}

impl DbError {
    /// True when the server rejected the statement because the object already exists
    /// (SQLSTATE 42710 duplicate_object)
    pub fn is_duplicate_object(&self) -> bool {
        match self {
            DbError::Postgres(e) => e.code() == Some(&SqlState::DUPLICATE_OBJECT),
            _ => false,
        }
    }
}

/// Outcome of a failed [`Database::with_transaction`](crate::postgres::Database::with_transaction)
///
/// Exactly one of commit or rollback has been attempted by the time this is returned.
#[derive(Error, Debug)]
pub enum TxError<E> {
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] DbError),

    #[error(transparent)]
    Aborted(E),

    #[error("transaction error: {cause}, rollback error: {rollback}")]
    RollbackFailed {
        cause: E,
        #[source]
        rollback: DbError,
    },

    #[error("failed to commit transaction: {0}")]
    Commit(#[source] DbError),

    #[error("transaction cancelled and rolled back")]
    Cancelled,
}

/// Which half of a migration transaction failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStage {
    Begin,
    Record,
    Execute,
    Commit,
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            MigrationStage::Begin => "begin",
            MigrationStage::Record => "ledger insert",
            MigrationStage::Execute => "schema change",
            MigrationStage::Commit => "commit",
        };
        f.write_str(stage)
    }
}

/// Whether a privilege statement was a grant or a revoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantAction {
    Grant,
    Revoke,
}

impl fmt::Display for GrantAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrantAction::Grant => f.write_str("grant"),
            GrantAction::Revoke => f.write_str("revoke"),
        }
    }
}

/// Provisioning failures, grouped the way operators diagnose them
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Cannot open or ping the database (P001)
    #[error("[P001] Database connection failed: {0}")]
    Connection(#[source] DbError),

    /// Cannot create or read the migration ledger (P002)
    #[error("[P002] Migration ledger {operation} failed: {source}")]
    Ledger {
        operation: &'static str,
        #[source]
        source: DbError,
    },

    /// A specific migration version failed; earlier versions stay committed (P003)
    #[error("[P003] Failed to apply migration {version} ({stage}): {source}")]
    Migration {
        version: String,
        stage: MigrationStage,
        #[source]
        source: DbError,
    },

    /// A migration failed and its rollback failed too (P004)
    #[error("[P004] Migration {version} failed ({cause}) and rollback failed: {rollback}")]
    MigrationRollback {
        version: String,
        cause: DbError,
        #[source]
        rollback: DbError,
    },

    /// Role creation, existence check, or drop failed (P005)
    #[error("[P005] Role operation on '{role}' failed: {source}")]
    Role {
        role: String,
        #[source]
        source: DbError,
    },

    /// A privilege grant/revoke failed after `applied` earlier privileges succeeded (P006)
    #[error("[P006] Failed to {action} {privilege} on {table} for {role} ({applied} privilege(s) already applied): {source}")]
    Grant {
        action: GrantAction,
        privilege: String,
        table: String,
        role: String,
        applied: usize,
        #[source]
        source: DbError,
    },

    /// Policy creation/drop failed (P007)
    #[error("[P007] Policy '{policy}' on {table} failed: {source}")]
    Policy {
        policy: String,
        table: String,
        #[source]
        source: DbError,
    },

    /// Policy definition rejected before reaching the database (P008)
    #[error("[P008] Invalid policy '{policy}': {reason}")]
    InvalidPolicy { policy: String, reason: String },

    /// Enabling/disabling row-level security failed (P009)
    #[error("[P009] Failed to {action} row level security on {table}: {source}")]
    Rls {
        action: &'static str,
        table: String,
        #[source]
        source: DbError,
    },

    /// Extension or declarative schema statement failed (P010)
    #[error("[P010] Schema statement '{name}' failed: {source}")]
    Schema {
        name: String,
        #[source]
        source: DbError,
    },

    /// Reset/drop failed; nothing further was attempted (P011)
    #[error("[P011] Destructive action on {table} failed: {source}")]
    DestructiveAction {
        table: String,
        #[source]
        source: DbError,
    },

    /// Caller-supplied input is unusable (P012)
    #[error("[P012] Invalid configuration: {0}")]
    Config(String),

    /// The caller's cancellation token fired (P013)
    #[error("[P013] {operation} cancelled")]
    Cancelled { operation: String },
}

/// Result type alias for ProvisionError
pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_error_reports_partial_progress() {
        let err = ProvisionError::Grant {
            action: GrantAction::Grant,
            privilege: "DELETE".to_string(),
            table: "users".to_string(),
            role: "user_service".to_string(),
            applied: 3,
            source: DbError::Other("permission denied for table users".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("[P006]"));
        assert!(msg.contains("grant DELETE on users for user_service"));
        assert!(msg.contains("3 privilege(s) already applied"));
    }

    #[test]
    fn test_migration_error_names_version_and_stage() {
        let err = ProvisionError::Migration {
            version: "002".to_string(),
            stage: MigrationStage::Execute,
            source: DbError::Other("syntax error at or near \"TABL\"".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "[P003] Failed to apply migration 002 (schema change): syntax error at or near \"TABL\""
        );
    }

    #[test]
    fn test_rollback_failure_wraps_both_causes() {
        let err: TxError<DbError> = TxError::RollbackFailed {
            cause: DbError::Other("boom".to_string()),
            rollback: DbError::PoolClosed,
        };
        assert_eq!(
            err.to_string(),
            "transaction error: boom, rollback error: connection pool is closed"
        );
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("connection pool is closed"));
    }

    #[test]
    fn test_non_server_errors_are_not_duplicates() {
        assert!(!DbError::Other("role \"x\" already exists".into()).is_duplicate_object());
        assert!(!DbError::Cancelled.is_duplicate_object());
    }

    #[tokio::test]
    #[ignore]
    async fn test_server_errors_carry_the_server_message() {
        use crate::config::DbConfig;
        use crate::postgres::Database;

        let url = std::env::var("TEST_DATABASE_URL").unwrap();
        let db = Database::open(DbConfig::from_url(&url).unwrap()).await.unwrap();
        let client = db.acquire().await.unwrap();
        let err = DbError::from(
            client
                .batch_execute("SELECT * FROM no_such_relation_anywhere")
                .await
                .unwrap_err(),
        );
        let err = ProvisionError::Schema {
            name: "lookup".to_string(),
            source: err,
        };
        let msg = err.to_string();
        assert!(msg.contains("relation \"no_such_relation_anywhere\" does not exist"), "{}", msg);
        assert!(!msg.contains("db error"), "{}", msg);
    }
}
