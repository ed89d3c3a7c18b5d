// ABOUTME: Applies pending migrations in version order, one transaction each
// ABOUTME: Serializes concurrent migrators and stops at the first failing version

use super::{ledger, LedgerEntry, Migration};
use crate::error::{DbError, MigrationStage, ProvisionError, ProvisionResult, TxError};
use crate::postgres::{Database, PooledClient};
use crate::utils;
use std::collections::HashSet;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A migration applied during this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: String,
    pub description: String,
}

/// What a migrator run changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Newly applied, in application order
    pub applied: Vec<AppliedMigration>,
    /// Declared migrations that were already in the ledger when the run started
    pub skipped: usize,
    /// Versions another migrator committed between our snapshot and our insert
    pub raced: Vec<String>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

enum ApplyOutcome {
    Applied,
    AlreadyApplied,
}

#[derive(Debug, Error)]
#[error("{stage}: {source}")]
struct StepError {
    stage: MigrationStage,
    #[source]
    source: DbError,
}

impl StepError {
    fn at(stage: MigrationStage) -> impl FnOnce(tokio_postgres::Error) -> StepError {
        move |e| StepError {
            stage,
            source: e.into(),
        }
    }
}

/// Reject declared sets with empty or repeated versions
pub fn validate_declared(migrations: &[Migration]) -> ProvisionResult<()> {
    let mut seen = HashSet::new();
    for migration in migrations {
        if migration.version.trim().is_empty() {
            return Err(ProvisionError::Config(format!(
                "migration '{}' has an empty version",
                migration.description
            )));
        }
        if !seen.insert(migration.version.as_str()) {
            return Err(ProvisionError::Config(format!(
                "migration version {} is declared more than once",
                migration.version
            )));
        }
    }
    Ok(())
}

/// Pending migrations in ascending (byte-wise) version order
pub fn plan<'m>(migrations: &'m [Migration], applied: &HashSet<String>) -> Vec<&'m Migration> {
    let mut pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();
    pending.sort_by(|a, b| a.version.cmp(&b.version));
    pending
}

/// Diffs declared migrations against the ledger and applies the rest
pub struct Migrator<'a> {
    db: &'a Database,
    cancel: CancellationToken,
}

impl<'a> Migrator<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Ledger contents, creating the ledger first if needed
    pub async fn applied(&self) -> ProvisionResult<Vec<LedgerEntry>> {
        let client = self
            .db
            .acquire()
            .await
            .map_err(ProvisionError::Connection)?;
        self.load_ledger(&*client).await
    }

    /// Apply every declared migration missing from the ledger
    ///
    /// Migrations run in ascending version order, each in its own transaction that
    /// records the ledger row and executes the body. The first failure stops the run;
    /// versions committed before it stay applied, later ones are never attempted.
    pub async fn run(&self, migrations: &[Migration]) -> ProvisionResult<MigrationReport> {
        validate_declared(migrations)?;

        let mut conn = self
            .db
            .acquire()
            .await
            .map_err(ProvisionError::Connection)?;

        tracing::debug!("Waiting for migration lock...");
        let locked = utils::cancellable(&self.cancel, ledger::lock(&*conn)).await;
        if let Err(e) = locked {
            // The lock request may still be granted server-side; closing the session drops it
            conn.mark_broken();
            return Err(match e {
                DbError::Cancelled => ProvisionError::Cancelled {
                    operation: "acquire migration lock".to_string(),
                },
                source => ProvisionError::Ledger {
                    operation: "lock",
                    source,
                },
            });
        }

        let result = self.run_locked(&mut conn, migrations).await;

        let unlocked = ledger::unlock(&*conn).await;
        if let Err(e) = unlocked {
            tracing::warn!("Failed to release migration lock ({}), discarding connection", e);
            conn.mark_broken();
        }

        result
    }

    async fn run_locked(
        &self,
        conn: &mut PooledClient,
        migrations: &[Migration],
    ) -> ProvisionResult<MigrationReport> {
        let applied = self.load_ledger(&**conn).await?;
        let applied: HashSet<String> = applied.into_iter().map(|e| e.version).collect();

        let pending = plan(migrations, &applied);
        let mut report = MigrationReport {
            skipped: migrations.len() - pending.len(),
            ..MigrationReport::default()
        };

        if pending.is_empty() {
            tracing::info!(
                "✓ Schema is up to date ({} migration(s) already applied)",
                report.skipped
            );
            return Ok(report);
        }

        tracing::info!("{} pending migration(s)", pending.len());
        for migration in pending {
            match self.apply_one(conn, migration).await? {
                ApplyOutcome::Applied => {
                    tracing::info!(
                        version = %migration.version,
                        description = %migration.description,
                        "Applied migration: {} - {}",
                        migration.version,
                        migration.description
                    );
                    report.applied.push(AppliedMigration {
                        version: migration.version.clone(),
                        description: migration.description.clone(),
                    });
                }
                ApplyOutcome::AlreadyApplied => {
                    tracing::warn!(
                        "Migration {} was applied concurrently by another process, skipping",
                        migration.version
                    );
                    report.raced.push(migration.version.clone());
                }
            }
        }

        Ok(report)
    }

    async fn load_ledger<C: tokio_postgres::GenericClient>(
        &self,
        client: &C,
    ) -> ProvisionResult<Vec<LedgerEntry>> {
        let cancelled = |operation: &str| ProvisionError::Cancelled {
            operation: operation.to_string(),
        };

        utils::cancellable(&self.cancel, ledger::ensure_exists(client))
            .await
            .map_err(|e| match e {
                DbError::Cancelled => cancelled("create migration ledger"),
                source => ProvisionError::Ledger {
                    operation: "create",
                    source,
                },
            })?;

        utils::cancellable(&self.cancel, ledger::list_applied(client))
            .await
            .map_err(|e| match e {
                DbError::Cancelled => cancelled("read migration ledger"),
                source => ProvisionError::Ledger {
                    operation: "read",
                    source,
                },
            })
    }

    async fn apply_one(
        &self,
        conn: &mut PooledClient,
        migration: &Migration,
    ) -> ProvisionResult<ApplyOutcome> {
        tracing::debug!("Applying migration {}:\n{}", migration.version, migration.body);

        let owned = migration.clone();
        let result = conn
            .transaction_scope(&self.cancel, move |tx| {
                Box::pin(async move {
                    // Ledger row first: losing the insert race means the body must not run
                    let inserted = ledger::record(tx, &owned).await.map_err(|source| StepError {
                        stage: MigrationStage::Record,
                        source,
                    })?;
                    if !inserted {
                        return Ok::<_, StepError>(ApplyOutcome::AlreadyApplied);
                    }
                    tx.batch_execute(&owned.body)
                        .await
                        .map_err(StepError::at(MigrationStage::Execute))?;
                    Ok::<_, StepError>(ApplyOutcome::Applied)
                })
            })
            .await;

        let version = migration.version.clone();
        result.map_err(|e| match e {
            TxError::Begin(source) => ProvisionError::Migration {
                version,
                stage: MigrationStage::Begin,
                source,
            },
            TxError::Aborted(step) => ProvisionError::Migration {
                version,
                stage: step.stage,
                source: step.source,
            },
            TxError::RollbackFailed { cause, rollback } => ProvisionError::MigrationRollback {
                version,
                cause: cause.source,
                rollback,
            },
            TxError::Commit(source) => ProvisionError::Migration {
                version,
                stage: MigrationStage::Commit,
                source,
            },
            TxError::Cancelled => ProvisionError::Cancelled {
                operation: format!("migration {}", version),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(version: &str) -> Migration {
        Migration::new(version, format!("migration {}", version), "SELECT 1")
    }

    fn versions(pending: &[&Migration]) -> Vec<String> {
        pending.iter().map(|m| m.version.clone()).collect()
    }

    #[test]
    fn test_plan_orders_by_version_regardless_of_declaration_order() {
        let declared = vec![m("001"), m("003"), m("002")];
        let pending = plan(&declared, &HashSet::new());
        assert_eq!(versions(&pending), vec!["001", "002", "003"]);
    }

    #[test]
    fn test_plan_skips_applied_versions() {
        let declared = vec![m("001"), m("002"), m("003")];
        let applied: HashSet<String> = ["001".to_string()].into_iter().collect();
        let pending = plan(&declared, &applied);
        assert_eq!(versions(&pending), vec!["002", "003"]);
    }

    #[test]
    fn test_plan_is_empty_when_everything_applied() {
        let declared = vec![m("001"), m("002")];
        let applied: HashSet<String> = ["001", "002"].iter().map(|s| s.to_string()).collect();
        assert!(plan(&declared, &applied).is_empty());
    }

    #[test]
    fn test_plan_uses_lexicographic_comparison() {
        // Unpadded numbers sort as strings; picking a sortable scheme is the caller's job
        let declared = vec![m("10"), m("9"), m("100")];
        let pending = plan(&declared, &HashSet::new());
        assert_eq!(versions(&pending), vec!["10", "100", "9"]);
    }

    #[test]
    fn test_plan_applies_gap_filling_versions() {
        // A late-declared lower version is still applied, before higher pending ones
        let declared = vec![m("001"), m("002"), m("003"), m("004")];
        let applied: HashSet<String> = ["001", "003"].iter().map(|s| s.to_string()).collect();
        assert_eq!(versions(&plan(&declared, &applied)), vec!["002", "004"]);
    }

    #[test]
    fn test_validate_declared_rejects_duplicates() {
        let err = validate_declared(&[m("001"), m("002"), m("001")]).unwrap_err();
        assert!(err.to_string().contains("001"));
    }

    #[test]
    fn test_validate_declared_rejects_empty_version() {
        assert!(validate_declared(&[m(" ")]).is_err());
        assert!(validate_declared(&[m("001"), m("002")]).is_ok());
    }

    #[test]
    fn test_report_noop() {
        let mut report = MigrationReport::default();
        assert!(report.is_noop());
        report.applied.push(AppliedMigration {
            version: "001".to_string(),
            description: "init".to_string(),
        });
        assert!(!report.is_noop());
    }
}
