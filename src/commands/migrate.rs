// ABOUTME: Migrate command implementation - bring the shared schema up to date
// ABOUTME: Extensions, then pending versioned migrations, then idempotent fixtures

use super::Outcome;
use crate::config::ProvisionConfig;
use crate::error::{DbError, ProvisionError};
use crate::migration::{catalog, schema, source, Migration, Migrator, SchemaFixture, LEDGER_TABLE};
use crate::postgres::{ensure_extensions, Database};
use crate::utils;
use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

/// Declared migrations and fixtures: the configured directory, or the built-in catalog
pub fn declared_schema(config: &ProvisionConfig) -> Result<(Vec<Migration>, Vec<SchemaFixture>)> {
    match &config.migrations_dir {
        Some(dir) => {
            let migrations = source::load_dir(dir)
                .with_context(|| format!("Failed to load migrations from {}", dir.display()))?;
            let fixtures = source::load_fixtures(dir)
                .with_context(|| format!("Failed to load fixtures from {}", dir.display()))?;
            Ok((migrations, fixtures))
        }
        None => Ok((catalog::migrations(), catalog::fixtures())),
    }
}

/// Re-apply every fixture; each one guards itself with existence checks
pub async fn apply_fixtures(
    db: &Database,
    fixtures: &[SchemaFixture],
    cancel: &CancellationToken,
) -> Result<(), ProvisionError> {
    let client = db.acquire().await.map_err(ProvisionError::Connection)?;

    for fixture in fixtures {
        tracing::debug!("Applying fixture {}:\n{}", fixture.name, fixture.sql);
        utils::cancellable(cancel, async {
            client.batch_execute(&fixture.sql).await.map_err(DbError::from)
        })
        .await
        .map_err(|e| match e {
            DbError::Cancelled => ProvisionError::Cancelled {
                operation: format!("fixture {}", fixture.name),
            },
            source => ProvisionError::Schema {
                name: fixture.name.clone(),
                source,
            },
        })?;
    }

    Ok(())
}

/// Bring the database schema up to date
///
/// This command:
/// 1. Creates the configured extensions that are missing
/// 2. Applies pending migrations in version order, one transaction each
/// 3. Re-applies the declarative fixtures (constraints, trigger functions, triggers)
///
/// Returns `Outcome::Applied(n)` where `n` counts created extensions and newly applied
/// migrations. Fixtures are idempotent and do not count as changes.
pub async fn migrate(
    db: &Database,
    config: &ProvisionConfig,
    cancel: &CancellationToken,
) -> Result<Outcome> {
    let (migrations, fixtures) = declared_schema(config)?;

    tracing::info!("Step 1/3: Ensuring extensions...");
    let created = {
        let client = db.acquire().await.map_err(ProvisionError::Connection)?;
        ensure_extensions(&*client, &config.extensions, cancel).await?
    };
    if created == 0 {
        tracing::info!("✓ All {} extension(s) already installed", config.extensions.len());
    }

    tracing::info!("Step 2/3: Applying migrations ({} declared)...", migrations.len());
    let report = Migrator::new(db)
        .with_cancellation(cancel.clone())
        .run(&migrations)
        .await?;
    if !report.raced.is_empty() {
        tracing::warn!(
            "⚠ {} migration(s) were applied by a concurrent migrator: {}",
            report.raced.len(),
            report.raced.join(", ")
        );
    }

    let missing = {
        let client = db.acquire().await.map_err(ProvisionError::Connection)?;
        utils::cancellable(cancel, schema::missing_tables(&*client, &config.managed_tables))
            .await
            .context("Failed to check managed tables")?
    };
    if !missing.is_empty() {
        bail!(
            "Managed table(s) {} do not exist, but every declared migration is recorded in {}.\n\
             The tables were dropped without clearing the ledger; run \
             'pg-provisioner reset --include-ledger' (or 'fresh') and migrate again.",
            missing.join(", "),
            LEDGER_TABLE
        );
    }

    tracing::info!("Step 3/3: Applying {} schema fixture(s)...", fixtures.len());
    apply_fixtures(db, &fixtures, cancel).await?;
    tracing::info!("✓ Schema fixtures applied");

    let outcome = Outcome::from_count(created + report.applied.len());
    match outcome {
        Outcome::NothingToDo => tracing::info!("✓ Nothing to migrate"),
        Outcome::Applied(_) => tracing::info!(
            "✓ Migration completed: {} migration(s) applied, {} already present",
            report.applied.len(),
            report.skipped
        ),
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_schema_defaults_to_catalog() {
        let (migrations, fixtures) = declared_schema(&ProvisionConfig::default()).unwrap();
        assert_eq!(migrations, catalog::migrations());
        assert_eq!(fixtures.len(), catalog::fixtures().len());
    }

    #[test]
    fn test_declared_schema_reads_configured_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("001_create_widgets.sql"),
            "CREATE TABLE widgets (id serial PRIMARY KEY);",
        )
        .unwrap();

        let config = ProvisionConfig {
            migrations_dir: Some(dir.path().to_path_buf()),
            ..ProvisionConfig::default()
        };
        let (migrations, fixtures) = declared_schema(&config).unwrap();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].description, "create widgets");
        assert!(fixtures.is_empty());
    }

    #[test]
    fn test_declared_schema_reports_missing_directory() {
        let config = ProvisionConfig {
            migrations_dir: Some("/no/such/migrations".into()),
            ..ProvisionConfig::default()
        };
        let err = declared_schema(&config).unwrap_err();
        assert!(err.to_string().contains("/no/such/migrations"));
    }
}
