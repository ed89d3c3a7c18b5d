// ABOUTME: Reset command implementation - drop every managed table
// ABOUTME: Destructive and human-confirmed; tables go in reverse dependency order

use super::Outcome;
use crate::config::ProvisionConfig;
use crate::error::{DbError, ProvisionError};
use crate::migration::{ledger, schema, LEDGER_TABLE};
use crate::postgres::{Database, PooledClient};
use crate::utils::{self, quote_qualified};
use anyhow::{bail, Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};
use tokio_util::sync::CancellationToken;

/// Tables in the order they must be dropped: reverse of `managed_tables`, ledger last
pub fn drop_order(config: &ProvisionConfig, include_ledger: bool) -> Vec<String> {
    let mut tables: Vec<String> = config.managed_tables.iter().rev().cloned().collect();
    if include_ledger {
        tables.push(LEDGER_TABLE.to_string());
    }
    tables
}

pub fn drop_table_sql(table: &str) -> String {
    // No CASCADE: an unmanaged dependant must surface as an error
    format!("DROP TABLE IF EXISTS {}", quote_qualified(table))
}

fn confirm_reset(tables: &[String], kept_versions: &[String]) -> Result<bool> {
    println!();
    println!("The following tables and ALL of their data will be dropped:");
    for table in tables {
        println!("  - {}", table);
    }
    if !kept_versions.is_empty() {
        println!();
        println!(
            "{} stays, so 'migrate' will NOT re-apply: {}",
            LEDGER_TABLE,
            kept_versions.join(", ")
        );
    }
    println!();

    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Drop these tables?")
        .default(false)
        .interact()
        .context("Failed to get confirmation")
}

/// Versions recorded in the ledger, or none when there is no ledger yet
async fn ledger_versions(client: &PooledClient, cancel: &CancellationToken) -> Result<Vec<String>> {
    let versions = utils::cancellable(cancel, async {
        if !schema::table_exists(&**client, LEDGER_TABLE).await? {
            return Ok(Vec::new());
        }
        ledger::list_applied(&**client).await
    })
    .await
    .context("Failed to read the migration ledger")?;
    Ok(versions.into_iter().map(|entry| entry.version).collect())
}

/// Drop every managed table in reverse dependency order
///
/// Without `skip_confirmation` the user is asked first. With `include_ledger` the
/// migration ledger is dropped too, so a later `migrate` rebuilds everything. The first
/// failing drop aborts; tables dropped before it stay dropped.
pub async fn reset(
    db: &Database,
    config: &ProvisionConfig,
    skip_confirmation: bool,
    include_ledger: bool,
    cancel: &CancellationToken,
) -> Result<Outcome> {
    config.validate()?;
    let tables = drop_order(config, include_ledger);
    if tables.is_empty() {
        tracing::info!("✓ No managed tables configured, nothing to drop");
        return Ok(Outcome::NothingToDo);
    }

    let client = db.acquire().await.map_err(ProvisionError::Connection)?;
    let kept_versions = if include_ledger {
        Vec::new()
    } else {
        ledger_versions(&client, cancel).await?
    };

    tracing::warn!("⚠ WARNING: This will drop {} table(s) on {}", tables.len(), db.config().display_target());
    if !kept_versions.is_empty() {
        tracing::warn!(
            "⚠ The migration ledger is kept: {} applied version(s) will not be re-applied by 'migrate'. \
             Use --include-ledger to rebuild the schema from scratch.",
            kept_versions.len()
        );
    }
    if !skip_confirmation && !confirm_reset(&tables, &kept_versions)? {
        tracing::warn!("⚠ User cancelled operation");
        bail!("Reset cancelled by user");
    }
    let mut dropped = 0;

    for table in &tables {
        let destructive = |source: DbError| match source {
            DbError::Cancelled => ProvisionError::Cancelled {
                operation: format!("drop table {}", table),
            },
            source => ProvisionError::DestructiveAction {
                table: table.clone(),
                source,
            },
        };

        let exists = utils::cancellable(cancel, schema::table_exists(&*client, table))
            .await
            .map_err(destructive)?;
        if !exists {
            tracing::info!("Table {} does not exist, skipping", table);
            continue;
        }

        let sql = drop_table_sql(table);
        tracing::debug!("{}", sql);
        utils::cancellable(cancel, async {
            client.batch_execute(&sql).await.map_err(DbError::from)
        })
        .await
        .map_err(destructive)?;

        tracing::info!("✓ Dropped table {}", table);
        dropped += 1;
    }

    let outcome = Outcome::from_count(dropped);
    match outcome {
        Outcome::NothingToDo => tracing::info!("✓ No managed tables were present"),
        Outcome::Applied(n) => tracing::info!("✓ {} table(s) dropped", n),
    }
    Ok(outcome)
}
