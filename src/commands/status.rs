// ABOUTME: Status command implementation - report schema and pool health
// ABOUTME: Lists applied ledger versions, pending migrations, and managed table state

use super::migrate::declared_schema;
use crate::config::ProvisionConfig;
use crate::error::ProvisionError;
use crate::migration::{plan, schema, LedgerEntry, Migrator};
use crate::postgres::Database;
use anyhow::{Context, Result};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

/// Snapshot of what `migrate` would do and what is already in place
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub applied: Vec<LedgerEntry>,
    pub pending: Vec<String>,
    /// Ledger versions with no declared migration (applied by a newer release)
    pub unknown: Vec<String>,
    pub missing_tables: Vec<String>,
}

impl StatusReport {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty() && self.missing_tables.is_empty()
    }
}

/// Check schema status and display it
///
/// This command:
/// 1. Runs a health check against the pool
/// 2. Reads the migration ledger (creating it if needed)
/// 3. Compares it with the declared migrations and lists managed tables that are missing
pub async fn status(
    db: &Database,
    config: &ProvisionConfig,
    cancel: &CancellationToken,
) -> Result<StatusReport> {
    tracing::info!("Checking database health...");
    db.health_check(None)
        .await
        .map_err(ProvisionError::Connection)
        .context("Health check failed")?;
    tracing::info!("✓ Database is healthy");

    let (migrations, _) = declared_schema(config)?;
    let applied = Migrator::new(db)
        .with_cancellation(cancel.clone())
        .applied()
        .await?;

    let applied_versions: HashSet<String> = applied.iter().map(|e| e.version.clone()).collect();
    let declared_versions: HashSet<&str> = migrations.iter().map(|m| m.version.as_str()).collect();
    let pending = plan(&migrations, &applied_versions)
        .into_iter()
        .map(|m| m.version.clone())
        .collect();
    let unknown = applied
        .iter()
        .filter(|e| !declared_versions.contains(e.version.as_str()))
        .map(|e| e.version.clone())
        .collect();

    let client = db.acquire().await.map_err(ProvisionError::Connection)?;
    let missing_tables = schema::missing_tables(&*client, &config.managed_tables)
        .await
        .context("Failed to check managed tables")?;

    let report = StatusReport {
        applied,
        pending,
        unknown,
        missing_tables,
    };
    print_report(db, &report);
    Ok(report)
}

fn print_report(db: &Database, report: &StatusReport) {
    tracing::info!("");
    tracing::info!("========================================");
    tracing::info!("Schema Status Report");
    tracing::info!("========================================");
    tracing::info!("");

    if report.applied.is_empty() {
        tracing::info!("No migrations applied yet");
    } else {
        tracing::info!("Applied migrations:");
        for entry in &report.applied {
            tracing::info!(
                "  {}  {}  {}",
                entry.version,
                entry.applied_at.format("%Y-%m-%d %H:%M:%S UTC"),
                entry.description
            );
        }
    }
    tracing::info!("");

    if report.pending.is_empty() {
        tracing::info!("✓ No pending migrations");
    } else {
        tracing::warn!("⚠ Pending migrations: {}", report.pending.join(", "));
    }
    if !report.unknown.is_empty() {
        tracing::warn!(
            "⚠ Ledger has versions not declared here: {}",
            report.unknown.join(", ")
        );
    }
    if !report.missing_tables.is_empty() {
        tracing::warn!("⚠ Missing managed tables: {}", report.missing_tables.join(", "));
    }

    let stats = db.stats();
    tracing::info!("");
    tracing::info!(
        "Pool: {} open, {} idle, {} in use (max {})",
        stats.open,
        stats.idle,
        stats.in_use,
        stats.max_open
    );
    tracing::info!("");

    if report.is_up_to_date() {
        tracing::info!("✓ Schema is up to date");
    } else {
        tracing::info!("Run 'pg-provisioner migrate' to apply pending changes");
    }
}
