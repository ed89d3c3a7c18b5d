// ABOUTME: Fresh command implementation - reset, migrate, and provision roles in one go
// ABOUTME: Rebuilds a development database from scratch

use super::{migrate, provision_roles, reset, Outcome};
use crate::config::ProvisionConfig;
use crate::postgres::Database;
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

/// Drop the managed tables and the ledger, then migrate and provision roles
pub async fn fresh(
    db: &Database,
    config: &ProvisionConfig,
    skip_confirmation: bool,
    cancel: &CancellationToken,
) -> Result<Outcome> {
    tracing::info!("Phase 1/3: Resetting schema...");
    let dropped = reset(db, config, skip_confirmation, true, cancel)
        .await
        .context("Reset phase failed")?;

    tracing::info!("Phase 2/3: Migrating...");
    let migrated = migrate(db, config, cancel)
        .await
        .context("Migrate phase failed")?;

    tracing::info!("Phase 3/3: Provisioning roles...");
    let provisioned = provision_roles(db, config, cancel)
        .await
        .context("Provision-roles phase failed")?;

    tracing::info!("✓ Fresh migration completed successfully");
    Ok(dropped.merge(migrated).merge(provisioned))
}
