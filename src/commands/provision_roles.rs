// ABOUTME: Provision-roles command implementation - per-service least-privilege topology
// ABOUTME: Creates roles idempotently, grants table privileges, optionally installs RLS policies

use super::Outcome;
use crate::access::{service_policy, AccessControlManager, Privilege, RoleOutcome};
use crate::config::{Password, ProvisionConfig, RoleSpec};
use crate::error::{ProvisionError, TxError};
use crate::postgres::{check_current_privileges, Database};
use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

fn tx_failure(role: &str, error: TxError<ProvisionError>) -> anyhow::Error {
    match error {
        TxError::Aborted(e) => anyhow::Error::new(e)
            .context(format!("Row level security setup for role '{}' rolled back", role)),
        TxError::Cancelled => anyhow::Error::new(ProvisionError::Cancelled {
            operation: format!("row level security setup for role '{}'", role),
        }),
        other => anyhow::Error::new(other)
            .context(format!("Row level security transaction for role '{}' failed", role)),
    }
}

/// Create every declared service role and grant it exactly the declared access
///
/// This command:
/// 1. Checks that the connected user may create roles (CREATEROLE or superuser)
/// 2. Resolves all role passwords before changing anything
/// 3. Per role: creates it if missing, grants the privileges it lacks, grants sequence
///    usage to writers
/// 4. With `enable_rls`, enables row level security and replaces one policy per
///    role/table pair, in one transaction per role
///
/// Grants already held are skipped, so a second run reports `NothingToDo`. Failures stop
/// the pass; roles and grants applied before the failure stay in place.
pub async fn provision_roles(
    db: &Database,
    config: &ProvisionConfig,
    cancel: &CancellationToken,
) -> Result<Outcome> {
    config.validate()?;

    if config.roles.is_empty() {
        tracing::warn!("⚠ No roles declared, nothing to provision");
        return Ok(Outcome::NothingToDo);
    }

    let client = db.acquire().await.map_err(ProvisionError::Connection)?;

    tracing::info!("Step 1/3: Checking provisioning privileges...");
    let privileges = check_current_privileges(&*client)
        .await
        .context("Failed to check privileges of the connected user")?;
    if !privileges.can_provision_roles() {
        bail!(
            "User {} lacks CREATEROLE privilege.\n\
             Grant it with: ALTER USER {} CREATEROLE;",
            db.config().user,
            db.config().user
        );
    }
    if config.enable_rls && privileges.bypasses_rls {
        tracing::warn!("⚠ Connected user bypasses row level security; policies will not apply to it");
    }
    tracing::info!("✓ Privileges verified");

    tracing::info!("Step 2/3: Resolving role credentials...");
    let passwords: Vec<(&RoleSpec, Password)> = config
        .roles
        .iter()
        .map(|role| role.resolve_password().map(|password| (role, password)))
        .collect::<Result<_, _>>()?;
    tracing::info!("✓ {} credential(s) resolved", passwords.len());

    tracing::info!("Step 3/3: Provisioning {} role(s)...", passwords.len());
    let mgr = AccessControlManager::new(&*client).with_cancellation(cancel.clone());
    let mut changes = 0;

    for (role, password) in &passwords {
        if mgr.create_role(&role.name, password).await? == RoleOutcome::Created {
            changes += 1;
        }

        for access in &role.tables {
            let mut missing: Vec<Privilege> = Vec::new();
            for privilege in access.access.privileges() {
                if !mgr
                    .has_table_privilege(&role.name, &access.table, *privilege)
                    .await?
                {
                    missing.push(*privilege);
                }
            }
            if missing.is_empty() {
                tracing::debug!("{} already has {} access to {}", role.name, access.access, access.table);
                continue;
            }
            changes += mgr
                .grant_table_permissions(&access.table, &role.name, &missing)
                .await?;
        }

        if role.writes_anything() {
            mgr.grant_sequence_usage(&role.name, &config.sequence_schema)
                .await?;
        }
    }

    if config.enable_rls {
        // Policy transactions check out their own connections
        drop(mgr);
        drop(client);
        for role in &config.roles {
            changes += install_policies(db, role, cancel).await?;
        }
    }

    let outcome = Outcome::from_count(changes);
    match outcome {
        Outcome::NothingToDo => tracing::info!("✓ All service roles already provisioned"),
        Outcome::Applied(n) => tracing::info!("✓ Service roles provisioned ({} change(s))", n),
    }
    Ok(outcome)
}

/// Enable RLS and replace the role's policies in one transaction; returns new policies
async fn install_policies(
    db: &Database,
    role: &RoleSpec,
    cancel: &CancellationToken,
) -> Result<usize> {
    let name = role.name.clone();
    let tables = role.tables.clone();
    let token = cancel.clone();

    db.with_transaction(cancel, move |tx| {
        Box::pin(async move {
            let mgr = AccessControlManager::new(tx).with_cancellation(token);
            let mut created = 0;
            for access in &tables {
                let policy = service_policy(&name, &access.table, access.access);
                let existed = mgr.policy_exists(&policy.name, &policy.table).await?;
                mgr.ensure_service_rls(&name, &access.table, access.access)
                    .await?;
                if !existed {
                    created += 1;
                }
            }
            Ok::<_, ProvisionError>(created)
        })
    })
    .await
    .map_err(|e| tx_failure(&role.name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;

    #[test]
    fn test_tx_failure_keeps_provision_error() {
        let err = tx_failure(
            "file_service",
            TxError::Aborted(ProvisionError::Config("bad".to_string())),
        );
        assert!(err.to_string().contains("file_service"));
        assert!(err.downcast_ref::<ProvisionError>().is_some());

        let err = tx_failure("file_service", TxError::Cancelled);
        assert!(err.to_string().starts_with("[P013]"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_provision_roles_is_idempotent() {
        let url = std::env::var("TEST_DATABASE_URL").unwrap();
        let db = Database::open(DbConfig::from_url(&url).unwrap()).await.unwrap();
        let cancel = CancellationToken::new();

        let config = crate::config::parse(
            r#"
            managed_tables = []

            [[roles]]
            name = "provision_cmd_role"
            password = "provision-secret"
            "#,
        )
        .unwrap();

        let client = db.acquire().await.unwrap();
        let mgr = AccessControlManager::new(&*client);
        mgr.drop_role("provision_cmd_role").await.unwrap();

        let first = provision_roles(&db, &config, &cancel).await.unwrap();
        let second = provision_roles(&db, &config, &cancel).await.unwrap();
        mgr.drop_role("provision_cmd_role").await.unwrap();

        assert_eq!(first, Outcome::Applied(1));
        assert_eq!(second, Outcome::NothingToDo);
    }
}
