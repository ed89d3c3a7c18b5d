// ABOUTME: Creates service roles, grants table privileges, and manages row level security
// ABOUTME: Works on any client or open transaction; every statement observes cancellation

use super::policy::{drop_policy_sql, PolicyConfig};
use super::{AccessLevel, Privilege};
use crate::config::Password;
use crate::error::{DbError, GrantAction, ProvisionError, ProvisionResult};
use crate::utils::{self, quote_ident, quote_literal, quote_qualified};
use tokio_postgres::GenericClient;
use tokio_util::sync::CancellationToken;

/// Result of an idempotent role creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOutcome {
    Created,
    AlreadyExists,
}

fn or_cancelled(
    error: DbError,
    operation: impl FnOnce() -> String,
    wrap: impl FnOnce(DbError) -> ProvisionError,
) -> ProvisionError {
    match error {
        DbError::Cancelled => ProvisionError::Cancelled {
            operation: operation(),
        },
        other => wrap(other),
    }
}

/// The policy `setup_service_rls` installs: `{service}_all_{table}` or `{service}_select_{table}`
pub fn service_policy(service: &str, table: &str, access: AccessLevel) -> PolicyConfig {
    let bare_table = table.rsplit('.').next().unwrap_or(table);
    PolicyConfig::new(
        format!("{}_{}_{}", service, access.policy_suffix(), bare_table),
        table,
        access.policy_command(),
        service,
        "true",
    )
}

pub struct AccessControlManager<'a, C> {
    client: &'a C,
    cancel: CancellationToken,
}

impl<'a, C: GenericClient> AccessControlManager<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self {
            client,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn execute(&self, sql: &str) -> Result<(), DbError> {
        utils::cancellable(&self.cancel, async {
            self.client.batch_execute(sql).await.map_err(DbError::from)
        })
        .await
    }

    async fn set_rls(&self, table: &str, action: &'static str) -> ProvisionResult<()> {
        let sql = format!(
            "ALTER TABLE {} {} ROW LEVEL SECURITY",
            quote_qualified(table),
            action.to_ascii_uppercase()
        );
        tracing::debug!("{}", sql);
        self.execute(&sql).await.map_err(|e| {
            or_cancelled(
                e,
                || format!("{} row level security on {}", action, table),
                |source| ProvisionError::Rls {
                    action,
                    table: table.to_string(),
                    source,
                },
            )
        })
    }

    /// Turn on row level security; enabling an already-enabled table is a no-op
    pub async fn enable_rls(&self, table: &str) -> ProvisionResult<()> {
        self.set_rls(table, "enable").await?;
        tracing::info!("✓ Row level security enabled on {}", table);
        Ok(())
    }

    pub async fn disable_rls(&self, table: &str) -> ProvisionResult<()> {
        self.set_rls(table, "disable").await?;
        tracing::info!("✓ Row level security disabled on {}", table);
        Ok(())
    }

    pub async fn role_exists(&self, name: &str) -> ProvisionResult<bool> {
        let query = async {
            let row = self
                .client
                .query_one(
                    "SELECT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = $1)",
                    &[&name],
                )
                .await?;
            Ok::<bool, DbError>(row.get(0))
        };

        utils::cancellable(&self.cancel, query).await.map_err(|e| {
            or_cancelled(
                e,
                || format!("check role {}", name),
                |source| ProvisionError::Role {
                    role: name.to_string(),
                    source,
                },
            )
        })
    }

    /// Create a login role unless one with this name already exists
    ///
    /// An existing role is left untouched, including its password.
    pub async fn create_role(&self, name: &str, password: &Password) -> ProvisionResult<RoleOutcome> {
        if self.role_exists(name).await? {
            tracing::info!("Role '{}' already exists, leaving it unchanged", name);
            return Ok(RoleOutcome::AlreadyExists);
        }

        // Never logged: the statement carries the credential
        let sql = format!(
            "CREATE ROLE {} WITH LOGIN PASSWORD {}",
            quote_ident(name),
            quote_literal(password.expose())
        );

        match self.execute(&sql).await {
            Ok(()) => {
                tracing::info!("✓ Role '{}' created", name);
                Ok(RoleOutcome::Created)
            }
            // Lost a race against a concurrent creator between the check and the create
            Err(e) if e.is_duplicate_object() => {
                tracing::info!("Role '{}' was created concurrently, leaving it unchanged", name);
                Ok(RoleOutcome::AlreadyExists)
            }
            Err(e) => Err(or_cancelled(
                e,
                || format!("create role {}", name),
                |source| ProvisionError::Role {
                    role: name.to_string(),
                    source,
                },
            )),
        }
    }

    /// Drop a role if it exists; it must no longer own objects or hold privileges
    pub async fn drop_role(&self, name: &str) -> ProvisionResult<()> {
        let sql = format!("DROP ROLE IF EXISTS {}", quote_ident(name));
        tracing::debug!("{}", sql);
        self.execute(&sql).await.map_err(|e| {
            or_cancelled(
                e,
                || format!("drop role {}", name),
                |source| ProvisionError::Role {
                    role: name.to_string(),
                    source,
                },
            )
        })?;
        tracing::info!("✓ Role '{}' dropped", name);
        Ok(())
    }

    async fn apply_privileges(
        &self,
        action: GrantAction,
        table: &str,
        role: &str,
        privileges: &[Privilege],
    ) -> ProvisionResult<usize> {
        let mut applied = 0;
        for privilege in privileges {
            let sql = match action {
                GrantAction::Grant => format!(
                    "GRANT {} ON {} TO {}",
                    privilege,
                    quote_qualified(table),
                    quote_ident(role)
                ),
                GrantAction::Revoke => format!(
                    "REVOKE {} ON {} FROM {}",
                    privilege,
                    quote_qualified(table),
                    quote_ident(role)
                ),
            };
            tracing::debug!("{}", sql);

            self.execute(&sql).await.map_err(|e| {
                or_cancelled(
                    e,
                    || format!("{} {} on {} for {}", action, privilege, table, role),
                    |source| ProvisionError::Grant {
                        action,
                        privilege: privilege.to_string(),
                        table: table.to_string(),
                        role: role.to_string(),
                        applied,
                        source,
                    },
                )
            })?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Grant each privilege as its own statement
    ///
    /// Stops at the first failure. Grants issued before it stay in effect and the
    /// error reports how many there were.
    pub async fn grant_table_permissions(
        &self,
        table: &str,
        role: &str,
        privileges: &[Privilege],
    ) -> ProvisionResult<usize> {
        let applied = self
            .apply_privileges(GrantAction::Grant, table, role, privileges)
            .await?;
        tracing::info!("✓ Granted {} privilege(s) on {} to {}", applied, table, role);
        Ok(applied)
    }

    pub async fn revoke_table_permissions(
        &self,
        table: &str,
        role: &str,
        privileges: &[Privilege],
    ) -> ProvisionResult<usize> {
        let applied = self
            .apply_privileges(GrantAction::Revoke, table, role, privileges)
            .await?;
        tracing::info!("✓ Revoked {} privilege(s) on {} from {}", applied, table, role);
        Ok(applied)
    }

    /// Whether `role` already holds `privilege` on `table`
    ///
    /// `ALL` is never reported as held, so granting it is always attempted.
    pub async fn has_table_privilege(
        &self,
        role: &str,
        table: &str,
        privilege: Privilege,
    ) -> ProvisionResult<bool> {
        if privilege == Privilege::All {
            return Ok(false);
        }
        let qualified = quote_qualified(table);
        let query = async {
            let row = self
                .client
                .query_one(
                    "SELECT has_table_privilege($1, $2, $3)",
                    &[&role, &qualified, &privilege.as_sql()],
                )
                .await?;
            Ok::<bool, DbError>(row.get(0))
        };

        utils::cancellable(&self.cancel, query).await.map_err(|e| {
            or_cancelled(
                e,
                || format!("check {} on {} for {}", privilege, table, role),
                |source| ProvisionError::Grant {
                    action: GrantAction::Grant,
                    privilege: privilege.to_string(),
                    table: table.to_string(),
                    role: role.to_string(),
                    applied: 0,
                    source,
                },
            )
        })
    }

    /// USAGE and SELECT on every sequence in `schema`, for roles that insert into serial columns
    pub async fn grant_sequence_usage(&self, role: &str, schema: &str) -> ProvisionResult<()> {
        let sql = format!(
            "GRANT USAGE, SELECT ON ALL SEQUENCES IN SCHEMA {} TO {}",
            quote_ident(schema),
            quote_ident(role)
        );
        tracing::debug!("{}", sql);
        self.execute(&sql).await.map_err(|e| {
            or_cancelled(
                e,
                || format!("grant sequence usage to {}", role),
                |source| ProvisionError::Grant {
                    action: GrantAction::Grant,
                    privilege: "USAGE, SELECT".to_string(),
                    table: format!("all sequences in schema {}", schema),
                    role: role.to_string(),
                    applied: 0,
                    source,
                },
            )
        })?;
        tracing::info!("✓ Granted sequence usage in schema {} to {}", schema, role);
        Ok(())
    }

    pub async fn policy_exists(&self, name: &str, table: &str) -> ProvisionResult<bool> {
        let (schema, bare_table) = table.split_once('.').unwrap_or(("public", table));
        let query = async {
            let row = self
                .client
                .query_one(
                    "SELECT EXISTS (
                        SELECT 1 FROM pg_policies
                        WHERE policyname = $1 AND schemaname = $2 AND tablename = $3
                     )",
                    &[&name, &schema, &bare_table],
                )
                .await?;
            Ok::<bool, DbError>(row.get(0))
        };

        utils::cancellable(&self.cancel, query).await.map_err(|e| {
            or_cancelled(
                e,
                || format!("check policy {}", name),
                |source| ProvisionError::Policy {
                    policy: name.to_string(),
                    table: table.to_string(),
                    source,
                },
            )
        })
    }

    /// Create a policy; fails if one with the same name already exists on the table
    pub async fn create_policy(&self, policy: &PolicyConfig) -> ProvisionResult<()> {
        policy.validate()?;
        let sql = policy.create_sql();
        tracing::debug!("{}", sql);
        self.execute(&sql).await.map_err(|e| {
            or_cancelled(
                e,
                || format!("create policy {}", policy.name),
                |source| ProvisionError::Policy {
                    policy: policy.name.clone(),
                    table: policy.table.clone(),
                    source,
                },
            )
        })?;
        tracing::info!(
            "✓ Policy '{}' created on {} ({} for {})",
            policy.name,
            policy.table,
            policy.command,
            policy.role
        );
        Ok(())
    }

    /// Drop a policy; a missing policy is not an error
    pub async fn drop_policy(&self, name: &str, table: &str) -> ProvisionResult<()> {
        let sql = drop_policy_sql(name, table);
        tracing::debug!("{}", sql);
        self.execute(&sql).await.map_err(|e| {
            or_cancelled(
                e,
                || format!("drop policy {}", name),
                |source| ProvisionError::Policy {
                    policy: name.to_string(),
                    table: table.to_string(),
                    source,
                },
            )
        })
    }

    /// Drop-if-exists then create, so the stored predicates match `policy`
    ///
    /// Run it inside a transaction to avoid a window with no policy in place.
    pub async fn replace_policy(&self, policy: &PolicyConfig) -> ProvisionResult<()> {
        policy.validate()?;
        self.drop_policy(&policy.name, &policy.table).await?;
        self.create_policy(policy).await
    }

    /// Enable row level security on `table` and create the service's single policy
    ///
    /// `FullAccess` gives an `ALL` policy, `ReadOnly` a `SELECT` policy, both with an
    /// always-true predicate. Fails if the policy already exists.
    pub async fn setup_service_rls(
        &self,
        service: &str,
        table: &str,
        access: AccessLevel,
    ) -> ProvisionResult<PolicyConfig> {
        self.enable_rls(table).await?;
        let policy = service_policy(service, table, access);
        self.create_policy(&policy).await?;
        Ok(policy)
    }

    /// Like [`setup_service_rls`](Self::setup_service_rls) but safe to re-run
    pub async fn ensure_service_rls(
        &self,
        service: &str,
        table: &str,
        access: AccessLevel,
    ) -> ProvisionResult<PolicyConfig> {
        self.enable_rls(table).await?;
        let policy = service_policy(service, table, access);
        self.replace_policy(&policy).await?;
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::PolicyCommand;

    #[test]
    fn test_service_policy_full_access() {
        let policy = service_policy("user_service", "users", AccessLevel::FullAccess);
        assert_eq!(policy.name, "user_service_all_users");
        assert_eq!(policy.command, PolicyCommand::All);
        assert_eq!(policy.role, "user_service");
        assert_eq!(policy.using, "true");
        assert_eq!(policy.with_check, None);
    }

    #[test]
    fn test_service_policy_read_only() {
        let policy = service_policy("analytics_reader", "public.files", AccessLevel::ReadOnly);
        assert_eq!(policy.name, "analytics_reader_select_files");
        assert_eq!(policy.table, "public.files");
        assert_eq!(policy.command, PolicyCommand::Select);
        policy.validate().unwrap();
    }

    #[test]
    fn test_or_cancelled() {
        let err = or_cancelled(DbError::Cancelled, || "grant".to_string(), |_| unreachable!());
        assert!(matches!(err, ProvisionError::Cancelled { .. }));

        let err = or_cancelled(
            DbError::Other("boom".to_string()),
            || unreachable!(),
            |source| ProvisionError::Role {
                role: "r".to_string(),
                source,
            },
        );
        assert!(err.to_string().starts_with("[P005]"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_cancelled_manager_fails_before_touching_database() {
        // A pre-cancelled token wins the race, so the client is never polled
        use crate::config::DbConfig;
        use crate::postgres::Database;

        let url = std::env::var("TEST_DATABASE_URL").unwrap();
        let db = Database::open(DbConfig::from_url(&url).unwrap()).await.unwrap();
        let client = db.acquire().await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mgr = AccessControlManager::new(&*client).with_cancellation(cancel);
        let err = mgr.role_exists("postgres").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Cancelled { .. }));
        drop(client);
        db.close();
    }
}
