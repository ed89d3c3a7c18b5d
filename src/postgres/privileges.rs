// ABOUTME: Privilege checking for the provisioning user
// ABOUTME: Confirms the connected role may create roles and change table security

use crate::error::DbError;
use tokio_postgres::GenericClient;

/// Role attributes of the currently connected PostgreSQL user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegeCheck {
    /// User has CREATEROLE (needed to create service roles)
    pub has_create_role: bool,
    /// User has CREATEDB
    pub has_create_db: bool,
    /// User bypasses row level security
    pub bypasses_rls: bool,
    /// User is a superuser (bypasses other privilege requirements)
    pub is_superuser: bool,
}

impl PrivilegeCheck {
    pub fn can_provision_roles(&self) -> bool {
        self.has_create_role || self.is_superuser
    }
}

/// Query `pg_roles` for the privileges of the currently connected user
///
/// # Examples
///
/// ```no_run
/// # use pg_provisioner::config::DbConfig;
/// # use pg_provisioner::postgres::{check_current_privileges, Database};
/// # async fn example() -> anyhow::Result<()> {
/// let db = Database::open(DbConfig::from_env()?).await?;
/// let client = db.acquire().await?;
/// let privs = check_current_privileges(&*client).await?;
/// assert!(privs.can_provision_roles());
/// # Ok(())
/// # }
/// ```
pub async fn check_current_privileges<C: GenericClient>(
    client: &C,
) -> Result<PrivilegeCheck, DbError> {
    let row = client
        .query_one(
            "SELECT rolcreaterole, rolcreatedb, rolbypassrls, rolsuper
             FROM pg_roles
             WHERE rolname = current_user",
            &[],
        )
        .await?;

    Ok(PrivilegeCheck {
        has_create_role: row.get(0),
        has_create_db: row.get(1),
        bypasses_rls: row.get(2),
        is_superuser: row.get(3),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_provision_roles() {
        let plain = PrivilegeCheck {
            has_create_role: false,
            has_create_db: true,
            bypasses_rls: false,
            is_superuser: false,
        };
        assert!(!plain.can_provision_roles());
        assert!(PrivilegeCheck {
            has_create_role: true,
            ..plain
        }
        .can_provision_roles());
        assert!(PrivilegeCheck {
            is_superuser: true,
            ..plain
        }
        .can_provision_roles());
    }

    #[tokio::test]
    #[ignore]
    async fn test_check_current_privileges() {
        let url = std::env::var("TEST_DATABASE_URL").unwrap();
        let db = crate::postgres::Database::open(crate::config::DbConfig::from_url(&url).unwrap())
            .await
            .unwrap();
        let client = db.acquire().await.unwrap();

        let privileges = check_current_privileges(&*client).await.unwrap();
        assert!(
            privileges.can_provision_roles(),
            "Test user should have CREATEROLE privilege or be superuser"
        );
    }
}
