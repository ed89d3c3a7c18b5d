// ABOUTME: Extension management for the shared schema
// ABOUTME: Creates required extensions idempotently and reports what is installed

use crate::error::{DbError, ProvisionError};
use crate::utils::{self, quote_ident};
use tokio_postgres::GenericClient;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub name: String,
    pub version: String,
}

/// Get list of installed extensions on a database
pub async fn get_installed_extensions<C: GenericClient>(
    client: &C,
) -> Result<Vec<Extension>, DbError> {
    let rows = client
        .query(
            "SELECT extname, extversion FROM pg_extension WHERE extname != 'plpgsql' ORDER BY extname",
            &[],
        )
        .await?;

    let extensions = rows
        .iter()
        .map(|row| Extension {
            name: row.get(0),
            version: row.get(1),
        })
        .collect();

    Ok(extensions)
}

pub fn create_extension_sql(name: &str) -> String {
    format!("CREATE EXTENSION IF NOT EXISTS {}", quote_ident(name))
}

/// Create each extension if it is not already installed
///
/// Stops at the first failure; extensions created before it stay installed.
pub async fn ensure_extensions<C: GenericClient>(
    client: &C,
    names: &[String],
    cancel: &CancellationToken,
) -> Result<usize, ProvisionError> {
    let installed = utils::cancellable(cancel, get_installed_extensions(client))
        .await
        .map_err(|source| ProvisionError::Schema {
            name: "list extensions".to_string(),
            source,
        })?;

    let mut created = 0;
    for name in names {
        if installed.iter().any(|ext| &ext.name == name) {
            tracing::debug!("Extension '{}' already installed", name);
            continue;
        }

        let sql = create_extension_sql(name);
        utils::cancellable(cancel, async {
            client.batch_execute(&sql).await.map_err(DbError::from)
        })
        .await
        .map_err(|source| match source {
            DbError::Cancelled => ProvisionError::Cancelled {
                operation: format!("create extension {}", name),
            },
            source => ProvisionError::Schema {
                name: format!("extension {}", name),
                source,
            },
        })?;

        tracing::info!("✓ Extension '{}' created", name);
        created += 1;
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_extension_sql_quotes_hyphenated_names() {
        assert_eq!(
            create_extension_sql("uuid-ossp"),
            "CREATE EXTENSION IF NOT EXISTS \"uuid-ossp\""
        );
    }

    #[tokio::test]
    #[ignore]
    async fn test_ensure_extensions_is_idempotent() {
        let url = std::env::var("TEST_DATABASE_URL").unwrap();
        let db = crate::postgres::Database::open(crate::config::DbConfig::from_url(&url).unwrap())
            .await
            .unwrap();
        let client = db.acquire().await.unwrap();
        let cancel = CancellationToken::new();
        let wanted = vec!["pgcrypto".to_string()];

        ensure_extensions(&*client, &wanted, &cancel).await.unwrap();
        let second = ensure_extensions(&*client, &wanted, &cancel).await.unwrap();
        assert_eq!(second, 0);

        let installed = get_installed_extensions(&*client).await.unwrap();
        assert!(installed.iter().any(|e| e.name == "pgcrypto"));
    }
}
