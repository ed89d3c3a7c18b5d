// ABOUTME: Persistent, append-only record of applied migration versions
// ABOUTME: Self-bootstrapping schema_migrations table plus the migrator's advisory lock

use super::{LedgerEntry, Migration};
use crate::error::DbError;
use chrono::{DateTime, Utc};
use tokio_postgres::GenericClient;

pub const LEDGER_TABLE: &str = "schema_migrations";

/// Session advisory lock key serializing migrators ("schema_m" in ASCII)
pub const MIGRATION_LOCK_KEY: i64 = 0x7363_6865_6d61_5f6d;

const CREATE_LEDGER_SQL: &str = "
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version VARCHAR(255) PRIMARY KEY,
        applied_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
        description TEXT
    )
";

// COLLATE "C" keeps the database's ordering identical to byte-wise string comparison
const LIST_APPLIED_SQL: &str = "
    SELECT version, applied_at, description
    FROM schema_migrations
    ORDER BY version COLLATE \"C\"
";

const RECORD_SQL: &str = "
    INSERT INTO schema_migrations (version, description)
    VALUES ($1, $2)
    ON CONFLICT (version) DO NOTHING
";

/// Create the ledger table if it does not exist yet
pub async fn ensure_exists<C: GenericClient>(client: &C) -> Result<(), DbError> {
    client.batch_execute(CREATE_LEDGER_SQL).await?;
    Ok(())
}

/// All applied versions, ascending
pub async fn list_applied<C: GenericClient>(client: &C) -> Result<Vec<LedgerEntry>, DbError> {
    let rows = client.query(LIST_APPLIED_SQL, &[]).await?;

    // A foreign ledger with other column types must fail the read, not panic
    rows.iter()
        .map(|row| {
            let applied_at: DateTime<Utc> = row.try_get(1)?;
            let description: Option<String> = row.try_get(2)?;
            Ok::<_, DbError>(LedgerEntry {
                version: row.try_get(0)?,
                applied_at,
                description: description.unwrap_or_default(),
            })
        })
        .collect()
}

/// Insert the ledger row for `migration`
///
/// Returns `false` when the version is already recorded, i.e. another migrator
/// committed it first. Inside a transaction the row stays invisible to others until
/// commit, and a concurrent insert of the same version waits on it.
pub async fn record<C: GenericClient>(client: &C, migration: &Migration) -> Result<bool, DbError> {
    let inserted = client
        .execute(RECORD_SQL, &[&migration.version, &migration.description])
        .await?;
    Ok(inserted == 1)
}

/// Block until this session holds the migrator lock
pub async fn lock<C: GenericClient>(client: &C) -> Result<(), DbError> {
    client
        .execute("SELECT pg_advisory_lock($1)", &[&MIGRATION_LOCK_KEY])
        .await?;
    Ok(())
}

/// Release the migrator lock held by this session
pub async fn unlock<C: GenericClient>(client: &C) -> Result<(), DbError> {
    let row = client
        .query_one("SELECT pg_advisory_unlock($1)", &[&MIGRATION_LOCK_KEY])
        .await?;
    let released: bool = row.try_get(0)?;
    if !released {
        return Err(DbError::Other(
            "migration lock was not held by this session".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_spells_schema_m() {
        assert_eq!(&MIGRATION_LOCK_KEY.to_be_bytes(), b"schema_m");
    }

    #[test]
    fn test_ledger_statements_target_ledger_table() {
        for sql in [CREATE_LEDGER_SQL, LIST_APPLIED_SQL, RECORD_SQL] {
            assert!(sql.contains(LEDGER_TABLE));
        }
        assert!(RECORD_SQL.contains("ON CONFLICT (version) DO NOTHING"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_mistyped_ledger_is_an_error() {
        use crate::config::DbConfig;
        use crate::postgres::Database;

        let url = std::env::var("TEST_DATABASE_URL").unwrap();
        let db = Database::open(DbConfig::from_url(&url).unwrap()).await.unwrap();
        let client = db.acquire().await.unwrap();

        // A session-local table shadows the shared ledger for this connection only
        client
            .batch_execute(
                "CREATE TEMP TABLE schema_migrations (
                    version VARCHAR(255) PRIMARY KEY,
                    applied_at TIMESTAMP WITHOUT TIME ZONE NOT NULL DEFAULT now(),
                    description TEXT
                 );
                 INSERT INTO schema_migrations (version) VALUES ('001');",
            )
            .await
            .unwrap();

        let result = list_applied(&*client).await;
        client
            .batch_execute("DROP TABLE pg_temp.schema_migrations")
            .await
            .unwrap();
        let err = result.unwrap_err();
        assert!(matches!(err, DbError::Postgres(_)), "{}", err);
    }
}
