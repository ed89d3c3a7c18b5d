// ABOUTME: Schema introspection used by status reporting and reset
// ABOUTME: Lists user tables with their row-level security state

use crate::error::DbError;
use tokio_postgres::GenericClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
    pub row_count_estimate: i64,
    pub rls_enabled: bool,
}

impl TableInfo {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// List all tables outside the system schemas
pub async fn list_tables<C: GenericClient>(client: &C) -> Result<Vec<TableInfo>, DbError> {
    let rows = client
        .query(
            "SELECT
                t.schemaname,
                t.tablename,
                COALESCE(s.n_live_tup, 0) AS row_count,
                t.rowsecurity
             FROM pg_catalog.pg_tables t
             LEFT JOIN pg_catalog.pg_stat_user_tables s
                ON t.schemaname = s.schemaname
                AND t.tablename = s.relname
             WHERE t.schemaname NOT IN ('pg_catalog', 'information_schema')
             ORDER BY t.schemaname, t.tablename",
            &[],
        )
        .await?;

    let tables = rows
        .iter()
        .map(|row| TableInfo {
            schema: row.get(0),
            name: row.get(1),
            row_count_estimate: row.get(2),
            rls_enabled: row.get(3),
        })
        .collect();

    Ok(tables)
}

/// Whether `table` (optionally schema-qualified, default `public`) exists
pub async fn table_exists<C: GenericClient>(client: &C, table: &str) -> Result<bool, DbError> {
    let (schema, name) = table.split_once('.').unwrap_or(("public", table));
    let row = client
        .query_one(
            "SELECT EXISTS (
                SELECT 1 FROM pg_catalog.pg_tables
                WHERE schemaname = $1 AND tablename = $2
             )",
            &[&schema, &name],
        )
        .await?;
    Ok(row.get(0))
}

/// The subset of `tables` that does not exist, in the given order
pub async fn missing_tables<C: GenericClient>(
    client: &C,
    tables: &[String],
) -> Result<Vec<String>, DbError> {
    let mut missing = Vec::new();
    for table in tables {
        if !table_exists(client, table).await? {
            missing.push(table.clone());
        }
    }
    Ok(missing)
}
