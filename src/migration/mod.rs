// ABOUTME: Versioned migration engine module
// ABOUTME: Declared migrations, the applied-version ledger, and the transactional migrator

pub mod catalog;
pub mod ledger;
pub mod migrator;
pub mod schema;
pub mod source;

use chrono::{DateTime, Utc};

pub use ledger::LEDGER_TABLE;
pub use migrator::{plan, validate_declared, AppliedMigration, MigrationReport, Migrator};
pub use schema::{list_tables, TableInfo};

/// One declared schema change, identified by its version
///
/// Versions are compared as plain strings, so callers should zero-pad numeric schemes
/// (`"001"`, `"002"`, ... or timestamps).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: String,
    pub description: String,
    pub body: String,
}

impl Migration {
    pub fn new(
        version: impl Into<String>,
        description: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            version: version.into(),
            description: description.into(),
            body: body.into(),
        }
    }
}

/// A row of the ledger table: a version that has been applied, and when
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub version: String,
    pub applied_at: DateTime<Utc>,
    pub description: String,
}

/// An idempotent statement applied on every `migrate`, outside the versioned list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaFixture {
    pub name: String,
    pub sql: String,
}
