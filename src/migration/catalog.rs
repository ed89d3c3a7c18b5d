// ABOUTME: Built-in schema of the drive platform (users, folders, files)
// ABOUTME: Embedded from the repository's migrations/ directory at compile time

use super::{Migration, SchemaFixture};

const MIGRATIONS: &[(&str, &str, &str)] = &[
    (
        "001",
        "create users",
        include_str!("../../migrations/001_create_users.sql"),
    ),
    (
        "002",
        "create folders",
        include_str!("../../migrations/002_create_folders.sql"),
    ),
    (
        "003",
        "create files",
        include_str!("../../migrations/003_create_files.sql"),
    ),
];

const FIXTURES: &[(&str, &str)] = &[
    (
        "01_users_email_format_check",
        include_str!("../../migrations/fixtures/01_users_email_format_check.sql"),
    ),
    (
        "02_folders_no_self_parent_check",
        include_str!("../../migrations/fixtures/02_folders_no_self_parent_check.sql"),
    ),
    (
        "03_update_updated_at_column",
        include_str!("../../migrations/fixtures/03_update_updated_at_column.sql"),
    ),
    (
        "04_updated_at_triggers",
        include_str!("../../migrations/fixtures/04_updated_at_triggers.sql"),
    ),
];

pub fn migrations() -> Vec<Migration> {
    MIGRATIONS
        .iter()
        .map(|(version, description, body)| Migration::new(*version, *description, *body))
        .collect()
}

/// Constraints, functions, and triggers re-applied after every migrate
pub fn fixtures() -> Vec<SchemaFixture> {
    FIXTURES
        .iter()
        .map(|(name, sql)| SchemaFixture {
            name: name.to_string(),
            sql: sql.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{source, validate_declared};

    #[test]
    fn test_catalog_versions_are_unique_and_ordered() {
        let migrations = migrations();
        validate_declared(&migrations).unwrap();
        let versions: Vec<_> = migrations.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(versions, vec!["001", "002", "003"]);
    }

    #[test]
    fn test_catalog_matches_migrations_directory() {
        let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/migrations");
        assert_eq!(source::load_dir(dir).unwrap(), migrations());
        assert_eq!(source::load_fixtures(dir).unwrap(), fixtures());
    }

    #[test]
    fn test_fixtures_are_guarded_or_replaceable() {
        for fixture in fixtures() {
            let sql = fixture.sql.to_uppercase();
            assert!(
                sql.contains("IF NOT EXISTS")
                    || sql.contains("CREATE OR REPLACE")
                    || sql.contains("DROP TRIGGER IF EXISTS"),
                "fixture {} must be safe to re-apply",
                fixture.name
            );
        }
    }
}
