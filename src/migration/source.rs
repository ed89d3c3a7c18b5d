// ABOUTME: Loads declared migrations and fixtures from a directory of SQL files
// ABOUTME: File names follow <version>_<description>.sql

use super::{Migration, SchemaFixture};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// Subdirectory of a migrations directory holding re-appliable fixtures
pub const FIXTURES_DIR: &str = "fixtures";

/// Split `001_create_users` into `("001", "create users")`
pub fn parse_file_stem(stem: &str) -> (String, String) {
    match stem.split_once('_') {
        Some((version, description)) => (version.to_string(), description.replace('_', " ")),
        None => (stem.to_string(), String::new()),
    }
}

fn sql_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
    {
        let path = entry
            .with_context(|| format!("Failed to list {}", dir.display()))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "sql") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn read_body(path: &Path) -> Result<String> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if body.trim().is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(body)
}

/// Load every `*.sql` file directly inside `dir` as a migration
///
/// Subdirectories (including `fixtures/`) and other file types are ignored.
pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<Migration>> {
    let dir = dir.as_ref();
    let mut migrations = Vec::new();

    for path in sql_files(dir)? {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| format!("Non UTF-8 migration file name {}", path.display()))?;
        let (version, description) = parse_file_stem(stem);
        migrations.push(Migration::new(version, description, read_body(&path)?));
    }

    tracing::debug!("Loaded {} migration(s) from {}", migrations.len(), dir.display());
    Ok(migrations)
}

/// Load `<dir>/fixtures/*.sql`, or nothing when that directory does not exist
pub fn load_fixtures(dir: impl AsRef<Path>) -> Result<Vec<SchemaFixture>> {
    let fixtures_dir = dir.as_ref().join(FIXTURES_DIR);
    if !fixtures_dir.is_dir() {
        return Ok(Vec::new());
    }

    sql_files(&fixtures_dir)?
        .into_iter()
        .map(|path| {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(SchemaFixture {
                name,
                sql: read_body(&path)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_file_stem() {
        assert_eq!(
            parse_file_stem("001_create_users"),
            ("001".to_string(), "create users".to_string())
        );
        assert_eq!(
            parse_file_stem("20240101120000"),
            ("20240101120000".to_string(), String::new())
        );
    }

    #[test]
    fn test_load_dir_reads_sql_files_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("002_add_phone.sql"), "ALTER TABLE users ADD COLUMN phone text;").unwrap();
        fs::write(dir.path().join("001_create_users.sql"), "CREATE TABLE users (id int);").unwrap();
        fs::write(dir.path().join("README.md"), "not a migration").unwrap();
        fs::create_dir(dir.path().join(FIXTURES_DIR)).unwrap();
        fs::write(dir.path().join(FIXTURES_DIR).join("01_trigger.sql"), "SELECT 1;").unwrap();

        let migrations = load_dir(dir.path()).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, "001");
        assert_eq!(migrations[0].description, "create users");
        assert_eq!(migrations[1].version, "002");
        assert!(migrations[1].body.contains("ADD COLUMN phone"));
    }

    #[test]
    fn test_load_dir_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("001_empty.sql"), "  \n").unwrap();
        let err = load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("is empty"));
    }

    #[test]
    fn test_load_dir_missing_directory() {
        assert!(load_dir("/definitely/not/a/real/dir").is_err());
    }

    #[test]
    fn test_load_fixtures() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_fixtures(dir.path()).unwrap().is_empty());

        fs::create_dir(dir.path().join(FIXTURES_DIR)).unwrap();
        fs::write(dir.path().join(FIXTURES_DIR).join("02_b.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join(FIXTURES_DIR).join("01_a.sql"), "SELECT 1;").unwrap();

        let fixtures = load_fixtures(dir.path()).unwrap();
        let names: Vec<_> = fixtures.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["01_a", "02_b"]);
    }
}
