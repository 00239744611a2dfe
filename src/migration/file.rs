//! Migration file discovery and parsing
//!
//! A migration file is named `<version>_<name>.sql` and holds two sections:
//!
//! ```sql
//! -- +tidemark Up
//! CREATE TABLE users (id BIGINT PRIMARY KEY);
//!
//! -- +tidemark Down
//! DROP TABLE users;
//! ```
//!
//! Anything before the first marker is ignored.

use crate::migration::{Direction, MigrationError};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// File extension of migration files
pub const MIGRATION_EXTENSION: &str = "sql";

/// Sentinel line opening the forward script
pub const UP_MARKER: &str = "-- +tidemark Up";

/// Sentinel line opening the reverse script
pub const DOWN_MARKER: &str = "-- +tidemark Down";

/// A parsed migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    /// Path to the migration file
    pub path: PathBuf,

    /// Migration version (numeric filename prefix, usually `YYYYMMDDHHMMSS`)
    pub version: i64,

    /// Human-readable migration name
    pub name: String,

    /// Forward script, trimmed
    pub up_sql: String,

    /// Reverse script, trimmed
    pub down_sql: String,
}

impl MigrationFile {
    /// Parse a single migration file
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` if the file name is malformed or the file
    /// cannot be read.
    pub fn from_path(path: &Path) -> Result<Self, MigrationError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MigrationError::parse(path, "file name is not valid UTF-8"))?;

        let (version, name) =
            Self::parse_filename(filename).map_err(|reason| MigrationError::parse(path, reason))?;

        let content = fs::read_to_string(path)
            .map_err(|e| MigrationError::parse(path, format!("failed to read file: {e}")))?;

        let (up_sql, down_sql) = split_sections(&content);

        Ok(Self {
            path: path.to_path_buf(),
            version,
            name,
            up_sql,
            down_sql,
        })
    }

    /// Parse migration file name to extract version and name
    ///
    /// Expected format: `{version}_{name}.sql`, split at the first `_`.
    ///
    /// # Example
    /// - `20250713101010_create_users.sql` → version: 20250713101010, name: "create_users"
    ///
    /// # Errors
    ///
    /// Returns the reason the name was rejected.
    pub fn parse_filename(filename: &str) -> Result<(i64, String), String> {
        let stem = filename
            .strip_suffix(".sql")
            .ok_or_else(|| format!("'{filename}' does not end in .{MIGRATION_EXTENSION}"))?;

        let (prefix, name) = stem.split_once('_').ok_or_else(|| {
            format!("'{filename}' must be named <version>_<name>.{MIGRATION_EXTENSION}")
        })?;

        if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!(
                "invalid version prefix '{prefix}': expected a non-negative integer"
            ));
        }

        let version = prefix
            .parse::<i64>()
            .map_err(|e| format!("invalid version prefix '{prefix}': {e}"))?;

        Ok((version, name.to_string()))
    }

    /// Script for the given direction
    pub fn script(&self, direction: Direction) -> &str {
        match direction {
            Direction::Up => &self.up_sql,
            Direction::Down => &self.down_sql,
        }
    }

    /// Fail with `MigrationError::Validation` unless the script has executable SQL
    ///
    /// # Errors
    ///
    /// `MigrationError::Validation` naming this migration and `direction`.
    pub fn ensure_executable(&self, direction: Direction) -> Result<(), MigrationError> {
        if is_executable_sql(self.script(direction)) {
            Ok(())
        } else {
            Err(MigrationError::Validation {
                version: self.version,
                name: self.name.clone(),
                direction,
            })
        }
    }
}

/// Split file content into trimmed `(up, down)` scripts
fn split_sections(content: &str) -> (String, String) {
    enum Section {
        Preamble,
        Up,
        Down,
    }

    let mut section = Section::Preamble;
    let mut up = String::new();
    let mut down = String::new();

    for line in content.lines() {
        match line.trim() {
            UP_MARKER => {
                section = Section::Up;
                continue;
            }
            DOWN_MARKER => {
                section = Section::Down;
                continue;
            }
            _ => {}
        }
        let target = match section {
            Section::Preamble => continue,
            Section::Up => &mut up,
            Section::Down => &mut down,
        };
        target.push_str(line);
        target.push('\n');
    }

    (up.trim().to_string(), down.trim().to_string())
}

/// True if at least one line is neither blank nor a `--` comment
pub fn is_executable_sql(sql: &str) -> bool {
    sql.lines().any(|line| {
        let trimmed = line.trim();
        !trimmed.is_empty() && !trimmed.starts_with("--")
    })
}

/// Discover all migration files in a directory
///
/// Scans `migrations_dir` (non-recursively) for `*.sql` files, parses each one and
/// returns them sorted by version (ascending).
///
/// # Errors
///
/// Fails fast: one unreadable or misnamed file aborts the whole scan.
///
/// - `MigrationError::Parse` if the directory cannot be read or a file is malformed
/// - `MigrationError::DuplicateVersion` if two files share a version prefix
pub fn discover_migrations(migrations_dir: &Path) -> Result<Vec<MigrationFile>, MigrationError> {
    if !migrations_dir.is_dir() {
        return Err(MigrationError::parse(
            migrations_dir,
            "migrations directory does not exist or is not a directory",
        ));
    }

    let entries = fs::read_dir(migrations_dir).map_err(|e| {
        MigrationError::parse(migrations_dir, format!("failed to read directory: {e}"))
    })?;

    let mut by_version: BTreeMap<i64, MigrationFile> = BTreeMap::new();

    for entry in entries {
        let entry = entry.map_err(|e| {
            MigrationError::parse(migrations_dir, format!("failed to read directory entry: {e}"))
        })?;

        let path = entry.path();
        if !path.is_file()
            || path.extension().and_then(|s| s.to_str()) != Some(MIGRATION_EXTENSION)
        {
            continue;
        }

        let migration = MigrationFile::from_path(&path)?;
        if let Some(existing) = by_version.get(&migration.version) {
            // read_dir order is unspecified; report the pair in a stable order
            let (first, second) = if existing.path <= migration.path {
                (existing.path.clone(), migration.path)
            } else {
                (migration.path, existing.path.clone())
            };
            return Err(MigrationError::DuplicateVersion {
                version: migration.version,
                first,
                second,
            });
        }
        by_version.insert(migration.version, migration);
    }

    Ok(by_version.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn migration_body(up: &str, down: &str) -> String {
        format!("{UP_MARKER}\n{up}\n{DOWN_MARKER}\n{down}\n")
    }

    #[test]
    fn test_parse_filename() {
        assert_eq!(
            MigrationFile::parse_filename("20250713101010_init.sql").unwrap(),
            (20250713101010, "init".to_string())
        );
        assert_eq!(
            MigrationFile::parse_filename("7_add_users_table.sql").unwrap(),
            (7, "add_users_table".to_string())
        );
        assert_eq!(
            MigrationFile::parse_filename("0001_.sql").unwrap(),
            (1, String::new())
        );
    }

    #[test]
    fn test_parse_filename_rejects_malformed_names() {
        for bad in [
            "badname.sql",
            "_init.sql",
            "v1_init.sql",
            "-5_init.sql",
            "+5_init.sql",
            "99999999999999999999_init.sql",
            "20250713101010_init.txt",
        ] {
            assert!(
                MigrationFile::parse_filename(bad).is_err(),
                "Should reject: {bad}"
            );
        }
    }

    #[test]
    fn test_discover_parses_sections() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "20250713101010_init.sql",
            "\n-- +tidemark Up\nCREATE TABLE qwe(id INT);\n-- +tidemark Down\nDROP TABLE qwe;",
        );

        let got = discover_migrations(dir.path()).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].version, 20250713101010);
        assert_eq!(got[0].name, "init");
        assert_eq!(got[0].up_sql, "CREATE TABLE qwe(id INT);");
        assert_eq!(got[0].down_sql, "DROP TABLE qwe;");
    }

    #[test]
    fn test_preamble_is_discarded_and_markers_are_trimmed() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "1_x.sql",
            "header comment\nSELECT 'ignored';\n   -- +tidemark Up  \n\n  CREATE TABLE a(id int);\n  CREATE TABLE b(id int);\n\n\t-- +tidemark Down\nDROP TABLE b;\nDROP TABLE a;\n\n",
        );

        let got = discover_migrations(dir.path()).unwrap();
        assert_eq!(got[0].up_sql, "CREATE TABLE a(id int);\n  CREATE TABLE b(id int);");
        assert_eq!(got[0].down_sql, "DROP TABLE b;\nDROP TABLE a;");
    }

    #[test]
    fn test_missing_markers_give_empty_scripts() {
        let dir = TempDir::new().unwrap();
        write(&dir, "3_plain.sql", "CREATE TABLE nope(id int);\n");

        let got = discover_migrations(dir.path()).unwrap();
        assert_eq!(got[0].up_sql, "");
        assert_eq!(got[0].down_sql, "");
    }

    #[test]
    fn test_discover_sorts_by_version_and_skips_other_files() {
        let dir = TempDir::new().unwrap();
        write(&dir, "30_third.sql", &migration_body("SELECT 3;", "SELECT -3;"));
        write(&dir, "2_first.sql", &migration_body("SELECT 1;", "SELECT -1;"));
        write(&dir, "10_second.sql", &migration_body("SELECT 2;", "SELECT -2;"));
        write(&dir, "README.md", "not a migration");
        fs::create_dir(dir.path().join("99_nested.sql")).unwrap();

        let got = discover_migrations(dir.path()).unwrap();
        let versions: Vec<i64> = got.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![2, 10, 30]);
        let names: Vec<&str> = got.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_one_bad_filename_fails_the_whole_directory() {
        let dir = TempDir::new().unwrap();
        write(&dir, "20250713101010_init.sql", &migration_body("SELECT 1;", "SELECT 2;"));
        write(&dir, "badname.sql", "");

        let err = discover_migrations(dir.path()).unwrap_err();
        assert!(matches!(err, MigrationError::Parse { .. }), "got {err:?}");
    }

    #[test]
    fn test_duplicate_versions_are_rejected() {
        let dir = TempDir::new().unwrap();
        let a = write(&dir, "0042_alpha.sql", &migration_body("SELECT 1;", "SELECT 2;"));
        let b = write(&dir, "42_beta.sql", &migration_body("SELECT 1;", "SELECT 2;"));

        match discover_migrations(dir.path()).unwrap_err() {
            MigrationError::DuplicateVersion {
                version,
                first,
                second,
            } => {
                assert_eq!(version, 42);
                assert_eq!(first, a);
                assert_eq!(second, b);
            }
            other => panic!("expected DuplicateVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_directory_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let err = discover_migrations(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, MigrationError::Parse { .. }));
    }

    #[test]
    fn test_empty_directory() {
        let dir = TempDir::new().unwrap();
        assert!(discover_migrations(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_is_executable_sql() {
        assert!(!is_executable_sql("-- comment only"));
        assert!(!is_executable_sql("\n\t  "));
        assert!(!is_executable_sql(""));
        assert!(!is_executable_sql("  -- one\n-- two\n"));
        assert!(is_executable_sql("CREATE TABLE x(id INT);"));
        assert!(is_executable_sql("-- create it\nCREATE TABLE x(id INT);"));
    }

    #[test]
    fn test_ensure_executable() {
        let migration = MigrationFile {
            path: PathBuf::from("5_x.sql"),
            version: 5,
            name: "x".to_string(),
            up_sql: "CREATE TABLE x(id int);".to_string(),
            down_sql: "-- nothing to undo".to_string(),
        };
        assert!(migration.ensure_executable(Direction::Up).is_ok());
        assert!(matches!(
            migration.ensure_executable(Direction::Down),
            Err(MigrationError::Validation {
                version: 5,
                direction: Direction::Down,
                ..
            })
        ));
    }
}
