//! Scaffolding for new migration files

use crate::migration::file::{DOWN_MARKER, MIGRATION_EXTENSION, UP_MARKER};
use crate::migration::MigrationError;
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Version prefix format for generated files
pub const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

/// Body written into every new migration file
pub fn template() -> String {
    format!(
        "{UP_MARKER}\n\
         -- SQL in this section is executed when the migration is applied.\n\
         \n\
         {DOWN_MARKER}\n\
         -- SQL in this section is executed when the migration is rolled back.\n"
    )
}

/// Turn a free-form name into a file-name slug
///
/// Spaces and `-` become `_`; anything else outside `[A-Za-z0-9_]` is dropped.
pub fn sanitize_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter_map(|c| match c {
            ' ' | '-' => Some('_'),
            c if c.is_ascii_alphanumeric() || c == '_' => Some(c),
            _ => None,
        })
        .collect()
}

/// Create `<UTC timestamp>_<name>.sql` in `dir` and return its path
///
/// # Errors
///
/// - `MigrationError::InvalidName` if the name is empty after sanitizing
/// - `MigrationError::Io` if the directory or file cannot be created, or the
///   file already exists
pub fn create(dir: &Path, raw_name: &str) -> Result<PathBuf, MigrationError> {
    create_at(dir, raw_name, Utc::now())
}

/// [`create`] with an explicit clock
///
/// # Errors
///
/// See [`create`].
pub fn create_at(
    dir: &Path,
    raw_name: &str,
    now: DateTime<Utc>,
) -> Result<PathBuf, MigrationError> {
    if raw_name.trim().is_empty() {
        return Err(MigrationError::InvalidName(
            "migration name must not be empty".to_string(),
        ));
    }
    let name = sanitize_name(raw_name);
    if name.is_empty() {
        return Err(MigrationError::InvalidName(format!(
            "'{raw_name}' has no usable characters (allowed: letters, digits, '_', ' ', '-')"
        )));
    }

    fs::create_dir_all(dir).map_err(|source| MigrationError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let filename = format!("{}_{}.{}", now.format(VERSION_FORMAT), name, MIGRATION_EXTENSION);
    let path = dir.join(filename);

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|source| MigrationError::Io {
            path: path.clone(),
            source,
        })?;
    file.write_all(template().as_bytes())
        .map_err(|source| MigrationError::Io {
            path: path.clone(),
            source,
        })?;

    log::info!("Created migration {}", path.display());
    Ok(path)
}
