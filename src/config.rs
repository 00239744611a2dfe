//! Settings for the migration tool.
//!
//! Settings come from an optional configuration file (YAML, TOML or JSON,
//! chosen by extension) layered under `TIDEMARK__SECTION__KEY` environment
//! variables. `$VAR` and `${VAR}` references inside the file are expanded from
//! the environment before it is parsed.
//!
//! ```yaml
//! logger:
//!   level: debug
//! storage:
//!   host: ${DB_HOST}
//!   user: app
//!   dbname: app
//!   password_env: DB_PASSWORD
//! migrations:
//!   dir: db/migrations
//!   lock_timeout_seconds: 300
//! ```

use crate::migration::{TransactionMode, DEFAULT_LEDGER_TABLE};
use config::{Config, ConfigError, Environment, File, FileFormat};
use log::LevelFilter;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Prefix of environment variables overriding file settings
pub const ENV_PREFIX: &str = "TIDEMARK";

static ENV_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("env reference pattern is valid")
});

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoggerConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

/// Connection parameters, rendered as a key=value connection string
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_dbname")]
    pub dbname: String,
    /// Name of the environment variable holding the password
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default = "default_sslmode")]
    pub sslmode: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MigrationsConfig {
    #[serde(default = "default_migrations_dir")]
    pub dir: String,
    #[serde(default = "default_table")]
    pub table: String,
    /// Upper bound for waiting on the lock plus running the migrations
    #[serde(default)]
    pub lock_timeout_seconds: Option<u64>,
    /// Commit each migration separately instead of the whole batch at once
    #[serde(default)]
    pub per_migration: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_dbname() -> String {
    "postgres".to_string()
}

fn default_sslmode() -> String {
    "disable".to_string()
}

fn default_migrations_dir() -> String {
    "migrations".to_string()
}

fn default_table() -> String {
    DEFAULT_LEDGER_TABLE.to_string()
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            dbname: default_dbname(),
            password_env: None,
            sslmode: default_sslmode(),
        }
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_migrations_dir(),
            table: default_table(),
            lock_timeout_seconds: None,
            per_migration: false,
        }
    }
}

impl Settings {
    /// Load settings from `path` (optional) and `TIDEMARK__*` environment variables.
    ///
    /// Without a file, every value falls back to its default unless overridden
    /// by the environment.
    ///
    /// # Errors
    ///
    /// `ConfigError` if the file cannot be read or parsed, or a value has the
    /// wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                ConfigError::Message(format!(
                    "failed to read config file {}: {e}",
                    path.display()
                ))
            })?;
            let expanded = expand_env(&raw);
            builder = builder.add_source(File::from_str(&expanded, format_for(path)));
            log::debug!("Loaded configuration from {}", path.display());
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize::<Settings>()
    }
}

impl LoggerConfig {
    /// Parse `level` (`error`, `warn`, `info`, `debug`, `trace`, `off`)
    ///
    /// # Errors
    ///
    /// `ConfigError::Message` for an unknown level.
    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(self.level.trim()).map_err(|_| {
            ConfigError::Message(format!("unknown logger level '{}'", self.level))
        })
    }
}

impl StorageConfig {
    /// Render a key=value connection string
    ///
    /// The password is read from the environment variable named by
    /// `password_env`; an unset variable leaves the password out.
    pub fn connection_string(&self) -> String {
        let mut pairs = vec![
            ("host", self.host.clone()),
            ("port", self.port.to_string()),
            ("user", self.user.clone()),
            ("dbname", self.dbname.clone()),
            ("sslmode", self.sslmode.clone()),
        ];

        if let Some(var) = self.password_env.as_deref() {
            match std::env::var(var) {
                Ok(password) => pairs.push(("password", password)),
                Err(_) => log::warn!("Password variable {var} is not set, connecting without one"),
            }
        }

        pairs
            .into_iter()
            .map(|(key, value)| format!("{key}={}", quote_value(&value)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl MigrationsConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_seconds.map(Duration::from_secs)
    }

    pub fn transaction_mode(&self) -> TransactionMode {
        if self.per_migration {
            TransactionMode::PerMigration
        } else {
            TransactionMode::Batch
        }
    }
}

/// Replace `$VAR` and `${VAR}` with environment values; unset expands to empty
pub fn expand_env(raw: &str) -> String {
    ENV_REFERENCE
        .replace_all(raw, |caps: &Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map_or("", |m| m.as_str());
            std::env::var(name).unwrap_or_default()
        })
        .into_owned()
}

fn format_for(path: &Path) -> FileFormat {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("toml") => FileFormat::Toml,
        Some("json") => FileFormat::Json,
        _ => FileFormat::Yaml,
    }
}

/// Quote a connection string value when it is empty or contains spaces,
/// quotes or backslashes
fn quote_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}
