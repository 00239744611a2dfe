//! Tidemark Migration CLI Tool
//!
//! Command-line interface for creating, applying and rolling back SQL
//! migrations. Output of `status` and `dbversion` is stable and meant for
//! scripts and CI pipelines; every failure prints one line on stderr and exits
//! with status 1.

mod signals;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use log::LevelFilter;
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};
use tidemark::config::Settings;
use tidemark::migration::creator;
use tidemark::{
    connect, CancelToken, LockCoordinator, Migrator, PgLedger, PostgresExecutor, TransactionMode,
};

/// Commit hash injected at build time, if any
const GIT_HASH: Option<&str> = option_env!("TIDEMARK_GIT_HASH");
/// Build date injected at build time, if any
const BUILD_DATE: Option<&str> = option_env!("TIDEMARK_BUILD_DATE");

#[derive(Parser, Debug)]
#[command(name = "tidemark")]
#[command(about = "Versioned SQL migrations for PostgreSQL")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Connection string, overrides the storage section of the configuration
    #[arg(long, env = "TIDEMARK_DSN", global = true)]
    dsn: Option<String>,

    /// Migrations directory path
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Give up after this many seconds of waiting for the lock and migrating
    #[arg(long, value_name = "SECS", global = true)]
    lock_timeout: Option<u64>,

    /// Commit each migration in its own transaction
    #[arg(long, global = true)]
    per_migration: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Create a new migration file
    Create {
        /// Migration name (e.g. "create users table")
        name: String,
    },

    /// Apply all pending migrations
    Up,

    /// Roll back the latest applied migration
    Down,

    /// Roll back and re-apply the latest applied migration
    Redo,

    /// Print applied versions, one per line
    Status,

    /// Print the latest applied version (0 if none)
    Dbversion,

    /// Print release, commit and build date
    Version,
}

fn main() {
    // Before anything else so every later thread inherits the blocked mask
    let interrupt = CancelToken::new();
    if let Err(e) = signals::cancel_on_signal(&interrupt) {
        eprintln!("{} failed to install signal handling: {e:#}", "error:".red().bold());
        process::exit(1);
    }

    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} failed to load configuration: {e}", "error:".red().bold());
            process::exit(1);
        }
    };

    let level = match log_level(&cli, &settings) {
        Ok(level) => level,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            process::exit(1);
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .init();

    match run(&cli, &settings, &interrupt) {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            process::exit(1);
        }
    }
}

fn log_level(cli: &Cli, settings: &Settings) -> Result<LevelFilter> {
    if cli.quiet {
        return Ok(LevelFilter::Error);
    }
    if cli.verbose {
        return Ok(LevelFilter::Debug);
    }
    settings
        .logger
        .level_filter()
        .context("invalid logger.level")
}

fn run(cli: &Cli, settings: &Settings, interrupt: &CancelToken) -> Result<()> {
    let dir = migrations_dir(cli, settings);

    match &cli.command {
        Commands::Create { name } => handle_create(&dir, name, cli.quiet),
        Commands::Version => {
            println!("{}", version_line());
            Ok(())
        }
        command => {
            let dsn = cli
                .dsn
                .clone()
                .unwrap_or_else(|| settings.storage.connection_string());
            let executor =
                PostgresExecutor::new(connect(&dsn).context("failed to connect to database")?);

            let ledger = PgLedger::with_table(settings.migrations.table.clone())?;
            let mode = if cli.per_migration {
                TransactionMode::PerMigration
            } else {
                settings.migrations.transaction_mode()
            };
            let migrator = Migrator::with_parts(&dir, ledger, LockCoordinator::new())
                .with_transaction_mode(mode);

            let cancel = cancel_token(cli, settings, interrupt);

            match command {
                Commands::Up => handle_up(&migrator, &executor, &cancel, cli.quiet),
                Commands::Down => handle_down(&migrator, &executor, &cancel, cli.quiet),
                Commands::Redo => handle_redo(&migrator, &executor, &cancel, cli.quiet),
                Commands::Status => handle_status(&migrator, &executor),
                Commands::Dbversion => handle_dbversion(&migrator, &executor),
                Commands::Create { .. } | Commands::Version => Ok(()),
            }
        }
    }
}

/// The interrupt token, bounded by `--lock-timeout` or the configured timeout
fn cancel_token(cli: &Cli, settings: &Settings, interrupt: &CancelToken) -> CancelToken {
    let timeout = cli
        .lock_timeout
        .map(Duration::from_secs)
        .or_else(|| settings.migrations.lock_timeout());
    match timeout.and_then(|t| Instant::now().checked_add(t)) {
        Some(deadline) => interrupt.deadline_at(deadline),
        None => interrupt.clone(),
    }
}

fn migrations_dir(cli: &Cli, settings: &Settings) -> PathBuf {
    cli.dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&settings.migrations.dir))
}

fn version_line() -> String {
    format!(
        "tidemark {} ({}) {}",
        env!("CARGO_PKG_VERSION"),
        GIT_HASH.unwrap_or("unknown"),
        BUILD_DATE.unwrap_or("unknown")
    )
}

fn handle_create(dir: &Path, name: &str, quiet: bool) -> Result<()> {
    let path = creator::create(dir, name)?;
    if !quiet {
        println!("{} {}", "Created".green(), path.display());
    }
    Ok(())
}

fn handle_up(
    migrator: &Migrator,
    executor: &PostgresExecutor,
    cancel: &CancelToken,
    quiet: bool,
) -> Result<()> {
    let applied = migrator.up(executor, cancel)?;
    if !quiet {
        if applied > 0 {
            println!("{} {applied} migration(s)", "Applied".green());
        } else {
            println!("{}", "No pending migrations".yellow());
        }
    }
    Ok(())
}

fn handle_down(
    migrator: &Migrator,
    executor: &PostgresExecutor,
    cancel: &CancelToken,
    quiet: bool,
) -> Result<()> {
    let rolled_back = migrator.down(executor, cancel)?;
    if !quiet {
        match rolled_back {
            Some(version) => println!("{} {version}", "Rolled back".green()),
            None => println!("{}", "No applied migrations".yellow()),
        }
    }
    Ok(())
}

fn handle_redo(
    migrator: &Migrator,
    executor: &PostgresExecutor,
    cancel: &CancelToken,
    quiet: bool,
) -> Result<()> {
    let redone = migrator.redo(executor, cancel)?;
    if !quiet {
        match redone {
            Some(version) => println!("{} {version}", "Redone".green()),
            None => println!("{}", "No applied migrations".yellow()),
        }
    }
    Ok(())
}

fn handle_status(migrator: &Migrator, executor: &PostgresExecutor) -> Result<()> {
    for entry in migrator.status(executor)? {
        println!("{}\t{}", entry.version, entry.applied);
    }
    Ok(())
}

fn handle_dbversion(migrator: &Migrator, executor: &PostgresExecutor) -> Result<()> {
    println!("{}", migrator.db_version(executor)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from(["tidemark", "create", "add users"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Create {
                name: "add users".to_string()
            }
        );

        let cli = Cli::try_parse_from(["tidemark", "dbversion"]).unwrap();
        assert_eq!(cli.command, Commands::Dbversion);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tidemark",
            "up",
            "--dsn",
            "host=db user=app",
            "--dir",
            "db/migrations",
            "--lock-timeout",
            "30",
            "--per-migration",
        ])
        .unwrap();

        assert_eq!(cli.command, Commands::Up);
        assert_eq!(cli.dsn.as_deref(), Some("host=db user=app"));
        assert_eq!(cli.dir, Some(PathBuf::from("db/migrations")));
        assert_eq!(cli.lock_timeout, Some(30));
        assert!(cli.per_migration);
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(Cli::try_parse_from(["tidemark", "sideways"]).is_err());
        assert!(Cli::try_parse_from(["tidemark", "create"]).is_err());
    }

    #[test]
    fn test_quiet_and_verbose_conflict() {
        assert!(Cli::try_parse_from(["tidemark", "-q", "-v", "status"]).is_err());
    }

    #[test]
    fn test_log_level_precedence() {
        let settings = Settings::default();

        let cli = Cli::try_parse_from(["tidemark", "-q", "status"]).unwrap();
        assert_eq!(log_level(&cli, &settings).unwrap(), LevelFilter::Error);

        let cli = Cli::try_parse_from(["tidemark", "-v", "status"]).unwrap();
        assert_eq!(log_level(&cli, &settings).unwrap(), LevelFilter::Debug);

        let cli = Cli::try_parse_from(["tidemark", "status"]).unwrap();
        assert_eq!(log_level(&cli, &settings).unwrap(), LevelFilter::Info);
    }

    #[test]
    fn test_dir_flag_overrides_configuration() {
        let settings = Settings::default();

        let cli = Cli::try_parse_from(["tidemark", "status"]).unwrap();
        assert_eq!(migrations_dir(&cli, &settings), PathBuf::from("migrations"));

        let cli = Cli::try_parse_from(["tidemark", "--dir", "sql", "status"]).unwrap();
        assert_eq!(migrations_dir(&cli, &settings), PathBuf::from("sql"));
    }

    #[test]
    fn test_cancel_token_shares_interrupt_flag() {
        let settings = Settings::default();
        let interrupt = CancelToken::new();

        let cli = Cli::try_parse_from(["tidemark", "--lock-timeout", "30", "up"]).unwrap();
        let bounded = cancel_token(&cli, &settings, &interrupt);
        assert!(bounded.deadline().is_some());

        let cli = Cli::try_parse_from(["tidemark", "up"]).unwrap();
        let unbounded = cancel_token(&cli, &settings, &interrupt);
        assert_eq!(
            unbounded.deadline().is_some(),
            settings.migrations.lock_timeout().is_some()
        );

        assert!(bounded.check().is_ok());
        interrupt.cancel();
        assert!(bounded.is_cancelled());
        assert!(unbounded.is_cancelled());
    }

    #[test]
    fn test_create_and_version_need_no_database() {
        let dir = TempDir::new().unwrap();
        let dir_arg = dir.path().to_str().unwrap();
        let settings = Settings::default();

        let cli = Cli::try_parse_from(["tidemark", "-q", "--dir", dir_arg, "create", "init"]).unwrap();
        run(&cli, &settings, &CancelToken::new()).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let cli = Cli::try_parse_from(["tidemark", "version"]).unwrap();
        run(&cli, &settings, &CancelToken::new()).unwrap();
        assert!(version_line().starts_with(&format!("tidemark {} (", env!("CARGO_PKG_VERSION"))));
    }
}
