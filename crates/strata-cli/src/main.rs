mod commands;
mod table;
mod wizard;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use strata_config::{AppConfig, ConfigLoader};
use strata_db::Version;
use tracing_subscriber::EnvFilter;

use crate::commands::RevertScope;

#[derive(Parser)]
#[command(name = "strata", version, about = "Versioned schema migrations for SQLite")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Config file (.yml, .yaml or .toml). Defaults to the user config dir.
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file, overriding the config.
    #[arg(long, global = true, env = "STRATA_DATABASE")]
    database: Option<PathBuf>,

    /// Migrations directory, overriding the config.
    #[arg(long, global = true, env = "STRATA_MIGRATIONS")]
    migrations: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `strata_db=trace`. `RUST_LOG` wins.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Write a config file interactively.
    Init,
    #[command(flatten)]
    Ledger(LedgerCommand),
}

/// Commands that run against a configured store.
#[derive(Subcommand)]
enum LedgerCommand {
    /// Show applied and pending migrations.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Apply pending migrations.
    Up {
        /// Stop after this version.
        #[arg(long)]
        to: Option<u64>,
    },
    /// Revert applied migrations, newest first.
    Down {
        /// How many migrations to revert.
        #[arg(long, default_value_t = 1, conflicts_with_all = ["to", "all"])]
        steps: usize,
        /// Revert everything newer than this version.
        #[arg(long, conflicts_with = "all")]
        to: Option<u64>,
        /// Revert every applied migration.
        #[arg(long)]
        all: bool,
    },
    /// Create an empty up/down migration pair.
    New { name: String },
    /// Remove a lock left behind by a crashed runner.
    Unlock,
}

fn main() -> Result<()> {
    let Cli { global, command } = Cli::parse();

    match command {
        // Runs before any config is loaded, since fixing a broken config is
        // one reason to run it.
        Command::Init => {
            init_tracing(global.log_level.as_deref().unwrap_or("info"), global.log_json);
            let path = global
                .config
                .unwrap_or_else(|| ConfigLoader::new().default_path());
            wizard::run_wizard(&path)
        }
        Command::Ledger(command) => {
            let config = load_config(&global)?;
            init_tracing(
                global.log_level.as_deref().unwrap_or(&config.log.level),
                global.log_json || config.log.json,
            );
            run(command, &config)
        }
    }
}

fn run(command: LedgerCommand, config: &AppConfig) -> Result<()> {
    match command {
        LedgerCommand::Status { json } => commands::status(config, json),
        LedgerCommand::Up { to } => commands::up(config, to.map(Version::new)),
        LedgerCommand::Down { steps, to, all } => {
            let scope = match (to, all) {
                (_, true) => RevertScope::All,
                (Some(v), false) => RevertScope::To(Version::new(v)),
                (None, false) => RevertScope::Last(steps),
            };
            commands::down(config, scope)
        }
        LedgerCommand::New { name } => commands::new_migration(config, &name),
        LedgerCommand::Unlock => commands::unlock(config),
    }
}

fn load_config(global: &GlobalArgs) -> Result<AppConfig> {
    let mut config = match &global.config {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::new().load()?,
    };

    if let Some(database) = &global.database {
        config.database.path = database.clone();
    }
    if let Some(migrations) = &global.migrations {
        config.migrations.directory = migrations.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Logs go to stderr so `status --json` output stays parseable.
fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn down_defaults_to_one_step() {
        let cli = Cli::try_parse_from(["strata", "down"]).unwrap();
        match cli.command {
            Command::Ledger(LedgerCommand::Down { steps, to, all }) => {
                assert_eq!(steps, 1);
                assert!(to.is_none());
                assert!(!all);
            }
            _ => panic!("expected down"),
        }
    }

    #[test]
    fn down_steps_conflicts_with_all() {
        assert!(Cli::try_parse_from(["strata", "down", "--steps", "2", "--all"]).is_err());
    }

    #[test]
    fn global_overrides_apply_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("strata.toml");
        std::fs::write(&config_path, "[database]\npath = \"from-config.db\"\n").unwrap();

        let cli = Cli::try_parse_from([
            "strata",
            "--config",
            config_path.to_str().unwrap(),
            "--migrations",
            "db/migrations",
            "status",
        ])
        .unwrap();
        let config = load_config(&cli.global).unwrap();
        assert_eq!(config.database.path, PathBuf::from("from-config.db"));
        assert_eq!(config.migrations.directory, PathBuf::from("db/migrations"));
    }
}
