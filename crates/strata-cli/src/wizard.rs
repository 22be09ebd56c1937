use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use dialoguer::{Confirm, Input, Select};
use strata_common::sql;
use strata_config::{AppConfig, DatabaseConfig, LogConfig, MigrationsConfig};
use tracing::info;

/// Run the interactive setup wizard and write `config_path`.
pub fn run_wizard(config_path: &Path) -> Result<()> {
    if !std::io::stdin().is_terminal() {
        println!("Non-interactive environment detected.");
        println!("To configure Strata, edit: {}", config_path.display());
        println!();
        println!("Minimal config.yml example:");
        println!("---");
        print!("{}", example_yaml()?);
        return Ok(());
    }

    println!();
    println!("  Strata Setup");
    println!("  ------------");
    println!();

    if config_path.exists() {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} exists. Overwrite?", config_path.display()))
            .default(false)
            .interact()
            .context("overwrite confirmation cancelled")?;
        if !overwrite {
            println!("  Keeping existing config.");
            return Ok(());
        }
    }

    let defaults = AppConfig::default();

    // --- Database ---
    let database: String = Input::new()
        .with_prompt("SQLite database file")
        .default(defaults.database.path.display().to_string())
        .interact_text()
        .context("database path input cancelled")?;

    // --- Migrations ---
    let directory: String = Input::new()
        .with_prompt("Migrations directory")
        .default(defaults.migrations.directory.display().to_string())
        .interact_text()
        .context("migrations directory input cancelled")?;

    let table: String = Input::new()
        .with_prompt("Ledger table name")
        .default(defaults.migrations.table.clone())
        .validate_with(|input: &String| -> std::result::Result<(), String> {
            if sql::is_identifier(input) {
                Ok(())
            } else {
                Err("use letters, digits and underscores only".to_string())
            }
        })
        .interact_text()
        .context("table name input cancelled")?;

    // --- Logging ---
    let formats = &["text", "json"];
    let format = Select::new()
        .with_prompt("Log format")
        .items(formats)
        .default(0)
        .interact()
        .context("log format selection cancelled")?;

    let config = AppConfig {
        database: DatabaseConfig {
            path: PathBuf::from(database.trim()),
            ..defaults.database
        },
        migrations: MigrationsConfig {
            directory: PathBuf::from(directory.trim()),
            table,
            ..defaults.migrations
        },
        log: LogConfig {
            json: format == 1,
            ..defaults.log
        },
    };
    write_config(config_path, &config)?;

    println!();
    println!("  Config written to {}", config_path.display());
    println!("  Run `strata new <name>` to create your first migration.");
    println!();

    Ok(())
}

fn example_yaml() -> Result<String> {
    serde_yaml::to_string(&AppConfig::default()).context("failed to serialize example config")
}

fn write_config(config_path: &Path, config: &AppConfig) -> Result<()> {
    if let Err(e) = config.validate() {
        bail!("refusing to write invalid config: {e}");
    }
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("failed to create {}", parent.display()))?;
    }

    let yaml = serde_yaml::to_string(config).context("failed to serialize config")?;
    std::fs::write(config_path, &yaml)
        .context(format!("failed to write {}", config_path.display()))?;

    info!("config written to {}", config_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_config::ConfigLoader;

    #[test]
    fn written_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yml");

        let mut config = AppConfig::default();
        config.migrations.table = "schema_history".into();
        config.log.json = true;
        write_config(&path, &config).unwrap();

        assert_eq!(ConfigLoader::load_from(&path).unwrap(), config);
    }

    #[test]
    fn invalid_config_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");

        let mut config = AppConfig::default();
        config.migrations.table = "no spaces allowed".into();
        assert!(write_config(&path, &config).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn example_is_valid_yaml() {
        let yaml = example_yaml().unwrap();
        assert!(yaml.contains("_strata_migrations"));
    }
}
