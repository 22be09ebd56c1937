use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strata_common::{Error, Result, sql};

/// Top-level configuration. Every section falls back to its defaults, so an
/// empty file is a valid config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file holding both the application schema and the ledger.
    pub path: PathBuf,
    /// How long a connection waits on a locked database before giving up.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("strata.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    /// Directory of `<version>_<name>.up.sql` / `.down.sql` files.
    pub directory: PathBuf,
    /// Ledger table name. The lock table is `<table>_lock`.
    pub table: String,
    pub verify_checksums: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("migrations"),
            table: "_strata_migrations".to_string(),
            verify_checksums: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Reject values that would be unsafe or meaningless at runtime.
    pub fn validate(&self) -> Result<()> {
        if !sql::is_identifier(&self.migrations.table) {
            return Err(Error::Config(format!(
                "invalid ledger table name: {:?}",
                self.migrations.table
            )));
        }
        if self.database.path.as_os_str().is_empty() {
            return Err(Error::Config("database.path cannot be empty".into()));
        }
        Ok(())
    }
}
