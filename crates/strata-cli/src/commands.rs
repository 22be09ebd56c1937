use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use strata_common::MigrationError;
use strata_config::AppConfig;
use strata_db::{Ledger, MigrationSet, Store, Version};
use tracing::{info, warn};

use crate::table;

/// How `strata down` picks what to revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertScope {
    Last(usize),
    To(Version),
    All,
}

/// Load the migration set before anything touches the database, so a bad
/// directory never leaves a half-initialized store behind.
fn load_set(config: &AppConfig) -> Result<MigrationSet> {
    strata_db::load_dir(&config.migrations.directory).context(format!(
        "failed to load migrations from {}",
        config.migrations.directory.display()
    ))
}

fn open_store(config: &AppConfig) -> Result<Store> {
    let ledger = Ledger::with_table(config.migrations.table.clone())?
        .verify_checksums(config.migrations.verify_checksums);
    let store = Store::open(&config.database.path)
        .context(format!("failed to open {}", config.database.path.display()))?
        .with_ledger(ledger);
    store.set_busy_timeout(Duration::from_millis(config.database.busy_timeout_ms))?;
    Ok(store)
}

pub fn status(config: &AppConfig, json: bool) -> Result<()> {
    let set = load_set(config)?;
    let store = open_store(config)?;

    let statuses = store.status(&set)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    println!("{}", table::render_status(&statuses, store.current_version()?));
    if let Some(lock) = store.lock_holder()? {
        println!(
            "ledger is locked by {} since {} (run `strata unlock` if that runner is gone)",
            lock.holder,
            lock.acquired_at.to_rfc3339()
        );
    }
    Ok(())
}

pub fn up(config: &AppConfig, to: Option<Version>) -> Result<()> {
    let set = load_set(config)?;
    let store = open_store(config)?;

    let report = match to {
        Some(target) => store.apply_to(&set, target),
        None => store.apply_pending(&set),
    }
    .context("migration run stopped")?;

    println!("{}", table::render_report(&report));
    Ok(())
}

pub fn down(config: &AppConfig, scope: RevertScope) -> Result<()> {
    let set = load_set(config)?;
    let store = open_store(config)?;

    let result = match scope {
        RevertScope::Last(n) => store.revert_last(&set, n),
        RevertScope::To(target) => store.revert_to(&set, Some(target)),
        RevertScope::All => store.revert_to(&set, None),
    };

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            if let Some(MigrationError::NothingToRevert { .. }) = e.as_migration() {
                warn!("{e}");
                println!("{e}; nothing reverted");
                return Ok(());
            }
            return Err(e).context("revert stopped");
        }
    };

    println!("{}", table::render_report(&report));
    Ok(())
}

pub fn new_migration(config: &AppConfig, name: &str) -> Result<()> {
    let (up, down) = strata_db::scaffold(&config.migrations.directory, name, Utc::now())?;
    println!("created {}", up.display());
    println!("created {}", down.display());
    Ok(())
}

pub fn unlock(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;
    if store.force_unlock()? {
        info!("removed ledger lock");
        println!("ledger lock removed");
    } else {
        println!("ledger was not locked");
    }
    Ok(())
}
