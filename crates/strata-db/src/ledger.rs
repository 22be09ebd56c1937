//! The migration ledger: applies and reverts migrations against a SQLite
//! connection and records what has been applied in a ledger table.
//!
//! The ledger table is the only source of truth for the schema version.
//! Nothing is cached between calls; every operation re-reads it.

use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::Serialize;
use strata_common::{Error, MigrationError, Result, sql};
use tracing::{debug, info, warn};

use crate::lock::{AdvisoryLock, LockInfo};
use crate::migration::{Migration, Version};
use crate::parse_datetime;
use crate::set::MigrationSet;

pub const DEFAULT_TABLE: &str = "_strata_migrations";

/// A row of the ledger table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedMigration {
    pub version: Version,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub execution_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Applied,
    Pending,
    /// Recorded in the ledger but missing from the migration set.
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub version: Version,
    pub name: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
    pub reversible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub version: Version,
    pub name: String,
    pub execution_ms: i64,
}

/// What a single `apply_*` or `revert_*` call did, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub direction: Direction,
    pub steps: Vec<Step>,
}

impl RunReport {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            steps: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn versions(&self) -> Vec<Version> {
        self.steps.iter().map(|s| s.version).collect()
    }
}

/// Applies and reverts a [`MigrationSet`] against a connection.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
    lock: AdvisoryLock,
    verify_checksums: bool,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            lock: AdvisoryLock::new(format!("{DEFAULT_TABLE}_lock")),
            verify_checksums: true,
        }
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger stored in `table`; the lock lives in `<table>_lock`.
    pub fn with_table(table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !sql::is_identifier(&table) {
            return Err(Error::Config(format!("invalid ledger table name: {table:?}")));
        }
        Ok(Self {
            lock: AdvisoryLock::new(format!("{table}_lock")),
            table,
            verify_checksums: true,
        })
    }

    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn lock(&self) -> &AdvisoryLock {
        &self.lock
    }

    /// Create the ledger and lock tables if they do not exist yet.
    pub fn ensure_schema(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS [{}] (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                checksum TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                execution_ms INTEGER NOT NULL
            );",
            self.table
        ))
        .map_err(|e| Error::Database(format!("failed to create ledger table: {e}")))?;
        self.lock.ensure_table(conn)
    }

    /// Ledger rows in ascending version order. A store that has never been
    /// migrated has no rows.
    pub fn applied(&self, conn: &Connection) -> Result<Vec<AppliedMigration>> {
        if !self.table_exists(conn)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT version, name, checksum, applied_at, execution_ms
                 FROM [{}]
                 ORDER BY version ASC",
                self.table
            ))
            .map_err(|e| Error::Database(format!("failed to prepare ledger query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(AppliedMigration {
                    version: Version::from_sql(row.get(0)?),
                    name: row.get(1)?,
                    checksum: row.get(2)?,
                    applied_at: parse_datetime(3, &row.get::<_, String>(3)?)?,
                    execution_ms: row.get(4)?,
                })
            })
            .map_err(|e| Error::Database(format!("failed to query ledger: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to read ledger row: {e}")))
    }

    /// Highest applied version, read from the ledger table.
    pub fn current_version(&self, conn: &Connection) -> Result<Option<Version>> {
        if !self.table_exists(conn)? {
            return Ok(None);
        }
        let max: Option<i64> = conn
            .query_row(&format!("SELECT MAX(version) FROM [{}]", self.table), [], |row| {
                row.get(0)
            })
            .map_err(|e| Error::Database(format!("failed to read current version: {e}")))?;
        Ok(max.map(Version::from_sql))
    }

    /// Every migration in `set` plus any orphaned ledger rows, by version.
    pub fn status(&self, conn: &Connection, set: &MigrationSet) -> Result<Vec<MigrationStatus>> {
        let applied = self.applied(conn)?;
        let mut report: Vec<MigrationStatus> = set
            .iter()
            .map(|m| {
                let record = applied.iter().find(|a| a.version == m.version());
                MigrationStatus {
                    version: m.version(),
                    name: m.name().to_string(),
                    state: if record.is_some() {
                        MigrationState::Applied
                    } else {
                        MigrationState::Pending
                    },
                    applied_at: record.map(|a| a.applied_at),
                    reversible: m.is_reversible(),
                }
            })
            .collect();

        report.extend(
            applied
                .iter()
                .filter(|a| !set.contains(a.version))
                .map(|a| MigrationStatus {
                    version: a.version,
                    name: a.name.clone(),
                    state: MigrationState::Orphaned,
                    applied_at: Some(a.applied_at),
                    reversible: false,
                }),
        );
        report.sort_by_key(|s| s.version);
        Ok(report)
    }

    /// Check the ledger against `set` without changing anything.
    pub fn verify(&self, conn: &Connection, set: &MigrationSet) -> Result<()> {
        let applied = self.applied(conn)?;
        self.check_applied(set, &applied, true)
    }

    /// Apply every pending migration in ascending version order.
    pub fn apply_pending(&self, conn: &mut Connection, set: &MigrationSet) -> Result<RunReport> {
        self.apply_until(conn, set, None)
    }

    /// Apply pending migrations up to and including `target`.
    pub fn apply_to(
        &self,
        conn: &mut Connection,
        set: &MigrationSet,
        target: Version,
    ) -> Result<RunReport> {
        if !set.contains(target) {
            return Err(MigrationError::NotFound {
                version: target.get(),
            }
            .into());
        }
        self.apply_until(conn, set, Some(target))
    }

    /// Apply exactly one migration. Every migration before it in `set` must
    /// already be applied. Returns `false` if it was applied already.
    pub fn apply_one(
        &self,
        conn: &mut Connection,
        set: &MigrationSet,
        version: Version,
    ) -> Result<bool> {
        let migration = set.get(version).ok_or(MigrationError::NotFound {
            version: version.get(),
        })?;

        self.ensure_schema(conn)?;
        self.lock.with_lock(conn, |conn| {
            let applied = self.applied(conn)?;
            self.check_applied(set, &applied, true)?;

            let applied_versions: HashSet<Version> = applied.iter().map(|a| a.version).collect();
            if applied_versions.contains(&version) {
                debug!("migration {version} already applied");
                return Ok(false);
            }
            if let Some(missing) = set
                .predecessors(version)
                .iter()
                .find(|m| !applied_versions.contains(&m.version()))
            {
                return Err(MigrationError::OutOfOrderApply {
                    version: version.get(),
                    conflict: missing.version().get(),
                }
                .into());
            }

            self.run_up(conn, migration)?;
            Ok(true)
        })
    }

    /// Revert the `n` most recently applied migrations, newest first.
    ///
    /// Asking for more than are applied fails with `NothingToRevert` and
    /// changes nothing.
    pub fn revert_last(
        &self,
        conn: &mut Connection,
        set: &MigrationSet,
        n: usize,
    ) -> Result<RunReport> {
        self.ensure_schema(conn)?;
        self.lock.with_lock(conn, |conn| {
            let applied = self.applied(conn)?;
            if n > applied.len() {
                return Err(MigrationError::NothingToRevert {
                    requested: n,
                    applied: applied.len(),
                }
                .into());
            }
            let targets: Vec<Version> = applied.iter().rev().take(n).map(|a| a.version).collect();
            self.revert_versions(conn, set, &applied, &targets)
        })
    }

    /// Revert every applied migration newer than `target`. `None` reverts all.
    pub fn revert_to(
        &self,
        conn: &mut Connection,
        set: &MigrationSet,
        target: Option<Version>,
    ) -> Result<RunReport> {
        if let Some(target) = target {
            if !set.contains(target) {
                return Err(MigrationError::NotFound {
                    version: target.get(),
                }
                .into());
            }
        }

        self.ensure_schema(conn)?;
        self.lock.with_lock(conn, |conn| {
            let applied = self.applied(conn)?;
            let targets: Vec<Version> = applied
                .iter()
                .rev()
                .map(|a| a.version)
                .filter(|v| target.is_none_or(|t| *v > t))
                .collect();
            self.revert_versions(conn, set, &applied, &targets)
        })
    }

    pub fn lock_holder(&self, conn: &Connection) -> Result<Option<LockInfo>> {
        self.lock.holder(conn)
    }

    /// Clear a lock left behind by a crashed runner.
    pub fn force_unlock(&self, conn: &Connection) -> Result<bool> {
        let removed = self.lock.force_release(conn)?;
        if removed {
            warn!("ledger lock on {} forcibly released", self.table);
        }
        Ok(removed)
    }

    fn apply_until(
        &self,
        conn: &mut Connection,
        set: &MigrationSet,
        target: Option<Version>,
    ) -> Result<RunReport> {
        self.ensure_schema(conn)?;
        self.lock.with_lock(conn, |conn| {
            let applied = self.applied(conn)?;
            self.check_applied(set, &applied, true)?;

            let applied_versions: HashSet<Version> = applied.iter().map(|a| a.version).collect();
            let pending = set
                .iter()
                .filter(|m| !applied_versions.contains(&m.version()))
                .take_while(|m| target.is_none_or(|t| m.version() <= t));

            let mut report = RunReport::new(Direction::Up);
            for migration in pending {
                report.steps.push(self.run_up(conn, migration)?);
            }

            if report.is_empty() {
                info!("no pending migrations");
            } else {
                info!("applied {} migration(s)", report.len());
            }
            Ok(report)
        })
    }

    fn revert_versions(
        &self,
        conn: &mut Connection,
        set: &MigrationSet,
        applied: &[AppliedMigration],
        targets: &[Version],
    ) -> Result<RunReport> {
        // Gaps below the newest applied version are what a revert repairs,
        // so only identity and checksums are checked here.
        self.check_applied(set, applied, false)?;

        // Resolve everything up front so an irreversible migration stops the
        // run before anything is reverted.
        let mut migrations = Vec::with_capacity(targets.len());
        for &version in targets {
            let migration = set.get(version).ok_or(MigrationError::UnknownVersion {
                version: version.get(),
            })?;
            if !migration.is_reversible() {
                return Err(MigrationError::Irreversible {
                    version: version.get(),
                    name: migration.name().to_string(),
                }
                .into());
            }
            migrations.push(migration);
        }

        let mut report = RunReport::new(Direction::Down);
        for migration in migrations {
            report.steps.push(self.run_down(conn, migration)?);
        }

        if report.is_empty() {
            info!("nothing to revert");
        } else {
            info!("reverted {} migration(s)", report.len());
        }
        Ok(report)
    }

    /// Forward operation and ledger insert in one transaction.
    fn run_up(&self, conn: &mut Connection, migration: &Migration) -> Result<Step> {
        info!("applying migration {} ({})", migration.version(), migration.name());
        let started = Instant::now();

        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        migration
            .up()
            .run(&tx)
            .map_err(|e| operation_failed(migration, e))?;

        let execution_ms = elapsed_ms(started);
        tx.execute(
            &format!(
                "INSERT INTO [{}] (version, name, checksum, applied_at, execution_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                self.table
            ),
            params![
                migration.version().to_sql(),
                migration.name(),
                migration.checksum(),
                Utc::now().to_rfc3339(),
                execution_ms
            ],
        )
        .map_err(|e| Error::Database(format!("failed to record migration: {e}")))?;

        tx.commit()
            .map_err(|e| operation_failed(migration, e))?;

        debug!("migration {} applied in {execution_ms}ms", migration.version());
        Ok(Step {
            version: migration.version(),
            name: migration.name().to_string(),
            execution_ms,
        })
    }

    /// Inverse operation and ledger delete in one transaction.
    fn run_down(&self, conn: &mut Connection, migration: &Migration) -> Result<Step> {
        let down = migration.down().ok_or(MigrationError::Irreversible {
            version: migration.version().get(),
            name: migration.name().to_string(),
        })?;

        info!("reverting migration {} ({})", migration.version(), migration.name());
        let started = Instant::now();

        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        down.run(&tx).map_err(|e| operation_failed(migration, e))?;

        let removed = tx
            .execute(
                &format!("DELETE FROM [{}] WHERE version = ?1", self.table),
                params![migration.version().to_sql()],
            )
            .map_err(|e| Error::Database(format!("failed to remove ledger row: {e}")))?;
        if removed != 1 {
            return Err(Error::Database(format!(
                "ledger row for {} disappeared during revert",
                migration.version()
            )));
        }

        tx.commit()
            .map_err(|e| operation_failed(migration, e))?;

        let execution_ms = elapsed_ms(started);
        debug!("migration {} reverted in {execution_ms}ms", migration.version());
        Ok(Step {
            version: migration.version(),
            name: migration.name().to_string(),
            execution_ms,
        })
    }

    /// Ledger rows must name known migrations with unchanged checksums. With
    /// `check_order`, no unapplied migration may sort below the newest
    /// applied one, which keeps the applied set a prefix of `set`.
    fn check_applied(
        &self,
        set: &MigrationSet,
        applied: &[AppliedMigration],
        check_order: bool,
    ) -> Result<()> {
        for record in applied {
            let Some(migration) = set.get(record.version) else {
                return Err(MigrationError::UnknownVersion {
                    version: record.version.get(),
                }
                .into());
            };
            if self.verify_checksums {
                let found = migration.checksum();
                if found != record.checksum {
                    return Err(MigrationError::ChecksumMismatch {
                        version: record.version.get(),
                        recorded: record.checksum.clone(),
                        found,
                    }
                    .into());
                }
            }
        }

        if check_order {
            if let Some(newest) = applied.last() {
                let applied_versions: HashSet<Version> =
                    applied.iter().map(|a| a.version).collect();
                if let Some(gap) = set
                    .predecessors(newest.version)
                    .iter()
                    .find(|m| !applied_versions.contains(&m.version()))
                {
                    return Err(MigrationError::OutOfOrderApply {
                        version: gap.version().get(),
                        conflict: newest.version.get(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn table_exists(&self, conn: &Connection) -> Result<bool> {
        conn.query_row(
            "SELECT count(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
            params![self.table],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(format!("failed to check ledger table: {e}")))
    }
}

fn operation_failed(migration: &Migration, e: rusqlite::Error) -> Error {
    MigrationError::OperationFailed {
        version: migration.version().get(),
        name: migration.name().to_string(),
        reason: e.to_string(),
    }
    .into()
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
