use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use strata_common::{Error, Result};
use tracing::info;

use crate::ledger::{AppliedMigration, Ledger, MigrationStatus, RunReport};
use crate::lock::LockInfo;
use crate::migration::Version;
use crate::set::MigrationSet;

/// A SQLite database together with the ledger that migrates it.
///
/// The mutex serializes runners inside one process; the ledger's advisory
/// lock serializes them across processes.
pub struct Store {
    conn: Mutex<Connection>,
    ledger: Ledger,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            ledger: Ledger::default(),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
            ledger: Ledger::default(),
        })
    }

    pub fn with_ledger(mut self, ledger: Ledger) -> Self {
        self.ledger = ledger;
        self
    }

    /// How long to wait on another connection's write lock before failing.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.connection()?
            .busy_timeout(timeout)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("store lock poisoned".into()))
    }

    /// Run `f` against the underlying connection, e.g. to query application tables.
    pub fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.connection()?;
        f(&mut conn)
    }

    pub fn apply_pending(&self, set: &MigrationSet) -> Result<RunReport> {
        let mut conn = self.connection()?;
        self.ledger.apply_pending(&mut conn, set)
    }

    pub fn apply_to(&self, set: &MigrationSet, target: Version) -> Result<RunReport> {
        let mut conn = self.connection()?;
        self.ledger.apply_to(&mut conn, set, target)
    }

    pub fn apply_one(&self, set: &MigrationSet, version: Version) -> Result<bool> {
        let mut conn = self.connection()?;
        self.ledger.apply_one(&mut conn, set, version)
    }

    pub fn revert_last(&self, set: &MigrationSet, n: usize) -> Result<RunReport> {
        let mut conn = self.connection()?;
        self.ledger.revert_last(&mut conn, set, n)
    }

    pub fn revert_to(&self, set: &MigrationSet, target: Option<Version>) -> Result<RunReport> {
        let mut conn = self.connection()?;
        self.ledger.revert_to(&mut conn, set, target)
    }

    pub fn applied(&self) -> Result<Vec<AppliedMigration>> {
        let conn = self.connection()?;
        self.ledger.applied(&conn)
    }

    pub fn current_version(&self) -> Result<Option<Version>> {
        let conn = self.connection()?;
        self.ledger.current_version(&conn)
    }

    pub fn status(&self, set: &MigrationSet) -> Result<Vec<MigrationStatus>> {
        let conn = self.connection()?;
        self.ledger.status(&conn, set)
    }

    pub fn verify(&self, set: &MigrationSet) -> Result<()> {
        let conn = self.connection()?;
        self.ledger.verify(&conn, set)
    }

    pub fn lock_holder(&self) -> Result<Option<LockInfo>> {
        let conn = self.connection()?;
        self.ledger.lock_holder(&conn)
    }

    pub fn force_unlock(&self) -> Result<bool> {
        let conn = self.connection()?;
        self.ledger.force_unlock(&conn)
    }
}
