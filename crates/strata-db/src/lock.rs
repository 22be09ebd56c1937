use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use strata_common::{Error, MigrationError, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::parse_datetime;

/// Current owner of the ledger lock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockInfo {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// Store-level advisory lock: a single-row table that at most one runner can
/// occupy. The row is inserted inside an `IMMEDIATE` transaction, which takes
/// SQLite's write lock, so two processes cannot both see it empty.
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    table: String,
}

impl AdvisoryLock {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn ensure_table(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS [{}] (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            );",
            self.table
        ))
        .map_err(|e| Error::Database(format!("failed to create lock table: {e}")))
    }

    /// Take the lock or fail with `LockHeld`. Never waits on another holder.
    pub fn acquire(&self, conn: &mut Connection) -> Result<String> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Database(format!("failed to begin lock transaction: {e}")))?;

        if let Some(current) = read_holder(&tx, &self.table)? {
            return Err(MigrationError::LockHeld {
                holder: current.holder,
                since: current.acquired_at.to_rfc3339(),
            }
            .into());
        }

        let holder = Uuid::new_v4().to_string();
        tx.execute(
            &format!(
                "INSERT INTO [{}] (id, holder, acquired_at) VALUES (1, ?1, ?2)",
                self.table
            ),
            params![holder, Utc::now().to_rfc3339()],
        )
        .map_err(|e| Error::Database(format!("failed to record lock holder: {e}")))?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit lock: {e}")))?;

        debug!("ledger lock acquired by {holder}");
        Ok(holder)
    }

    /// Release a lock taken by `holder`. Releasing someone else's lock is a no-op.
    pub fn release(&self, conn: &Connection, holder: &str) -> Result<()> {
        let removed = conn
            .execute(
                &format!("DELETE FROM [{}] WHERE id = 1 AND holder = ?1", self.table),
                params![holder],
            )
            .map_err(|e| Error::Database(format!("failed to release lock: {e}")))?;

        if removed == 0 {
            warn!("ledger lock held by {holder} was already gone on release");
        } else {
            debug!("ledger lock released by {holder}");
        }
        Ok(())
    }

    /// Remove whatever lock row exists. Returns whether one was removed.
    pub fn force_release(&self, conn: &Connection) -> Result<bool> {
        let removed = conn
            .execute(&format!("DELETE FROM [{}] WHERE id = 1", self.table), [])
            .map_err(|e| Error::Database(format!("failed to force-release lock: {e}")))?;
        Ok(removed > 0)
    }

    pub fn holder(&self, conn: &Connection) -> Result<Option<LockInfo>> {
        read_holder(conn, &self.table)
    }

    /// Run `f` while holding the lock. The lock is released whether `f`
    /// succeeds, fails or panics; `f`'s error wins over a release error.
    /// A process that dies while holding the lock leaves the row behind;
    /// [`AdvisoryLock::force_release`] clears it.
    pub fn with_lock<T>(
        &self,
        conn: &mut Connection,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let holder = self.acquire(conn)?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut *conn)));
        let released = self.release(conn, &holder);

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => {
                if let Err(e) = released {
                    warn!("failed to release ledger lock after panic: {e}");
                }
                panic::resume_unwind(payload);
            }
        };

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!("failed to release ledger lock after error: {release_err}");
                Err(e)
            }
        }
    }
}

fn read_holder(conn: &Connection, table: &str) -> Result<Option<LockInfo>> {
    let exists: bool = conn
        .query_row(
            "SELECT count(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
            params![table],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(format!("failed to check lock table: {e}")))?;
    if !exists {
        return Ok(None);
    }

    conn.query_row(
        &format!("SELECT holder, acquired_at FROM [{table}] WHERE id = 1"),
        [],
        |row| {
            Ok(LockInfo {
                holder: row.get(0)?,
                acquired_at: parse_datetime(1, &row.get::<_, String>(1)?)?,
            })
        },
    )
    .optional()
    .map_err(|e| Error::Database(format!("failed to read lock holder: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Connection, AdvisoryLock) {
        let conn = Connection::open_in_memory().unwrap();
        let lock = AdvisoryLock::new("_strata_migrations_lock");
        lock.ensure_table(&conn).unwrap();
        (conn, lock)
    }

    #[test]
    fn acquire_then_release() {
        let (mut conn, lock) = setup();
        assert!(lock.holder(&conn).unwrap().is_none());

        let holder = lock.acquire(&mut conn).unwrap();
        assert_eq!(lock.holder(&conn).unwrap().unwrap().holder, holder);

        lock.release(&conn, &holder).unwrap();
        assert!(lock.holder(&conn).unwrap().is_none());
    }

    #[test]
    fn second_acquire_reports_holder() {
        let (mut conn, lock) = setup();
        let holder = lock.acquire(&mut conn).unwrap();

        let err = lock.acquire(&mut conn).unwrap_err();
        match err.as_migration() {
            Some(MigrationError::LockHeld { holder: h, .. }) => assert_eq!(h, &holder),
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[test]
    fn release_by_stranger_keeps_lock() {
        let (mut conn, lock) = setup();
        let holder = lock.acquire(&mut conn).unwrap();
        lock.release(&conn, "someone-else").unwrap();
        assert_eq!(lock.holder(&conn).unwrap().unwrap().holder, holder);
    }

    #[test]
    fn with_lock_releases_on_error() {
        let (mut conn, lock) = setup();
        let result: Result<()> = lock.with_lock(&mut conn, |_| Err(Error::Other("boom".into())));
        assert!(result.is_err());
        assert!(lock.holder(&conn).unwrap().is_none());

        let value = lock.with_lock(&mut conn, |_| Ok(7)).unwrap();
        assert_eq!(value, 7);
        assert!(lock.holder(&conn).unwrap().is_none());
    }

    #[test]
    fn with_lock_releases_on_panic() {
        let (mut conn, lock) = setup();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<()> = lock.with_lock(&mut conn, |_| panic!("closure blew up"));
        }));
        assert!(outcome.is_err());
        assert!(lock.holder(&conn).unwrap().is_none());
    }

    #[test]
    fn unreadable_acquired_at_is_an_error() {
        let (conn, lock) = setup();
        conn.execute(
            "INSERT INTO _strata_migrations_lock (id, holder, acquired_at) VALUES (1, 'x', 'soon')",
            [],
        )
        .unwrap();
        assert!(matches!(lock.holder(&conn), Err(Error::Database(_))));
    }

    #[test]
    fn force_release_clears_stale_lock() {
        let (mut conn, lock) = setup();
        lock.acquire(&mut conn).unwrap();
        assert!(lock.force_release(&conn).unwrap());
        assert!(!lock.force_release(&conn).unwrap());
    }

    #[test]
    fn holder_is_none_without_table() {
        let conn = Connection::open_in_memory().unwrap();
        let lock = AdvisoryLock::new("missing_lock");
        assert!(lock.holder(&conn).unwrap().is_none());
    }
}
