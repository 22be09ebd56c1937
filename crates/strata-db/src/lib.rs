pub mod ledger;
pub mod lock;
pub mod migration;
pub mod set;
pub mod source;
pub mod store;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;

pub use ledger::{
    AppliedMigration, DEFAULT_TABLE, Direction, Ledger, MigrationState, MigrationStatus,
    RunReport, Step,
};
pub use lock::{AdvisoryLock, LockInfo};
pub use migration::{Migration, MigrationFn, Operation, Version};
pub use set::MigrationSet;
pub use source::{load_dir, scaffold};
pub use store::Store;

/// Ledger timestamps are written as RFC 3339; rows written by hand with
/// `datetime('now')` use SQLite's own format. Anything else is a conversion
/// error on column `idx`.
pub(crate) fn parse_datetime(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
