//! Migration definitions: a version token plus a forward and an optional
//! inverse operation.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use ring::digest::{Context, SHA256};
use rusqlite::Transaction;
use serde::{Deserialize, Serialize};
use strata_common::{Error, MigrationError};

/// Sortable migration identifier. Usually a `YYYYMMDDHHMMSS` timestamp, but
/// any non-negative integer orders correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Largest version that still fits SQLite's signed 64-bit INTEGER.
    pub const MAX: Version = Version(i64::MAX as u64);

    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Timestamp token for `at`, e.g. `20240131093000`.
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        let date = u64::from(at.year().max(0) as u32) * 10_000 + u64::from(at.month() * 100 + at.day());
        let time = u64::from(at.hour() * 10_000 + at.minute() * 100 + at.second());
        Self(date * 1_000_000 + time)
    }

    pub(crate) fn to_sql(self) -> i64 {
        self.0 as i64
    }

    pub(crate) fn from_sql(raw: i64) -> Self {
        Self(raw as u64)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MigrationError::Source(format!("invalid version token: {s:?}")).into());
        }
        let raw: u64 = s
            .parse()
            .map_err(|e| MigrationError::Source(format!("invalid version token {s:?}: {e}")))?;
        let version = Version(raw);
        if version > Version::MAX {
            return Err(MigrationError::Source(format!("version {s} is out of range")).into());
        }
        Ok(version)
    }
}

/// Closure run inside the migration's transaction.
pub type MigrationFn = dyn Fn(&Transaction<'_>) -> rusqlite::Result<()> + Send + Sync;

/// One direction of a migration.
#[derive(Clone)]
pub enum Operation {
    /// A batch of SQL statements, executed with `execute_batch`.
    Sql(Cow<'static, str>),
    /// Arbitrary Rust code against the open transaction.
    Func(Arc<MigrationFn>),
}

impl Operation {
    pub(crate) fn run(&self, tx: &Transaction<'_>) -> rusqlite::Result<()> {
        match self {
            Operation::Sql(sql) => tx.execute_batch(sql),
            Operation::Func(f) => f(tx),
        }
    }

    fn checksum_input(&self) -> &[u8] {
        match self {
            Operation::Sql(sql) => sql.as_bytes(),
            Operation::Func(_) => b"<fn>",
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Sql(sql) => f.debug_tuple("Sql").field(sql).finish(),
            Operation::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// A versioned, paired forward/inverse change. Migrations without a `down`
/// operation are irreversible.
#[derive(Debug, Clone)]
pub struct Migration {
    version: Version,
    name: Cow<'static, str>,
    up: Operation,
    down: Option<Operation>,
}

impl Migration {
    /// Irreversible SQL migration; add an inverse with [`Migration::with_down_sql`].
    pub fn sql(
        version: impl Into<Version>,
        name: impl Into<Cow<'static, str>>,
        up: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
            up: Operation::Sql(up.into()),
            down: None,
        }
    }

    /// Irreversible migration backed by a closure.
    pub fn func<F>(version: impl Into<Version>, name: impl Into<Cow<'static, str>>, up: F) -> Self
    where
        F: Fn(&Transaction<'_>) -> rusqlite::Result<()> + Send + Sync + 'static,
    {
        Self {
            version: version.into(),
            name: name.into(),
            up: Operation::Func(Arc::new(up)),
            down: None,
        }
    }

    pub fn with_down_sql(mut self, down: impl Into<Cow<'static, str>>) -> Self {
        self.down = Some(Operation::Sql(down.into()));
        self
    }

    pub fn with_down<F>(mut self, down: F) -> Self
    where
        F: Fn(&Transaction<'_>) -> rusqlite::Result<()> + Send + Sync + 'static,
    {
        self.down = Some(Operation::Func(Arc::new(down)));
        self
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn up(&self) -> &Operation {
        &self.up
    }

    pub fn down(&self) -> Option<&Operation> {
        self.down.as_ref()
    }

    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }

    /// SHA-256 over version, name and forward operation, lowercase hex.
    ///
    /// The inverse is left out so a `down` can be added to an already applied
    /// migration without tripping verification.
    pub fn checksum(&self) -> String {
        let mut ctx = Context::new(&SHA256);
        ctx.update(&self.version.get().to_be_bytes());
        ctx.update(self.name.as_bytes());
        ctx.update(&[0]);
        ctx.update(self.up.checksum_input());
        ctx.finish()
            .as_ref()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn version_from_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 1, 31, 9, 30, 5).unwrap();
        assert_eq!(Version::from_timestamp(at), Version::new(20240131093005));
    }

    #[test]
    fn version_parses_digits_only() {
        assert_eq!("42".parse::<Version>().unwrap(), Version::new(42));
        assert_eq!(
            "20240101000000".parse::<Version>().unwrap().to_string(),
            "20240101000000"
        );
        assert!("".parse::<Version>().is_err());
        assert!("12a".parse::<Version>().is_err());
        assert!("-1".parse::<Version>().is_err());
        assert!("18446744073709551615".parse::<Version>().is_err());
    }

    #[test]
    fn versions_order_numerically() {
        assert!(Version::new(9) < Version::new(10));
        assert!(Version::new(20231231235959) < Version::new(20240101000000));
    }

    #[test]
    fn migrations_are_irreversible_by_default() {
        let m = Migration::sql(1u64, "create_a", "CREATE TABLE a (id INTEGER)");
        assert!(!m.is_reversible());
        assert!(m.down().is_none());

        let m = m.with_down_sql("DROP TABLE a");
        assert!(m.is_reversible());
    }

    #[test]
    fn checksum_tracks_forward_sql() {
        let a = Migration::sql(1u64, "create_a", "CREATE TABLE a (id INTEGER)");
        let same = Migration::sql(1u64, "create_a", "CREATE TABLE a (id INTEGER)")
            .with_down_sql("DROP TABLE a");
        let edited = Migration::sql(1u64, "create_a", "CREATE TABLE a (id TEXT)");

        assert_eq!(a.checksum(), same.checksum());
        assert_ne!(a.checksum(), edited.checksum());
        assert_eq!(a.checksum().len(), 64);
        assert!(a.checksum().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn func_checksum_is_stable() {
        let a = Migration::func(7u64, "seed", |_| Ok(()));
        let b = Migration::func(7u64, "seed", |tx| tx.execute_batch("SELECT 1"));
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn operation_debug_hides_closures() {
        let m = Migration::func(1u64, "seed", |_| Ok(()));
        assert_eq!(format!("{:?}", m.up()), "Func(..)");
    }
}
