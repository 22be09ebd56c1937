use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// The typed ledger error, if this is one.
    pub fn as_migration(&self) -> Option<&MigrationError> {
        match self {
            Error::Migration(e) => Some(e),
            _ => None,
        }
    }
}

/// Ledger failures. Versions are carried as their raw `u64` token so this
/// crate stays free of the migration model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("migration {version} ({name}) failed: {reason}")]
    OperationFailed {
        version: u64,
        name: String,
        reason: String,
    },

    #[error("migration {version} is out of order with respect to {conflict}")]
    OutOfOrderApply { version: u64, conflict: u64 },

    #[error("duplicate migration version {version}: {first} and {second}")]
    DuplicateVersion {
        version: u64,
        first: String,
        second: String,
    },

    #[error("cannot revert {requested} migrations, only {applied} applied")]
    NothingToRevert { requested: usize, applied: usize },

    #[error("no migration with version {version}")]
    NotFound { version: u64 },

    #[error("applied migration {version} is not in the migration set")]
    UnknownVersion { version: u64 },

    #[error("migration {version} was modified after being applied (recorded {recorded}, found {found})")]
    ChecksumMismatch {
        version: u64,
        recorded: String,
        found: String,
    },

    #[error("migration {version} ({name}) has no down operation")]
    Irreversible { version: u64, name: String },

    #[error("ledger is locked by {holder} since {since}")]
    LockHeld { holder: String, since: String },

    #[error("migration source: {0}")]
    Source(String),
}

impl MigrationError {
    /// The version the error is about, when there is exactly one.
    pub fn version(&self) -> Option<u64> {
        match self {
            MigrationError::OperationFailed { version, .. }
            | MigrationError::OutOfOrderApply { version, .. }
            | MigrationError::DuplicateVersion { version, .. }
            | MigrationError::NotFound { version }
            | MigrationError::UnknownVersion { version }
            | MigrationError::ChecksumMismatch { version, .. }
            | MigrationError::Irreversible { version, .. } => Some(*version),
            MigrationError::NothingToRevert { .. }
            | MigrationError::LockHeld { .. }
            | MigrationError::Source(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, MigrationError};

    #[test]
    fn error_display_includes_context() {
        let e = Error::Config("bad yaml".into());
        assert_eq!(e.to_string(), "configuration error: bad yaml");

        let e = Error::Database("locked".into());
        assert_eq!(e.to_string(), "database error: locked");

        let e = Error::Other("misc".into());
        assert_eq!(e.to_string(), "misc");
    }

    #[test]
    fn migration_errors_name_the_version() {
        let e = MigrationError::OperationFailed {
            version: 20240101000000,
            name: "add_users".into(),
            reason: "no such table: users".into(),
        };
        assert_eq!(
            e.to_string(),
            "migration 20240101000000 (add_users) failed: no such table: users"
        );
        assert_eq!(e.version(), Some(20240101000000));

        let e = MigrationError::OutOfOrderApply {
            version: 2,
            conflict: 1,
        };
        assert_eq!(
            e.to_string(),
            "migration 2 is out of order with respect to 1"
        );
    }

    #[test]
    fn nothing_to_revert_has_no_single_version() {
        let e = MigrationError::NothingToRevert {
            requested: 3,
            applied: 1,
        };
        assert_eq!(e.version(), None);
        assert_eq!(
            e.to_string(),
            "cannot revert 3 migrations, only 1 applied"
        );
    }

    #[test]
    fn migration_error_converts_into_error() {
        let e: Error = MigrationError::Source("bad file".into()).into();
        assert!(matches!(
            e.as_migration(),
            Some(MigrationError::Source(msg)) if msg == "bad file"
        ));
        assert_eq!(e.to_string(), "migration error: migration source: bad file");
    }
}
