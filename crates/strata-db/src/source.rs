//! Migrations stored as `<version>_<name>.up.sql` / `<version>_<name>.down.sql`
//! file pairs in one directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use strata_common::{Error, MigrationError, Result};
use tracing::{debug, info};

use crate::migration::{Migration, Version};
use crate::set::MigrationSet;

const FILE_PATTERN: &str = r"^(\d+)_([A-Za-z0-9_]+)\.(up|down)\.sql$";

#[derive(Default)]
struct FilePair {
    name: String,
    /// `(file name, sql)` for each direction.
    up: Option<(String, String)>,
    down: Option<(String, String)>,
}

/// Load every migration in `dir`. Files that do not match the naming scheme
/// are skipped.
pub fn load_dir(dir: &Path) -> Result<MigrationSet> {
    let pattern = file_pattern()?;
    let entries = std::fs::read_dir(dir).map_err(|e| {
        MigrationError::Source(format!(
            "cannot read migrations directory {}: {e}",
            dir.display()
        ))
    })?;

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut pairs: BTreeMap<Version, FilePair> = BTreeMap::new();
    for path in paths {
        let Some(file_name) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };
        let Some(caps) = pattern.captures(file_name) else {
            debug!("skipping {}", path.display());
            continue;
        };

        let version: Version = caps[1].parse()?;
        let name = &caps[2];
        let sql = std::fs::read_to_string(&path)
            .map_err(|e| Error::Other(format!("failed to read {}: {e}", path.display())))?;

        let pair = pairs.entry(version).or_insert_with(|| FilePair {
            name: name.to_string(),
            ..Default::default()
        });
        if pair.name != name {
            return Err(MigrationError::DuplicateVersion {
                version: version.get(),
                first: pair.name.clone(),
                second: name.to_string(),
            }
            .into());
        }
        let slot = match &caps[3] {
            "up" => &mut pair.up,
            _ => &mut pair.down,
        };
        // `1_seed.up.sql` and `01_seed.up.sql` carry the same version.
        if let Some((first, _)) = slot {
            return Err(MigrationError::DuplicateVersion {
                version: version.get(),
                first: first.clone(),
                second: file_name.to_string(),
            }
            .into());
        }
        *slot = Some((file_name.to_string(), sql));
    }

    let mut migrations = Vec::with_capacity(pairs.len());
    for (version, pair) in pairs {
        let Some((_, up)) = pair.up else {
            return Err(MigrationError::Source(format!(
                "{version}_{}.down.sql has no matching .up.sql",
                pair.name
            ))
            .into());
        };
        let mut migration = Migration::sql(version, pair.name, up);
        if let Some((_, down)) = pair.down {
            migration = migration.with_down_sql(down);
        }
        migrations.push(migration);
    }

    info!(
        "loaded {} migration(s) from {}",
        migrations.len(),
        dir.display()
    );
    MigrationSet::new(migrations)
}

/// Create an empty up/down pair for a new migration stamped with `now`.
/// Returns the paths of the up and down files.
pub fn scaffold(dir: &Path, name: &str, now: DateTime<Utc>) -> Result<(PathBuf, PathBuf)> {
    let name = normalize_name(name);
    if name.is_empty() {
        return Err(MigrationError::Source("migration name cannot be empty".into()).into());
    }

    std::fs::create_dir_all(dir)?;
    let version = Version::from_timestamp(now);

    let prefix = format!("{version}_");
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            return Err(MigrationError::Source(format!(
                "version {version} is already used in {}",
                dir.display()
            ))
            .into());
        }
    }

    let up = dir.join(format!("{version}_{name}.up.sql"));
    let down = dir.join(format!("{version}_{name}.down.sql"));
    std::fs::write(&up, format!("-- {name}: forward change\n"))?;
    std::fs::write(&down, format!("-- {name}: inverse of {version}_{name}.up.sql\n"))?;

    info!("created migration {version}_{name} in {}", dir.display());
    Ok((up, down))
}

/// Lower snake case; anything outside `[a-z0-9]` becomes a single `_`.
fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

fn file_pattern() -> Result<Regex> {
    Regex::new(FILE_PATTERN).map_err(|e| Error::Other(format!("bad migration file pattern: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn write(dir: &Path, file: &str, sql: &str) {
        std::fs::write(dir.join(file), sql).unwrap();
    }

    #[test]
    fn pairs_up_and_down_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "2_add_b.up.sql", "CREATE TABLE b (id INTEGER);");
        write(dir.path(), "1_add_a.up.sql", "CREATE TABLE a (id INTEGER);");
        write(dir.path(), "1_add_a.down.sql", "DROP TABLE a;");
        write(dir.path(), "README.md", "not a migration");

        let set = load_dir(dir.path()).unwrap();
        assert_eq!(set.len(), 2);

        let a = set.get(Version::new(1)).unwrap();
        assert_eq!(a.name(), "add_a");
        assert!(a.is_reversible());

        let b = set.get(Version::new(2)).unwrap();
        assert_eq!(b.name(), "add_b");
        assert!(!b.is_reversible());
    }

    #[test]
    fn down_without_up_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "1_add_a.down.sql", "DROP TABLE a;");
        let err = load_dir(dir.path()).unwrap_err();
        assert!(matches!(err.as_migration(), Some(MigrationError::Source(_))));
    }

    #[test]
    fn same_version_with_two_names_is_a_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "1_add_a.up.sql", "SELECT 1;");
        write(dir.path(), "1_add_z.up.sql", "SELECT 2;");
        let err = load_dir(dir.path()).unwrap_err();
        assert!(matches!(
            err.as_migration(),
            Some(MigrationError::DuplicateVersion { version: 1, .. })
        ));
    }

    #[test]
    fn zero_padded_version_is_a_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "1_seed.up.sql", "CREATE TABLE one (id INTEGER);");
        write(dir.path(), "01_seed.up.sql", "CREATE TABLE zero_one (id INTEGER);");
        let err = load_dir(dir.path()).unwrap_err();
        match err.as_migration() {
            Some(MigrationError::DuplicateVersion { version, first, second }) => {
                assert_eq!(*version, 1);
                assert_eq!(first, "01_seed.up.sql");
                assert_eq!(second, "1_seed.up.sql");
            }
            other => panic!("expected DuplicateVersion, got {other:?}"),
        }
    }

    #[test]
    fn missing_directory_is_a_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_dir(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err.as_migration(), Some(MigrationError::Source(_))));
    }

    #[test]
    fn scaffold_creates_timestamped_pair() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();

        let (up, down) = scaffold(dir.path(), "Add Settings-Row", now).unwrap();
        assert_eq!(
            up.file_name().unwrap(),
            "20240305140709_add_settings_row.up.sql"
        );
        assert_eq!(
            down.file_name().unwrap(),
            "20240305140709_add_settings_row.down.sql"
        );

        let set = load_dir(dir.path()).unwrap();
        let m = set.get(Version::new(20240305140709)).unwrap();
        assert_eq!(m.name(), "add_settings_row");
        assert!(m.is_reversible());
    }

    #[test]
    fn scaffold_refuses_a_used_version() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        scaffold(dir.path(), "first", now).unwrap();
        assert!(scaffold(dir.path(), "second", now).is_err());
    }

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize_name("Add  Users!"), "add_users");
        assert_eq!(normalize_name("__x__"), "x");
        assert_eq!(normalize_name("---"), "");
    }
}
