use strata_common::{MigrationError, Result};

use crate::migration::{Migration, Version};

/// Migrations sorted by version, with unique versions.
///
/// Validation happens here, before any store is touched.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    pub fn new(migrations: impl IntoIterator<Item = Migration>) -> Result<Self> {
        let mut migrations: Vec<Migration> = migrations.into_iter().collect();
        migrations.sort_by_key(Migration::version);

        for pair in migrations.windows(2) {
            if pair[0].version() == pair[1].version() {
                return Err(MigrationError::DuplicateVersion {
                    version: pair[0].version().get(),
                    first: pair[0].name().to_string(),
                    second: pair[1].name().to_string(),
                }
                .into());
            }
        }

        if let Some(last) = migrations.last() {
            if last.version() > Version::MAX {
                return Err(MigrationError::Source(format!(
                    "version {} of {} is out of range",
                    last.version(),
                    last.name()
                ))
                .into());
            }
        }

        Ok(Self { migrations })
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Migration> {
        self.migrations.iter()
    }

    pub fn get(&self, version: Version) -> Option<&Migration> {
        self.position(version).map(|i| &self.migrations[i])
    }

    pub fn contains(&self, version: Version) -> bool {
        self.position(version).is_some()
    }

    /// Migrations strictly before `version`, in ascending order.
    pub fn predecessors(&self, version: Version) -> &[Migration] {
        let end = self.migrations.partition_point(|m| m.version() < version);
        &self.migrations[..end]
    }

    pub fn latest(&self) -> Option<&Migration> {
        self.migrations.last()
    }

    fn position(&self, version: Version) -> Option<usize> {
        self.migrations
            .binary_search_by_key(&version, Migration::version)
            .ok()
    }
}

impl<'a> IntoIterator for &'a MigrationSet {
    type Item = &'a Migration;
    type IntoIter = std::slice::Iter<'a, Migration>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
