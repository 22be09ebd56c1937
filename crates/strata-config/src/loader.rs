use std::path::{Path, PathBuf};

use strata_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const DEFAULT_FILE_NAME: &str = "config.yml";

/// Locates and parses the Strata config file.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Loader rooted at the platform config dir (`~/.config/strata` on Linux).
    pub fn new() -> Self {
        Self {
            config_dir: default_config_dir(),
        }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn default_path(&self) -> PathBuf {
        self.config_dir.join(DEFAULT_FILE_NAME)
    }

    /// Load the default config file, or defaults if it does not exist.
    pub fn load(&self) -> Result<AppConfig> {
        let path = self.default_path();
        if !path.exists() {
            debug!("no config at {}, using defaults", path.display());
            return Ok(AppConfig::default());
        }
        Self::load_from(&path)
    }

    /// Load an explicit config file. Unlike `load`, a missing file is an error.
    pub fn load_from(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = parse(&contents, ext)?;
        config.validate()?;

        info!("loaded config from {}", path.display());
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("strata")
}

fn parse(contents: &str, ext: &str) -> Result<AppConfig> {
    match ext {
        "yml" | "yaml" => {
            // An empty YAML document deserializes as null, not as an empty map.
            if contents.trim().is_empty() {
                return Ok(AppConfig::default());
            }
            serde_yaml::from_str(contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}")))
        }
        "toml" => {
            toml::from_str(contents).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
        }
        other => Err(Error::Config(format!(
            "unsupported config extension: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_with_partial_sections() {
        let yaml = "
database:
  path: /var/lib/app/app.db
migrations:
  table: schema_history
";
        let config = parse(yaml, "yml").unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/app/app.db"));
        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert_eq!(config.migrations.table, "schema_history");
        assert_eq!(config.migrations.directory, PathBuf::from("migrations"));
    }

    #[test]
    fn parses_toml() {
        let toml = r#"
[migrations]
directory = "db/migrations"
verify_checksums = false

[log]
level = "debug"
json = true
"#;
        let config = parse(toml, "toml").unwrap();
        assert_eq!(config.migrations.directory, PathBuf::from("db/migrations"));
        assert!(!config.migrations.verify_checksums);
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
    }

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(parse("", "yaml").unwrap(), AppConfig::default());
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let err = parse("{}", "json").unwrap_err();
        assert!(err.to_string().contains("unsupported config extension"));
    }

    #[test]
    fn missing_default_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::with_dir(dir.path());
        assert_eq!(loader.load().unwrap(), AppConfig::default());
    }

    #[test]
    fn load_from_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(&path, "[migrations]\ntable = \"bad name\"\n").unwrap();
        assert!(ConfigLoader::load_from(&path).is_err());
    }

    #[test]
    fn load_from_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ConfigLoader::load_from(&dir.path().join("nope.yml")).is_err());
    }
}
