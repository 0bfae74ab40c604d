//! Global Configuration (`<config dir>/pkgdb/config.toml`)
//!
//! Handles user-level configuration. Every section is optional; missing
//! values fall back to the defaults in [`crate::loader`].

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global user configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Package database cache
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,

    /// Timings of the database lock protocol
    #[serde(rename = "db-lock", skip_serializing_if = "Option::is_none")]
    pub db_lock: Option<DbLockConfig>,

    /// Upstream package data provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,

    /// Default settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaults: Option<DefaultsConfig>,
}

/// Package database cache settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Directory holding one database per locked input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Database lock timings, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DbLockConfig {
    /// How often the holder refreshes the lock file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub touch_interval_ms: Option<u64>,

    /// Age after which an untouched lock is considered abandoned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_update_age_ms: Option<u64>,

    /// How often waiters poll the lock file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,

    /// Attempts for transient lock file operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// Package data provider settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// JSON fixture file describing package sources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixtures: Option<PathBuf>,

    /// External evaluator program
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Extra arguments passed before the evaluator subcommand
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Default settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DefaultsConfig {
    /// System to resolve for when a manifest declares none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Revision of the hard-coded default registry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ga_registry_ref: Option<String>,
}

impl GlobalConfig {
    /// Load global configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the global configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(lock) = &self.db_lock {
            if lock.touch_interval_ms == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "db-lock.touch-interval-ms".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
            if lock.poll_interval_ms == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "db-lock.poll-interval-ms".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
            if lock.max_attempts == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: "db-lock.max-attempts".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }

        if let Some(provider) = &self.provider {
            if provider.fixtures.is_some() && provider.command.is_some() {
                return Err(ConfigError::ValidationError(
                    "provider.fixtures and provider.command are mutually exclusive".to_string(),
                ));
            }
        }

        if let Some(system) = self.defaults.as_ref().and_then(|d| d.system.as_ref()) {
            validate_system("defaults.system", system)?;
        }

        Ok(())
    }

    /// Path of the global configuration file
    pub fn global_config_path() -> ConfigResult<PathBuf> {
        Ok(crate::ConfigLoader::global_config_dir()?.join("config.toml"))
    }
}

/// Systems are `<arch>-<os>` pairs such as `x86_64-linux`.
pub(crate) fn validate_system(field: &str, system: &str) -> ConfigResult<()> {
    match system.split_once('-') {
        Some((arch, os)) if !arch.is_empty() && !os.is_empty() && !os.contains('-') => Ok(()),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("'{}' is not of the form <arch>-<os>", system),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_parse_full_config() {
        let content = r#"
[cache]
dir = "/var/cache/pkgdb"

[db-lock]
touch-interval-ms = 250
max-update-age-ms = 3000
poll-interval-ms = 50
max-attempts = 3

[provider]
command = "pkgdb-eval"
args = ["--offline"]

[defaults]
system = "aarch64-darwin"
ga-registry-ref = "release-24.05"
"#;
        let config: GlobalConfig = toml::from_str(content).unwrap();
        config.validate().unwrap();

        assert_eq!(
            config.cache.unwrap().dir,
            Some(PathBuf::from("/var/cache/pkgdb"))
        );
        let lock = config.db_lock.unwrap();
        assert_eq!(lock.touch_interval_ms, Some(250));
        assert_eq!(lock.max_attempts, Some(3));
        let provider = config.provider.unwrap();
        assert_eq!(provider.command.as_deref(), Some("pkgdb-eval"));
        assert_eq!(provider.args, vec!["--offline".to_string()]);
        assert_eq!(
            config.defaults.unwrap().ga_registry_ref.as_deref(),
            Some("release-24.05")
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<GlobalConfig, _> = toml::from_str("[cache]\nlocation = \"/tmp\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_provider_sources_are_exclusive() {
        let config = GlobalConfig {
            provider: Some(ProviderConfig {
                fixtures: Some(PathBuf::from("fixtures.json")),
                command: Some("pkgdb-eval".to_string()),
                args: Vec::new(),
            }),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_zero_touch_interval_rejected() {
        let config = GlobalConfig {
            db_lock: Some(DbLockConfig {
                touch_interval_ms: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_load_from_missing_file() {
        let result = GlobalConfig::load_from_file(Path::new("/nonexistent/pkgdb/config.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_from_file_with_bad_system() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[defaults]\nsystem = \"linux\"").unwrap();

        let result = GlobalConfig::load_from_file(file.path());
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
