//! Configuration Loader
//!
//! Resolves the global configuration file, environment overrides and
//! built-in defaults into a single [`Settings`] value.

use crate::global::{validate_system, GlobalConfig};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default revision of the hard-coded default registry
pub const DEFAULT_GA_REGISTRY_REF: &str = "release-23.05";

/// Default interval between lock file touches
pub const DEFAULT_TOUCH_INTERVAL: Duration = Duration::from_millis(500);

/// Default age after which an untouched lock is abandoned
pub const DEFAULT_MAX_UPDATE_AGE: Duration = Duration::from_secs(5);

/// Default waiter polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default attempts for transient lock file operations
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Configuration loader
///
/// Loads configuration with the following precedence:
/// 1. Built-in defaults - lowest priority
/// 2. Global config (`<config dir>/pkgdb/config.toml`)
/// 3. Environment variables - overrides the file
/// 4. CLI flags - highest priority (handled by caller)
pub struct ConfigLoader {
    /// Explicit config file, bypassing the global lookup
    config_path: Option<PathBuf>,
}

/// Fully resolved settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Directory holding package databases
    pub cache_dir: PathBuf,
    /// System resolved for when nothing else is declared
    pub system: String,
    /// Revision of the hard-coded default registry
    pub ga_registry_ref: String,
    /// Lock protocol timings
    pub db_lock: DbLockSettings,
    /// Upstream package data provider
    pub provider: ProviderSettings,
}

/// Lock protocol timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbLockSettings {
    pub touch_interval: Duration,
    pub max_update_age: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for DbLockSettings {
    fn default() -> Self {
        Self {
            touch_interval: DEFAULT_TOUCH_INTERVAL,
            max_update_age: DEFAULT_MAX_UPDATE_AGE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Where package records come from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProviderSettings {
    /// Nothing configured; only already populated databases can be used
    #[default]
    Unconfigured,
    /// JSON fixture file
    Fixtures(PathBuf),
    /// External evaluator program
    Command { program: String, args: Vec<String> },
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Read configuration from `path` instead of the global location
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Load and resolve configuration
    pub fn load(&mut self) -> ConfigResult<Settings> {
        let global = match &self.config_path {
            Some(path) => GlobalConfig::load_from_file(path)?,
            None => self.load_global_config()?,
        };
        let settings = Self::resolve(global)?;
        let settings = self.apply_env_overrides(settings)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load global configuration; a missing file yields the defaults
    fn load_global_config(&mut self) -> ConfigResult<GlobalConfig> {
        let path = match GlobalConfig::global_config_path() {
            Ok(path) => path,
            Err(ConfigError::HomeNotFound) => return Ok(GlobalConfig::default()),
            Err(e) => return Err(e),
        };

        if !path.exists() {
            return Ok(GlobalConfig::default());
        }

        let config = GlobalConfig::load_from_file(&path)?;
        self.config_path = Some(path);
        Ok(config)
    }

    /// Fill unset values of a parsed file with defaults
    pub fn resolve(global: GlobalConfig) -> ConfigResult<Settings> {
        let cache_dir = match global.cache.and_then(|c| c.dir) {
            Some(dir) => dir,
            None => Self::default_cache_dir()?,
        };

        let defaults = global.defaults.unwrap_or_default();
        let lock = global.db_lock.unwrap_or_default();
        let ms = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        let db_lock = DbLockSettings {
            touch_interval: ms(lock.touch_interval_ms, DEFAULT_TOUCH_INTERVAL),
            max_update_age: ms(lock.max_update_age_ms, DEFAULT_MAX_UPDATE_AGE),
            poll_interval: ms(lock.poll_interval_ms, DEFAULT_POLL_INTERVAL),
            max_attempts: lock.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        };

        let provider = match global.provider {
            Some(p) => match (p.fixtures, p.command) {
                (Some(path), _) => ProviderSettings::Fixtures(path),
                (None, Some(program)) => ProviderSettings::Command {
                    program,
                    args: p.args,
                },
                (None, None) => ProviderSettings::Unconfigured,
            },
            None => ProviderSettings::Unconfigured,
        };

        Ok(Settings {
            cache_dir,
            system: defaults.system.unwrap_or_else(current_system),
            ga_registry_ref: defaults
                .ga_registry_ref
                .unwrap_or_else(|| DEFAULT_GA_REGISTRY_REF.to_string()),
            db_lock,
            provider,
        })
    }

    /// Apply environment variable overrides
    ///
    /// - `PKGDB_CACHEDIR`: database directory
    /// - `PKGDB_SYSTEM`: default system
    /// - `PKGDB_FIXTURES`: fixture provider file
    /// - `PKGDB_PROVIDER_COMMAND`: evaluator program
    /// - `_PKGDB_GA_REGISTRY_REF_OR_REV`: default registry revision
    fn apply_env_overrides(&self, mut settings: Settings) -> ConfigResult<Settings> {
        if let Some(dir) = non_empty_var("PKGDB_CACHEDIR") {
            settings.cache_dir = PathBuf::from(dir);
        }

        if let Some(system) = non_empty_var("PKGDB_SYSTEM") {
            validate_system("PKGDB_SYSTEM", &system)?;
            settings.system = system;
        }

        if let Some(fixtures) = non_empty_var("PKGDB_FIXTURES") {
            settings.provider = ProviderSettings::Fixtures(PathBuf::from(fixtures));
        } else if let Some(program) = non_empty_var("PKGDB_PROVIDER_COMMAND") {
            settings.provider = ProviderSettings::Command {
                program,
                args: Vec::new(),
            };
        }

        if let Some(reference) = non_empty_var("_PKGDB_GA_REGISTRY_REF_OR_REV") {
            settings.ga_registry_ref = reference;
        }

        Ok(settings)
    }

    /// Path of the file the settings were read from, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Get the global configuration directory (`<config dir>/pkgdb`)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let dir = dirs::config_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(dir.join("pkgdb"))
    }

    /// Get the default database directory (`<cache dir>/pkgdb`)
    pub fn default_cache_dir() -> ConfigResult<PathBuf> {
        let dir = dirs::cache_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(dir.join("pkgdb"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Settings {
    /// Validate cross-field constraints
    pub fn validate(&self) -> ConfigResult<()> {
        if self.db_lock.max_update_age <= self.db_lock.touch_interval {
            return Err(ConfigError::InvalidValue {
                field: "db-lock.max-update-age-ms".to_string(),
                reason: format!(
                    "must exceed the touch interval ({}ms)",
                    self.db_lock.touch_interval.as_millis()
                ),
            });
        }
        Ok(())
    }
}

/// The system this binary was built for, in `<arch>-<os>` form
pub fn current_system() -> String {
    let os = match env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    format!("{}-{}", env::consts::ARCH, os)
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::{CacheConfig, DbLockConfig, DefaultsConfig};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolve_defaults() {
        let settings = ConfigLoader::resolve(GlobalConfig {
            cache: Some(CacheConfig {
                dir: Some(PathBuf::from("/tmp/pkgdb")),
            }),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(settings.cache_dir, PathBuf::from("/tmp/pkgdb"));
        assert_eq!(settings.ga_registry_ref, DEFAULT_GA_REGISTRY_REF);
        assert_eq!(settings.db_lock, DbLockSettings::default());
        assert_eq!(settings.provider, ProviderSettings::Unconfigured);
        assert_eq!(settings.system, current_system());
    }

    #[test]
    fn test_resolve_lock_timings() {
        let settings = ConfigLoader::resolve(GlobalConfig {
            cache: Some(CacheConfig {
                dir: Some(PathBuf::from("/tmp/pkgdb")),
            }),
            db_lock: Some(DbLockConfig {
                touch_interval_ms: Some(20),
                max_update_age_ms: Some(200),
                ..Default::default()
            }),
            defaults: Some(DefaultsConfig {
                system: Some("x86_64-linux".to_string()),
                ga_registry_ref: None,
            }),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(settings.db_lock.touch_interval, Duration::from_millis(20));
        assert_eq!(settings.db_lock.max_update_age, Duration::from_millis(200));
        assert_eq!(settings.db_lock.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(settings.system, "x86_64-linux");
        settings.validate().unwrap();
    }

    #[test]
    fn test_stale_threshold_must_exceed_touch_interval() {
        let mut settings = ConfigLoader::resolve(GlobalConfig {
            cache: Some(CacheConfig {
                dir: Some(PathBuf::from("/tmp/pkgdb")),
            }),
            ..Default::default()
        })
        .unwrap();
        settings.db_lock.max_update_age = settings.db_lock.touch_interval;

        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_current_system_shape() {
        let system = current_system();
        assert!(system.contains('-'));
        assert!(!system.ends_with("macos"));
    }
}
