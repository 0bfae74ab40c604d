//! pkgdb Configuration System
//!
//! Provides user-level configuration for the package database tooling:
//! - Global user configuration (`<config dir>/pkgdb/config.toml`)
//! - Environment variable overrides (`PKGDB_*`)
//! - Resolved settings consumed by the resolver, lock coordinator and CLI
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/pkgdb/config.toml`)
//! 3. Environment variables (`PKGDB_*`, `_PKGDB_GA_REGISTRY_REF_OR_REV`)
//! 4. CLI flags (handled by the caller)
//!
//! # Example
//!
//! ```no_run
//! use pkgdb_config::ConfigLoader;
//!
//! let mut loader = ConfigLoader::new();
//! let settings = loader.load().unwrap();
//! println!("databases live in {}", settings.cache_dir.display());
//! ```

pub mod global;
pub mod loader;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use global::GlobalConfig;
pub use loader::{ConfigLoader, DbLockSettings, ProviderSettings, Settings};
