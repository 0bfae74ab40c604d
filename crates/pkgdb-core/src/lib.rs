//! Package database and environment resolver
//!
//! Resolves package descriptors against versioned package-source registries,
//! produces reproducible lockfiles, and answers ranked search queries over
//! per-input SQLite package databases whose creation is coordinated across
//! processes through a filesystem lock.

pub mod db;
pub mod lockfile;
pub mod manifest;
pub mod provider;
pub mod query;
pub mod registry;
pub mod resolver;
pub mod search;
pub mod types;
pub mod validator;
pub mod versions;

pub use db::lock::{DbLock, DbLockError};
pub use db::{PkgDb, PkgDbInput};
pub use lockfile::{LockedPackage, Lockfile, PackageInfo};
pub use manifest::{Descriptor, GlobalManifest, Manifest, Options, RegistrySource};
pub use provider::{CommandProvider, FixtureProvider, NoProvider, PackageProvider, PackageRecord};
pub use query::{PkgQuery, PkgQueryArgs, QueryError};
pub use registry::{LockedInput, Registry, RegistryInput, SourceLocator};
pub use resolver::{Environment, ResolutionFailure, Upgrades};
pub use search::{Search, SearchParams, SearchQuery, SearchResult};
pub use types::{Subtree, SUPPORTED_SYSTEMS};
pub use validator::{ValidationError, Validator};

/// Package database errors
#[derive(Debug, thiserror::Error)]
pub enum PkgdbError {
    #[error("Invalid registry: {0}")]
    InvalidRegistry(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid lockfile: {0}")]
    InvalidLockfile(String),

    #[error("{}", .0.report())]
    ResolutionFailure(#[from] ResolutionFailure),

    #[error(transparent)]
    DbLock(#[from] DbLockError),

    #[error("Invalid query: {0}")]
    QueryCompile(#[from] QueryError),

    #[error("Invalid search parameters: {0}")]
    InvalidSearchParams(String),

    #[error("Package provider failed: {0}")]
    Provider(String),

    #[error("Invalid package database {}: {reason}", .path.display())]
    InvalidDatabase {
        path: std::path::PathBuf,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

impl PkgdbError {
    /// Whether this error is a violated lock protocol invariant
    pub fn is_db_lock_inconsistency(&self) -> bool {
        matches!(self, PkgdbError::DbLock(DbLockError::Inconsistency { .. }))
    }
}

pub type Result<T> = std::result::Result<T, PkgdbError>;
