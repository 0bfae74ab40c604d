//! Settings and provider selection for CLI commands

use anyhow::{Context, Result};
use pkgdb_config::{ConfigLoader, ProviderSettings, Settings};
use pkgdb_core::{CommandProvider, FixtureProvider, NoProvider, PackageProvider};
use std::path::PathBuf;
use std::sync::Arc;

/// Overrides taken from global CLI flags
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config_file: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub system: Option<String>,
}

/// Load settings: config file, then environment, then flags
pub fn load_settings(overrides: &Overrides) -> Result<Settings> {
    let mut loader = match &overrides.config_file {
        Some(path) => ConfigLoader::new().with_config_file(path),
        None => ConfigLoader::new(),
    };
    let mut settings = loader.load().context("Failed to load configuration")?;

    if let Some(dir) = &overrides.cache_dir {
        settings.cache_dir = dir.clone();
    }
    if let Some(system) = &overrides.system {
        settings.system = system.clone();
    }
    tracing::debug!(
        cache_dir = %settings.cache_dir.display(),
        system = %settings.system,
        config = ?loader.config_path(),
        "Loaded settings"
    );
    Ok(settings)
}

/// The package provider `settings` select
pub fn provider(settings: &Settings) -> Result<Arc<dyn PackageProvider>> {
    Ok(match &settings.provider {
        ProviderSettings::Unconfigured => Arc::new(NoProvider),
        ProviderSettings::Fixtures(path) => Arc::new(
            FixtureProvider::from_file(path)
                .with_context(|| format!("Failed to load fixtures from {}", path.display()))?,
        ),
        ProviderSettings::Command { program, args } => {
            Arc::new(CommandProvider::new(program.clone(), args.clone()))
        }
    })
}
