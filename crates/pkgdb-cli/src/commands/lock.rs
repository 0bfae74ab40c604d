//! Lock command (pkgdb lock)

use super::inline_or_file;
use crate::config::{self, Overrides};
use anyhow::{Context, Result};
use pkgdb_core::manifest::ManifestRaw;
use pkgdb_core::{Environment, GlobalManifest, Lockfile, Manifest, Upgrades};
use std::path::PathBuf;

/// Arguments for the lock command
#[derive(Debug, Clone)]
pub struct LockArgs {
    pub manifest: String,
    pub global_manifest: Option<String>,
    pub lockfile: Option<PathBuf>,
    /// `Some(empty)` upgrades everything
    pub upgrade: Option<Vec<String>>,
    pub ga_registry: bool,
    pub overrides: Overrides,
}

fn upgrades(upgrade: Option<Vec<String>>) -> Upgrades {
    match upgrade {
        None => Upgrades::None,
        Some(ids) if ids.is_empty() => Upgrades::All,
        Some(ids) => Upgrades::Only(ids),
    }
}

/// Run the lock command
pub fn run(args: LockArgs) -> Result<()> {
    let raw = inline_or_file(&args.manifest, ManifestRaw::from_str, ManifestRaw::from_file)
        .context("Failed to load manifest")?;
    let manifest = if args.ga_registry {
        Manifest::from_raw_ga(raw)?
    } else {
        Manifest::from_raw(raw)?
    };

    let global = match &args.global_manifest {
        Some(arg) => inline_or_file(arg, GlobalManifest::from_str, GlobalManifest::from_file)
            .context("Failed to load global manifest")?,
        None => GlobalManifest::default(),
    };

    let settings = config::load_settings(&args.overrides)?;
    let provider = config::provider(&settings)?;

    let mut env = Environment::new(manifest, global, settings, provider)
        .with_upgrades(upgrades(args.upgrade));
    if let Some(path) = &args.lockfile {
        let old = Lockfile::from_file(path)
            .with_context(|| format!("Failed to read lockfile {}", path.display()))?;
        env = env.with_lockfile(old);
    }

    let lockfile = env.create_lockfile()?;
    for notice in env.notices() {
        eprintln!("note: {}", notice);
    }
    for iid in env.changed_packages(&lockfile) {
        tracing::info!(install_id = %iid, "Package locked");
    }

    println!("{}", lockfile.to_string()?);
    Ok(())
}
