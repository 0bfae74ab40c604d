//! Check command - verify a lockfile without resolving anything

use anyhow::{Context, Result};
use pkgdb_core::Lockfile;
use std::path::Path;

/// Check lockfile integrity and its manifest's `allow` policy.
///
/// Assumptions about missing package metadata are printed as warnings.
pub fn run(path: &Path) -> Result<()> {
    let lockfile = Lockfile::from_file(path)
        .with_context(|| format!("Failed to read lockfile {}", path.display()))?;
    let warnings = lockfile
        .check_packages()
        .with_context(|| format!("{} violates its manifest's policy", path.display()))?;

    for warning in &warnings {
        eprintln!("warning: {}", warning);
    }
    println!("{}: lockfile is valid", path.display());
    Ok(())
}
