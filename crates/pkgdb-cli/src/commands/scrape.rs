//! Scrape command (pkgdb scrape)

use crate::config::{self, Overrides};
use anyhow::{Context, Result};
use pkgdb_core::registry::InputPreferences;
use pkgdb_core::{PkgDbInput, RegistryInput, SourceLocator, Subtree};

/// Lock `locator`, populate its database for one subtree and system, and
/// print the database path
pub fn run(locator: &str, subtree: Subtree, overrides: &Overrides) -> Result<()> {
    let settings = config::load_settings(overrides)?;
    let provider = config::provider(&settings)?;

    let locator = SourceLocator::parse(locator)?;
    let locked = provider
        .lock_source(&locator)
        .with_context(|| format!("Failed to lock {}", locator))?;
    let defaults = InputPreferences {
        subtrees: Some(vec![subtree]),
    };

    let input = PkgDbInput::new(
        &locked.to_url(),
        &RegistryInput::new(locked),
        &defaults,
        &settings,
        provider,
    )?;
    input
        .ensure_scraped(&[settings.system.clone()])
        .with_context(|| format!("Failed to scrape {}", input.locked_input().url))?;

    println!("{}", input.db_path().display());
    Ok(())
}
