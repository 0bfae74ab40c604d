//! Upstream package data providers
//!
//! Evaluating package sources into metadata happens outside this crate. A
//! [`PackageProvider`] pins source locators and hands back package records;
//! callers treat every method as a potentially slow, blocking call.

use crate::registry::{LockedInput, SourceLocator};
use crate::types::{display_attr_path, AttrPath, Subtree};
use crate::{PkgdbError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Metadata of one package as reported by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PackageRecord {
    pub subtree: Subtree,
    pub system: String,
    /// Attribute path below `<subtree>.<system>`
    pub rel_path: AttrPath,
    pub pname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unfree: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_outputs")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs_to_install: Option<Vec<String>>,
}

fn default_outputs() -> Vec<String> {
    vec!["out".to_string()]
}

impl PackageRecord {
    /// Minimal record; remaining fields default to unknown
    pub fn new(subtree: Subtree, system: &str, rel_path: &[&str], pname: &str) -> Self {
        Self {
            subtree,
            system: system.to_string(),
            rel_path: rel_path.iter().map(|s| s.to_string()).collect(),
            pname: pname.to_string(),
            name: None,
            version: None,
            license: None,
            broken: None,
            unfree: None,
            description: None,
            outputs: default_outputs(),
            outputs_to_install: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn with_license(mut self, license: &str) -> Self {
        self.license = Some(license.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_flags(mut self, broken: bool, unfree: bool) -> Self {
        self.broken = Some(broken);
        self.unfree = Some(unfree);
        self
    }

    /// `<subtree>.<system>.<relPath...>`
    pub fn abs_path(&self) -> AttrPath {
        let mut path = vec![self.subtree.to_string(), self.system.clone()];
        path.extend(self.rel_path.iter().cloned());
        path
    }

    /// Derivation name, `<pname>-<version>` unless reported explicitly
    pub fn derivation_name(&self) -> String {
        match (&self.name, &self.version) {
            (Some(name), _) => name.clone(),
            (None, Some(version)) => format!("{}-{}", self.pname, version),
            (None, None) => self.pname.clone(),
        }
    }
}

/// Source of package metadata
pub trait PackageProvider: Send + Sync {
    /// Pin `locator` to an exact revision
    fn lock_source(&self, locator: &SourceLocator) -> Result<SourceLocator>;

    /// Look up one package by absolute attribute path
    fn get_package(&self, input: &LockedInput, path: &[String]) -> Result<Option<PackageRecord>>;

    /// Every package of `input` below `<subtree>.<system>`
    fn packages(
        &self,
        input: &LockedInput,
        subtree: Subtree,
        system: &str,
    ) -> Result<Vec<PackageRecord>>;
}

/// One source served by a [`FixtureProvider`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureSource {
    /// Revision unpinned locators are locked to
    pub rev: String,
    #[serde(default)]
    pub packages: Vec<PackageRecord>,
}

/// Provider backed by in-memory records, loadable from a JSON file of the
/// form `{ "sources": { "github:owner/repo": { "rev": "...", "packages": [...] } } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureProvider {
    #[serde(default)]
    sources: BTreeMap<String, FixtureSource>,
    #[serde(skip)]
    scrape_delay: Option<Duration>,
    #[serde(skip)]
    scrapes: Arc<AtomicUsize>,
}

impl FixtureProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load fixtures from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Serve `packages` for the source identified by `key` at `rev`
    pub fn with_source(mut self, key: &str, rev: &str, packages: Vec<PackageRecord>) -> Self {
        self.sources.insert(
            key.to_string(),
            FixtureSource {
                rev: rev.to_string(),
                packages,
            },
        );
        self
    }

    /// Sleep this long in every [`PackageProvider::packages`] call
    pub fn with_scrape_delay(mut self, delay: Duration) -> Self {
        self.scrape_delay = Some(delay);
        self
    }

    /// Number of [`PackageProvider::packages`] calls served so far, shared by clones
    pub fn scrape_count(&self) -> usize {
        self.scrapes.load(Ordering::SeqCst)
    }

    fn source_for(&self, input: &LockedInput) -> Result<&FixtureSource> {
        let key = input.attrs.source_key();
        let source = self
            .sources
            .get(&key)
            .ok_or_else(|| PkgdbError::Provider(format!("unknown source '{}'", key)))?;
        if input.attrs.revision() != Some(source.rev.as_str()) {
            return Err(PkgdbError::Provider(format!(
                "revision of '{}' is not available",
                input.url
            )));
        }
        Ok(source)
    }
}

impl PackageProvider for FixtureProvider {
    fn lock_source(&self, locator: &SourceLocator) -> Result<SourceLocator> {
        if locator.is_locked() {
            return Ok(locator.clone());
        }
        let key = locator.source_key();
        let source = self
            .sources
            .get(&key)
            .ok_or_else(|| PkgdbError::Provider(format!("unknown source '{}'", key)))?;

        let mut pinned = locator.clone();
        match &mut pinned {
            SourceLocator::Github { rev, .. } | SourceLocator::Git { rev, .. } => {
                *rev = Some(source.rev.clone())
            }
            SourceLocator::Path { nar_hash, .. } | SourceLocator::Tarball { nar_hash, .. } => {
                *nar_hash = Some(source.rev.clone())
            }
            SourceLocator::Indirect { id, .. } => {
                return Err(PkgdbError::InvalidRegistry(format!(
                    "indirect reference '{}' cannot be locked",
                    id
                )))
            }
        }
        Ok(pinned)
    }

    fn get_package(&self, input: &LockedInput, path: &[String]) -> Result<Option<PackageRecord>> {
        let source = self.source_for(input)?;
        Ok(source
            .packages
            .iter()
            .find(|record| record.abs_path() == path)
            .cloned())
    }

    fn packages(
        &self,
        input: &LockedInput,
        subtree: Subtree,
        system: &str,
    ) -> Result<Vec<PackageRecord>> {
        self.scrapes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.scrape_delay {
            std::thread::sleep(delay);
        }
        let source = self.source_for(input)?;
        Ok(source
            .packages
            .iter()
            .filter(|record| record.subtree == subtree && record.system == system)
            .cloned()
            .collect())
    }
}

/// Provider used when none is configured.
///
/// Already locked inputs pass through so that cached databases stay usable;
/// anything that needs evaluation fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProvider;

impl NoProvider {
    fn unavailable(what: &str) -> PkgdbError {
        PkgdbError::Provider(format!(
            "no package provider is configured, cannot {}",
            what
        ))
    }
}

impl PackageProvider for NoProvider {
    fn lock_source(&self, locator: &SourceLocator) -> Result<SourceLocator> {
        if locator.is_locked() {
            Ok(locator.clone())
        } else {
            Err(Self::unavailable(&format!("lock '{}'", locator)))
        }
    }

    fn get_package(&self, input: &LockedInput, path: &[String]) -> Result<Option<PackageRecord>> {
        Err(Self::unavailable(&format!(
            "evaluate '{}' in '{}'",
            display_attr_path(path),
            input.url
        )))
    }

    fn packages(
        &self,
        input: &LockedInput,
        subtree: Subtree,
        system: &str,
    ) -> Result<Vec<PackageRecord>> {
        Err(Self::unavailable(&format!(
            "list {}.{} of '{}'",
            subtree, system, input.url
        )))
    }
}

/// Provider that shells out to an external evaluator.
///
/// The evaluator is invoked as `<program> [args..] <subcommand> ...`:
/// - `lock <url>` prints the locked URL
/// - `get <locked-url> <attr.path>` prints a record as JSON, or `null`
/// - `packages <locked-url> <subtree> <system>` prints one JSON record per line
#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
}

impl CommandProvider {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn run(&self, subcommand: &[&str]) -> Result<String> {
        tracing::debug!(program = %self.program, args = ?subcommand, "Invoking evaluator");
        let output = Command::new(&self.program)
            .args(&self.args)
            .args(subcommand)
            .output()
            .map_err(|e| {
                PkgdbError::Provider(format!("failed to run '{}': {}", self.program, e))
            })?;
        if !output.status.success() {
            return Err(PkgdbError::Provider(format!(
                "'{} {}' exited with {}: {}",
                self.program,
                subcommand.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        String::from_utf8(output.stdout).map_err(|e| {
            PkgdbError::Provider(format!("'{}' printed invalid UTF-8: {}", self.program, e))
        })
    }
}

impl PackageProvider for CommandProvider {
    fn lock_source(&self, locator: &SourceLocator) -> Result<SourceLocator> {
        if locator.is_locked() {
            return Ok(locator.clone());
        }
        let url = locator.to_url();
        let stdout = self.run(&["lock", &url])?;
        SourceLocator::parse(stdout.trim())
    }

    fn get_package(&self, input: &LockedInput, path: &[String]) -> Result<Option<PackageRecord>> {
        let path = display_attr_path(path);
        let stdout = self.run(&["get", &input.url, &path])?;
        Ok(serde_json::from_str(stdout.trim())?)
    }

    fn packages(
        &self,
        input: &LockedInput,
        subtree: Subtree,
        system: &str,
    ) -> Result<Vec<PackageRecord>> {
        let stdout = self.run(&["packages", &input.url, subtree.as_str(), system])?;
        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }
}
