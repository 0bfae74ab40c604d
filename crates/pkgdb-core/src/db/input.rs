//! A registry input paired with its package database

use super::lock::{Acquired, DbLock};
use super::{schema, PkgDb};
use crate::provider::PackageProvider;
use crate::query::PkgQueryArgs;
use crate::registry::{InputPreferences, LockedInput, RegistryInput};
use crate::types::{AttrPath, Subtree};
use crate::Result;
use pkgdb_config::{DbLockSettings, Settings};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A locked registry input and the database caching its packages
pub struct PkgDbInput {
    name: String,
    locked: LockedInput,
    subtrees: Vec<Subtree>,
    db_path: PathBuf,
    lock_settings: DbLockSettings,
    owner: Option<u32>,
    provider: Arc<dyn PackageProvider>,
}

impl std::fmt::Debug for PkgDbInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkgDbInput")
            .field("name", &self.name)
            .field("url", &self.locked.url)
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl PkgDbInput {
    /// Wrap the locked input `name`; nothing is read or written yet
    pub fn new(
        name: &str,
        input: &RegistryInput,
        defaults: &InputPreferences,
        settings: &Settings,
        provider: Arc<dyn PackageProvider>,
    ) -> Result<Self> {
        let locked = LockedInput::new(input.from.clone())?;
        let db_path = Self::db_path_for(&settings.cache_dir, &locked.fingerprint);
        Ok(Self {
            name: name.to_string(),
            locked,
            subtrees: input.effective_subtrees(defaults),
            db_path,
            lock_settings: settings.db_lock,
            owner: None,
            provider,
        })
    }

    /// Take part in the lock protocol as `owner` instead of this process
    pub fn with_lock_owner(mut self, owner: u32) -> Self {
        self.owner = Some(owner);
        self
    }

    /// `<cache_dir>/v<N>/<fingerprint>.sqlite`
    pub fn db_path_for(cache_dir: &Path, fingerprint: &str) -> PathBuf {
        cache_dir
            .join(format!("v{}", schema::TABLES_VERSION))
            .join(format!("{}.sqlite", fingerprint))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn locked_input(&self) -> &LockedInput {
        &self.locked
    }

    pub fn subtrees(&self) -> &[Subtree] {
        &self.subtrees
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn provider(&self) -> &dyn PackageProvider {
        self.provider.as_ref()
    }

    /// Scope `args` to this input's subtrees
    pub fn fill_query_args(&self, args: &mut PkgQueryArgs) {
        args.subtrees = Some(self.subtrees.clone());
    }

    fn lock(&self) -> DbLock {
        let lock = DbLock::new(&self.db_path, self.lock_settings);
        match self.owner {
            Some(owner) => lock.with_owner(owner),
            None => lock,
        }
    }

    fn prefixes(&self, systems: &[String]) -> Vec<(Subtree, String, AttrPath)> {
        let mut prefixes = Vec::new();
        for subtree in &self.subtrees {
            for system in systems {
                let path = vec![subtree.to_string(), system.clone()];
                prefixes.push((*subtree, system.clone(), path));
            }
        }
        prefixes
    }

    /// Create the database unless a complete one exists
    fn ensure_created(&self) -> Result<()> {
        while !PkgDb::is_initialized(&self.db_path)? {
            match self.lock().acquire()? {
                Acquired::Holder(guard) => {
                    if !PkgDb::is_initialized(&self.db_path)? {
                        if self.db_path.exists() {
                            tracing::warn!(db = %self.db_path.display(), "Replacing incomplete package database");
                            std::fs::remove_file(&self.db_path)?;
                        }
                        PkgDb::create(&self.db_path, &self.locked)?;
                    }
                    guard.release()?;
                }
                Acquired::PeerFinished => {}
            }
        }
        Ok(())
    }

    fn missing(&self, db: &PkgDb, systems: &[String]) -> Result<Vec<(Subtree, String, AttrPath)>> {
        let mut missing = Vec::new();
        for prefix in self.prefixes(systems) {
            if !db.is_prefix_done(&prefix.2)? {
                missing.push(prefix);
            }
        }
        Ok(missing)
    }

    /// Make sure every `<subtree>.<system>` prefix of `systems` is recorded.
    ///
    /// Exactly one process scrapes a given prefix; everyone else waits for it
    /// and then sees the complete database.
    pub fn ensure_scraped(&self, systems: &[String]) -> Result<()> {
        self.ensure_created()?;
        loop {
            {
                let db = PkgDb::open_read_only(&self.db_path)?;
                if self.missing(&db, systems)?.is_empty() {
                    return Ok(());
                }
            }

            match self.lock().acquire()? {
                Acquired::Holder(guard) => {
                    let mut db = PkgDb::open_read_write(&self.db_path)?;
                    for (subtree, system, prefix) in self.missing(&db, systems)? {
                        tracing::info!(
                            input = %self.name,
                            prefix = %prefix.join("."),
                            "Scraping packages"
                        );
                        let records = self.provider.packages(&self.locked, subtree, &system)?;
                        db.add_prefix(&prefix, &records)?;
                        guard.check()?;
                    }
                    drop(db);
                    guard.release()?;
                    return Ok(());
                }
                Acquired::PeerFinished => {
                    tracing::debug!(input = %self.name, "Peer finished populating database");
                }
            }
        }
    }

    /// Scrape `systems` if needed and open the database for reading
    pub fn db(&self, systems: &[String]) -> Result<PkgDb> {
        self.ensure_scraped(systems)?;
        PkgDb::open_read_only(&self.db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{FixtureProvider, PackageRecord};
    use crate::registry::SourceLocator;
    use tempfile::TempDir;

    const REV: &str = "0123456789abcdef0123456789abcdef01234567";

    fn settings(dir: &TempDir) -> Settings {
        Settings {
            cache_dir: dir.path().to_path_buf(),
            system: "x86_64-linux".to_string(),
            ga_registry_ref: "release-23.05".to_string(),
            db_lock: DbLockSettings::default(),
            provider: Default::default(),
        }
    }

    fn input(provider: &FixtureProvider, dir: &TempDir) -> PkgDbInput {
        let registry_input = RegistryInput {
            from: SourceLocator::parse(&format!("github:acme/pkgs/{}", REV)).unwrap(),
            subtrees: Some(vec![Subtree::LegacyPackages]),
        };
        PkgDbInput::new(
            "acme",
            &registry_input,
            &InputPreferences::default(),
            &settings(dir),
            Arc::new(provider.clone()),
        )
        .unwrap()
    }

    fn provider() -> FixtureProvider {
        FixtureProvider::new().with_source(
            "github:acme/pkgs",
            REV,
            vec![PackageRecord::new(
                Subtree::LegacyPackages,
                "x86_64-linux",
                &["hello"],
                "hello",
            )],
        )
    }

    #[test]
    fn test_db_path_layout() {
        let dir = TempDir::new().unwrap();
        let input = input(&provider(), &dir);
        let expected = dir
            .path()
            .join("v1")
            .join(format!("{}.sqlite", input.locked_input().fingerprint));
        assert_eq!(input.db_path(), expected);
    }

    #[test]
    fn test_scrape_happens_once() {
        let dir = TempDir::new().unwrap();
        let provider = provider();
        let input = input(&provider, &dir);
        let systems = vec!["x86_64-linux".to_string()];

        input.ensure_scraped(&systems).unwrap();
        input.ensure_scraped(&systems).unwrap();
        assert_eq!(provider.scrape_count(), 1);
        assert_eq!(input.db(&systems).unwrap().package_count().unwrap(), 1);
        assert!(!dir.path().join("v1").read_dir().unwrap().any(|e| {
            e.unwrap().path().extension().is_some_and(|ext| ext == "lock")
        }));
    }

    #[test]
    fn test_new_system_scrapes_only_missing_prefix() {
        let dir = TempDir::new().unwrap();
        let provider = provider();
        let input = input(&provider, &dir);

        input.ensure_scraped(&["x86_64-linux".to_string()]).unwrap();
        input
            .ensure_scraped(&["x86_64-linux".to_string(), "aarch64-darwin".to_string()])
            .unwrap();
        assert_eq!(provider.scrape_count(), 2);
    }
}
