//! Environment resolution
//!
//! Descriptors are resolved in groups, and every member of a group is taken
//! from the same registry input. Groups whose descriptors did not change
//! since the previous lockfile keep their locked packages.

pub mod failure;

pub use failure::{AttemptFailure, DescriptorFailure, GroupFailure, ResolutionFailure};

use crate::db::{PkgDb, PkgDbInput};
use crate::lockfile::{LockedPackage, Lockfile, PackageInfo, SystemPackages};
use crate::manifest::{Descriptor, GlobalManifest, Manifest, Options};
use crate::provider::PackageProvider;
use crate::query::{PkgQuery, PkgQueryArgs};
use crate::registry::{LockedInput, Registry};
use crate::types::{display_attr_path, InstallId};
use crate::validator::Validator;
use crate::{PkgdbError, Result};
use pkgdb_config::Settings;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

/// How descriptors without a `package-group` are grouped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum GroupingStrategy {
    /// Every ungrouped descriptor resolves on its own
    #[default]
    Singleton,
}

impl FromStr for GroupingStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "singleton" => Ok(GroupingStrategy::Singleton),
            other => Err(format!("unknown package grouping strategy '{}'", other)),
        }
    }
}

/// Which locked groups may be re-resolved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Upgrades {
    /// Keep every lock that is still valid
    #[default]
    None,
    /// Re-lock the registry and re-resolve every group
    All,
    /// Re-resolve the groups named here, or containing these install ids
    Only(Vec<InstallId>),
}

impl Upgrades {
    fn covers(&self, group: &Group) -> bool {
        match self {
            Upgrades::None => false,
            Upgrades::All => true,
            Upgrades::Only(ids) => ids
                .iter()
                .any(|id| *id == group.name || group.members.contains(id)),
        }
    }
}

/// Descriptors resolved together
#[derive(Debug, Clone, PartialEq, Eq)]
struct Group {
    name: String,
    members: Vec<InstallId>,
}

/// Named groups by name, then ungrouped descriptors by install id
fn group_descriptors(
    descriptors: &BTreeMap<InstallId, Descriptor>,
    strategy: GroupingStrategy,
) -> Vec<Group> {
    let mut named: BTreeMap<String, Vec<InstallId>> = BTreeMap::new();
    let mut singletons = Vec::new();
    for (iid, descriptor) in descriptors {
        match (&descriptor.group, strategy) {
            (Some(group), _) => named.entry(group.clone()).or_default().push(iid.clone()),
            (None, GroupingStrategy::Singleton) => singletons.push(Group {
                name: iid.clone(),
                members: vec![iid.clone()],
            }),
        }
    }

    let mut groups: Vec<Group> = named
        .into_iter()
        .map(|(name, members)| Group { name, members })
        .collect();
    groups.extend(singletons);
    groups
}

/// Whether two descriptors ask for the same package.
///
/// `optional`, `systems`, `priority` and the group do not change which
/// package is selected.
fn same_package(new: &Descriptor, old: &Descriptor) -> bool {
    new.name == old.name
        && new.pname == old.pname
        && new.path == old.path
        && new.version == old.version
        && new.semver == old.semver
        && new.subtree == old.subtree
        && new.input == old.input
}

/// Why no package matched `descriptor`
fn describe_miss(descriptor: &Descriptor) -> String {
    let mut terms = Vec::new();
    if let Some(name) = &descriptor.name {
        terms.push(format!("name '{}'", name));
    }
    if let Some(pname) = &descriptor.pname {
        terms.push(format!("pname '{}'", pname));
    }
    if let Some(version) = &descriptor.version {
        terms.push(format!("version '{}'", version));
    }
    match descriptor.semver.as_deref() {
        Some("") | None => {}
        Some(range) => terms.push(format!("semver '{}'", range)),
    }
    if let Some(path) = &descriptor.path {
        terms.push(format!("path '{}'", display_attr_path(path)));
    }
    if let Some(subtree) = descriptor.subtree {
        terms.push(format!("subtree '{}'", subtree));
    }

    if terms.is_empty() {
        "no package matches".to_string()
    } else {
        format!("no package matches {}", terms.join(", "))
    }
}

/// A manifest in the context of a global manifest and a previous lockfile
pub struct Environment {
    manifest: Manifest,
    global: GlobalManifest,
    old_lockfile: Option<Lockfile>,
    settings: Settings,
    provider: Arc<dyn PackageProvider>,
    upgrades: Upgrades,
    lock_owner: Option<u32>,
    notices: Vec<String>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("manifest", &self.manifest)
            .field("global", &self.global)
            .field("old_lockfile", &self.old_lockfile.is_some())
            .field("upgrades", &self.upgrades)
            .finish()
    }
}

impl Environment {
    pub fn new(
        manifest: Manifest,
        global: GlobalManifest,
        settings: Settings,
        provider: Arc<dyn PackageProvider>,
    ) -> Self {
        Self {
            manifest,
            global,
            old_lockfile: None,
            settings,
            provider,
            upgrades: Upgrades::None,
            lock_owner: None,
            notices: Vec::new(),
        }
    }

    /// Reuse pins and packages from `lockfile`
    pub fn with_lockfile(mut self, lockfile: Lockfile) -> Self {
        self.old_lockfile = Some(lockfile);
        self
    }

    pub fn with_upgrades(mut self, upgrades: Upgrades) -> Self {
        self.upgrades = upgrades;
        self
    }

    /// Take part in database locking as `owner` instead of this process
    pub fn with_lock_owner(mut self, owner: u32) -> Self {
        self.lock_owner = Some(owner);
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn old_lockfile(&self) -> Option<&Lockfile> {
        self.old_lockfile.as_ref()
    }

    /// Messages about groups that moved to a different input during the last
    /// [`Environment::create_lockfile`]
    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    /// Options of the global manifest, overridden by those of the previous
    /// lockfile's manifest, overridden by the manifest's
    pub fn options(&self) -> Options {
        let mut options = self.global.options();
        if let Some(old) = self
            .old_lockfile
            .as_ref()
            .and_then(|lockfile| lockfile.manifest.options.as_ref())
        {
            options.merge(old);
        }
        options.merge(&self.manifest.options());
        options
    }

    /// Systems the environment is resolved for
    pub fn systems(&self) -> Vec<String> {
        self.options()
            .systems
            .unwrap_or_else(|| vec![self.settings.system.clone()])
    }

    /// Global registry overridden by the manifest's
    pub fn combined_registry(&self) -> Registry {
        let mut registry = self.global.registry();
        registry.merge(&self.manifest.registry(&self.settings.ga_registry_ref));
        registry
    }

    /// The combined registry with every input pinned.
    ///
    /// Unless everything is upgraded, inputs keep the pin recorded in the
    /// previous lockfile as long as they still name the same source.
    pub fn locked_registry(&self) -> Result<Registry> {
        let mut registry = self.combined_registry();
        if self.upgrades != Upgrades::All {
            if let Some(old) = &self.old_lockfile {
                for (name, input) in registry.inputs.iter_mut() {
                    let Some(pinned) = old.registry.get(name) else {
                        continue;
                    };
                    if pinned.from.source_key() == input.from.source_key() {
                        input.from = pinned.from.clone();
                    }
                }
            }
        }
        registry.lock(self.provider.as_ref())
    }

    /// Package database handle for input `name` of a locked `registry`
    pub fn db_input(&self, registry: &Registry, name: &str) -> Result<PkgDbInput> {
        let input = registry
            .get(name)
            .ok_or_else(|| PkgdbError::InvalidRegistry(format!("no such input '{}'", name)))?;
        let db_input = PkgDbInput::new(
            name,
            input,
            &registry.defaults,
            &self.settings,
            Arc::clone(&self.provider),
        )?;
        Ok(match self.lock_owner {
            Some(owner) => db_input.with_lock_owner(owner),
            None => db_input,
        })
    }

    /// Resolve every descriptor on every system into a new lockfile
    pub fn create_lockfile(&mut self) -> Result<Lockfile> {
        Validator::check(&self.manifest, &self.global)?;

        let (result, notices) = {
            let mut resolution = Resolution::new(self)?;
            let result = resolution.run();
            (result, resolution.notices)
        };
        self.notices = notices;
        result
    }

    /// Install ids whose locked package differs between the previous
    /// lockfile and `lockfile`
    pub fn changed_packages(&self, lockfile: &Lockfile) -> Vec<InstallId> {
        let mut changed = Vec::new();
        for (system, packages) in &lockfile.packages {
            for (iid, package) in packages {
                let before = self
                    .old_lockfile
                    .as_ref()
                    .and_then(|old| old.packages.get(system))
                    .and_then(|old| old.get(iid));
                let same = matches!(
                    (before, package),
                    (Some(Some(old)), Some(new))
                        if old.input == new.input && old.attr_path == new.attr_path
                );
                if !same && package.is_some() && !changed.contains(iid) {
                    changed.push(iid.clone());
                }
            }
        }
        changed
    }
}

/// Previous lockfile and its parsed descriptors
struct Previous<'a> {
    lockfile: &'a Lockfile,
    descriptors: BTreeMap<InstallId, Descriptor>,
}

enum GroupOutcome {
    Resolved(SystemPackages),
    Failed(GroupFailure),
}

/// State of one [`Environment::create_lockfile`] run
struct Resolution<'a> {
    env: &'a Environment,
    registry: Registry,
    locked: BTreeMap<String, LockedInput>,
    /// Input names keyed by locked fingerprint
    names: BTreeMap<String, String>,
    base_args: PkgQueryArgs,
    strategy: GroupingStrategy,
    systems: Vec<String>,
    previous: Option<Previous<'a>>,
    dbs: BTreeMap<String, PkgDb>,
    notices: Vec<String>,
}

impl<'a> Resolution<'a> {
    fn new(env: &'a Environment) -> Result<Self> {
        let options = env.options();
        let strategy = match &options.package_grouping_strategy {
            Some(strategy) => strategy.parse().map_err(PkgdbError::InvalidManifest)?,
            None => GroupingStrategy::default(),
        };

        let mut base_args = PkgQueryArgs::default();
        options.fill_query_args(&mut base_args);

        let registry = env.locked_registry()?;
        let locked: BTreeMap<String, LockedInput> =
            registry.locked_inputs()?.into_iter().collect();
        let names = locked
            .iter()
            .map(|(name, input)| (input.fingerprint.clone(), name.clone()))
            .collect();

        let previous = match &env.old_lockfile {
            Some(lockfile) => Some(Previous {
                lockfile,
                descriptors: lockfile.parsed_manifest()?.descriptors().clone(),
            }),
            None => None,
        };

        Ok(Self {
            env,
            registry,
            locked,
            names,
            base_args,
            strategy,
            systems: env.systems(),
            previous,
            dbs: BTreeMap::new(),
            notices: Vec::new(),
        })
    }

    fn run(&mut self) -> Result<Lockfile> {
        let groups = group_descriptors(self.env.manifest.descriptors(), self.strategy);
        let mut failure = ResolutionFailure::new();
        let mut packages = BTreeMap::new();

        for system in self.systems.clone() {
            tracing::info!(%system, groups = groups.len(), "Locking system");
            let mut resolved = SystemPackages::new();
            for group in &groups {
                if let Some(kept) = self.reuse_locked(group, &system) {
                    tracing::debug!(group = %group.name, %system, "Keeping locked group");
                    resolved.extend(kept);
                    continue;
                }
                match self.resolve_group(group, &system)? {
                    GroupOutcome::Resolved(members) => resolved.extend(members),
                    GroupOutcome::Failed(group_failure) => failure.push(group_failure),
                }
            }
            packages.insert(system, resolved);
        }

        if !failure.is_empty() {
            return Err(failure.into());
        }

        let mut lockfile = Lockfile::new(self.env.manifest.raw().clone(), self.registry.clone());
        lockfile.packages = packages;
        lockfile.remove_unused_inputs();
        Ok(lockfile)
    }

    /// Packages of the previous lockfile for `group`, if they may be kept
    fn reuse_locked(&self, group: &Group, system: &str) -> Option<SystemPackages> {
        if self.env.upgrades.covers(group) {
            return None;
        }
        let previous = self.previous.as_ref()?;
        let old_packages = previous.lockfile.packages.get(system)?;

        let mut kept = SystemPackages::new();
        for iid in &group.members {
            let new = self.env.manifest.descriptors().get(iid)?;
            let old = previous.descriptors.get(iid)?;
            if !same_package(new, old)
                || new.group != old.group
                || new.optional != old.optional
                || new.applies_to(system) != old.applies_to(system)
            {
                return None;
            }

            let locked = old_packages.get(iid)?;
            if let Some(package) = locked {
                if !self.names.contains_key(&package.input.fingerprint) {
                    return None;
                }
            }
            let locked = locked.clone().map(|mut package| {
                package.priority = new.priority;
                package
            });
            kept.insert(iid.clone(), locked);
        }
        Some(kept)
    }

    /// Input the previous lockfile resolved an unchanged member of `group` in.
    ///
    /// Members that stayed in the same group win over members that moved.
    fn previous_input(&self, group: &Group, system: &str) -> Option<LockedInput> {
        let previous = self.previous.as_ref()?;
        let old_packages = previous.lockfile.packages.get(system)?;

        let mut moved = None;
        for iid in &group.members {
            let Some(Some(package)) = old_packages.get(iid) else {
                continue;
            };
            let (Some(new), Some(old)) = (
                self.env.manifest.descriptors().get(iid),
                previous.descriptors.get(iid),
            ) else {
                continue;
            };
            if !same_package(new, old) {
                continue;
            }
            if new.group == old.group {
                return Some(package.input.clone());
            }
            if moved.is_none() {
                moved = Some(package.input.clone());
            }
        }
        moved
    }

    /// Input names to try for a group, in order
    fn candidates(
        &self,
        members: &[(InstallId, Descriptor)],
        previous: Option<&LockedInput>,
    ) -> Vec<String> {
        if let Some(forced) = members.iter().find_map(|(_, d)| d.input.clone()) {
            return vec![forced];
        }

        let mut order: Vec<String> = self
            .registry
            .order()
            .into_iter()
            .map(|(name, _)| name.to_string())
            .collect();
        if let Some(name) = previous.and_then(|input| self.names.get(&input.fingerprint)) {
            order.retain(|candidate| candidate != name);
            order.insert(0, name.clone());
        }
        order
    }

    fn resolve_group(&mut self, group: &Group, system: &str) -> Result<GroupOutcome> {
        let mut resolved = SystemPackages::new();
        let mut members = Vec::new();
        for iid in &group.members {
            let descriptor = self.env.manifest.descriptors().get(iid).ok_or_else(|| {
                PkgdbError::InvalidManifest(format!("no descriptor for '{}'", iid))
            })?;
            if descriptor.applies_to(system) {
                members.push((iid.clone(), descriptor.clone()));
            } else {
                resolved.insert(iid.clone(), None);
            }
        }
        if members.is_empty() {
            return Ok(GroupOutcome::Resolved(resolved));
        }

        let previous = self.previous_input(group, system);
        let mut attempts = Vec::new();
        for name in self.candidates(&members, previous.as_ref()) {
            let locked = self
                .locked
                .get(&name)
                .cloned()
                .ok_or_else(|| PkgdbError::InvalidRegistry(format!("no such input '{}'", name)))?;

            let (packages, failures) = self.try_input(&name, &locked, &members, system)?;
            if failures.is_empty() {
                tracing::debug!(group = %group.name, %system, input = %name, "Resolved group");
                let moved = previous
                    .as_ref()
                    .filter(|p| p.fingerprint != locked.fingerprint);
                if let Some(previous) = moved {
                    tracing::warn!(
                        group = %group.name,
                        %system,
                        from = %previous.url,
                        to = %locked.url,
                        "Group moved to a different input"
                    );
                    self.notices.push(format!(
                        "group '{}' on '{}' is now resolved in '{}' instead of '{}'",
                        group.name, system, locked.url, previous.url
                    ));
                }
                resolved.extend(packages);
                return Ok(GroupOutcome::Resolved(resolved));
            }

            attempts.push(AttemptFailure {
                input: name,
                url: locked.url.clone(),
                revision: locked.attrs.revision().map(str::to_string),
                failures,
            });
        }

        Ok(GroupOutcome::Failed(GroupFailure {
            group: group.name.clone(),
            system: system.to_string(),
            attempts,
        }))
    }

    /// Resolve every member in input `name`; an empty failure list means success
    fn try_input(
        &mut self,
        name: &str,
        locked: &LockedInput,
        members: &[(InstallId, Descriptor)],
        system: &str,
    ) -> Result<(SystemPackages, Vec<DescriptorFailure>)> {
        let mut packages = SystemPackages::new();
        let mut failures = Vec::new();
        for (iid, descriptor) in members {
            let found = if descriptor.is_path_only() {
                self.lookup_path(locked, descriptor, system)?
            } else {
                self.search(name, locked, descriptor, system)?
            };
            match found {
                Some(package) => {
                    packages.insert(iid.clone(), Some(package));
                }
                None if descriptor.optional => {
                    tracing::debug!(install_id = %iid, %system, input = %name, "Optional package not found");
                    packages.insert(iid.clone(), None);
                }
                None => failures.push(DescriptorFailure {
                    install_id: iid.clone(),
                    reason: describe_miss(descriptor),
                }),
            }
        }
        Ok((packages, failures))
    }

    /// Look up an exact attribute path without scraping the input
    fn lookup_path(
        &self,
        locked: &LockedInput,
        descriptor: &Descriptor,
        system: &str,
    ) -> Result<Option<LockedPackage>> {
        let (Some(subtree), Some(rel_path)) = (descriptor.subtree, &descriptor.path) else {
            return Ok(None);
        };
        let mut path = vec![subtree.to_string(), system.to_string()];
        path.extend(rel_path.iter().cloned());

        let Some(record) = self.env.provider.get_package(locked, &path)? else {
            return Ok(None);
        };
        if record.broken == Some(true) && !self.base_args.allow_broken {
            return Ok(None);
        }
        if record.unfree == Some(true) && !self.base_args.allow_unfree {
            return Ok(None);
        }
        if let Some(allowed) = self.base_args.licenses.as_ref().filter(|l| !l.is_empty()) {
            if !record.license.as_ref().is_some_and(|license| allowed.contains(license)) {
                return Ok(None);
            }
        }
        Ok(Some(LockedPackage {
            input: locked.clone(),
            attr_path: record.abs_path(),
            priority: descriptor.priority,
            info: PackageInfo::from(&record),
        }))
    }

    /// Best match for `descriptor` in the database of input `name`
    fn search(
        &mut self,
        name: &str,
        locked: &LockedInput,
        descriptor: &Descriptor,
        system: &str,
    ) -> Result<Option<LockedPackage>> {
        let mut args = self.base_args.clone();
        args.systems = vec![system.to_string()];
        self.registry.fill_query_args(name, &mut args)?;
        descriptor.fill_query_args(&mut args);
        args.limit = Some(1);
        let query = PkgQuery::new(args)?;

        let db = self.db(name)?;
        let Some(id) = db.execute(&query)?.into_iter().next() else {
            return Ok(None);
        };
        let row = db.get_package(id)?;
        Ok(Some(LockedPackage {
            input: locked.clone(),
            attr_path: row.abs_path.clone(),
            priority: descriptor.priority,
            info: PackageInfo::from(&row),
        }))
    }

    /// Database of input `name`, scraped for every system on first use
    fn db(&mut self, name: &str) -> Result<&PkgDb> {
        match self.dbs.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let input = self.env.db_input(&self.registry, name)?;
                let db = input.db(&self.systems)?;
                Ok(entry.insert(db))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestRaw;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn descriptors(json: &str) -> BTreeMap<InstallId, Descriptor> {
        Manifest::from_raw(ManifestRaw::from_str(json).unwrap())
            .unwrap()
            .descriptors()
            .clone()
    }

    #[test]
    fn test_grouping_strategy_from_str() {
        assert_eq!(
            "singleton".parse::<GroupingStrategy>(),
            Ok(GroupingStrategy::Singleton)
        );
        assert!("one-big-group".parse::<GroupingStrategy>().is_err());
    }

    #[test]
    fn test_groups_then_singletons() {
        let descriptors = descriptors(
            r#"{ "install": {
                "curl": {},
                "hello": { "package-group": "greeters" },
                "world": { "package-group": "greeters" },
                "jq": {}
            } }"#,
        );
        let groups = group_descriptors(&descriptors, GroupingStrategy::Singleton);
        assert_eq!(
            groups,
            vec![
                Group {
                    name: "greeters".to_string(),
                    members: vec!["hello".to_string(), "world".to_string()],
                },
                Group {
                    name: "curl".to_string(),
                    members: vec!["curl".to_string()],
                },
                Group {
                    name: "jq".to_string(),
                    members: vec!["jq".to_string()],
                },
            ]
        );
    }

    #[rstest]
    #[case(Upgrades::None, false)]
    #[case(Upgrades::All, true)]
    #[case(Upgrades::Only(vec!["greeters".to_string()]), true)]
    #[case(Upgrades::Only(vec!["world".to_string()]), true)]
    #[case(Upgrades::Only(vec!["curl".to_string()]), false)]
    fn test_upgrades_cover_groups(#[case] upgrades: Upgrades, #[case] covered: bool) {
        let group = Group {
            name: "greeters".to_string(),
            members: vec!["hello".to_string(), "world".to_string()],
        };
        assert_eq!(upgrades.covers(&group), covered);
    }

    #[test]
    fn test_same_package_ignores_install_settings() {
        let old = descriptors(r#"{ "install": { "hello": { "version": "^2" } } }"#);
        let new = descriptors(
            r#"{ "install": { "hello": { "version": "^2", "priority": 1, "optional": true } } }"#,
        );
        assert!(same_package(&new["hello"], &old["hello"]));

        let bumped = descriptors(r#"{ "install": { "hello": { "version": "^3" } } }"#);
        assert!(!same_package(&bumped["hello"], &old["hello"]));
    }

    #[test]
    fn test_describe_miss() {
        let descriptors = descriptors(
            r#"{ "install": { "py": { "pname": "python3", "version": "^3.11", "path": "python3" } } }"#,
        );
        assert_eq!(
            describe_miss(&descriptors["py"]),
            "no package matches pname 'python3', semver '^3.11', path 'python3'"
        );
    }
}
