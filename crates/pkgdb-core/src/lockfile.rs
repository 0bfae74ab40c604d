//! Environment lockfile (`manifest.lock`)

use crate::db::PackageRow;
use crate::manifest::{Manifest, ManifestRaw};
use crate::provider::PackageRecord;
use crate::registry::{LockedInput, Registry};
use crate::types::{display_attr_path, AttrPath, InstallId};
use crate::{PkgdbError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Install id to locked package, `None` for optional or skipped descriptors
pub type SystemPackages = BTreeMap<InstallId, Option<LockedPackage>>;

/// Package metadata recorded in the lockfile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageInfo {
    pub pname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unfree: Option<bool>,
}

impl From<&PackageRow> for PackageInfo {
    fn from(row: &PackageRow) -> Self {
        Self {
            pname: row.pname.clone().unwrap_or_else(|| row.name.clone()),
            version: row.version.clone(),
            license: row.license.clone(),
            broken: row.broken,
            unfree: row.unfree,
        }
    }
}

impl From<&PackageRecord> for PackageInfo {
    fn from(record: &PackageRecord) -> Self {
        Self {
            pname: record.pname.clone(),
            version: record.version.clone(),
            license: record.license.clone(),
            broken: record.broken,
            unfree: record.unfree,
        }
    }
}

/// A descriptor pinned to one package of one locked input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LockedPackage {
    pub input: LockedInput,
    pub attr_path: AttrPath,
    pub priority: u64,
    pub info: PackageInfo,
}

/// Lockfile structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Lockfile {
    /// Manifest the packages were resolved from
    pub manifest: ManifestRaw,
    /// Locked registry the packages were resolved against
    pub registry: Registry,
    /// System to install id to locked package
    pub packages: BTreeMap<String, SystemPackages>,
    #[serde(rename = "lockfile-version")]
    pub lockfile_version: u32,
}

impl Lockfile {
    /// Current lockfile format version
    pub const VERSION: u32 = 0;

    pub fn new(manifest: ManifestRaw, registry: Registry) -> Self {
        Self {
            manifest,
            registry,
            packages: BTreeMap::new(),
            lockfile_version: Self::VERSION,
        }
    }

    /// Parse and check a JSON lockfile
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let lockfile: Lockfile = serde_json::from_str(content)
            .map_err(|e| PkgdbError::InvalidLockfile(format!("failed to parse lockfile: {}", e)))?;
        lockfile.check()?;
        Ok(lockfile)
    }

    /// Load and check a lockfile
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Serialize to pretty JSON
    pub fn to_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write lockfile to file
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let mut content = self.to_string()?;
        content.push('\n');
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Locked package of `iid` on `system`
    pub fn locked_package(&self, system: &str, iid: &str) -> Option<&LockedPackage> {
        self.packages.get(system)?.get(iid)?.as_ref()
    }

    /// Parsed manifest snapshot
    pub fn parsed_manifest(&self) -> Result<Manifest> {
        Manifest::from_raw(self.manifest.clone())
            .map_err(|e| PkgdbError::InvalidLockfile(format!("embedded manifest: {}", e)))
    }

    /// Registry input names keyed by the fingerprint of their locked source
    pub fn input_fingerprints(&self) -> BTreeMap<String, String> {
        self.registry
            .inputs
            .iter()
            .filter_map(|(name, input)| {
                LockedInput::new(input.from.clone())
                    .ok()
                    .map(|locked| (locked.fingerprint, name.clone()))
            })
            .collect()
    }

    /// Verify lockfile integrity
    pub fn check(&self) -> Result<()> {
        if self.lockfile_version != Self::VERSION {
            return Err(PkgdbError::InvalidLockfile(format!(
                "unsupported lockfile version {}, expected {}",
                self.lockfile_version,
                Self::VERSION
            )));
        }

        if let Some(registry) = &self.manifest.registry {
            for (name, input) in &registry.inputs {
                if input.from.is_indirect() {
                    return Err(PkgdbError::InvalidLockfile(format!(
                        "manifest input '{}' uses the indirect reference '{}'",
                        name, input.from
                    )));
                }
            }
        }

        self.check_groups()?;

        let fingerprints = self.input_fingerprints();
        let manifest = self.parsed_manifest()?;
        for (system, packages) in &self.packages {
            for (iid, locked) in packages {
                let descriptor = manifest.descriptors().get(iid).ok_or_else(|| {
                    PkgdbError::InvalidLockfile(format!(
                        "'{}' is locked on '{}' but not installed by the manifest",
                        iid, system
                    ))
                })?;
                match locked {
                    Some(package) => {
                        if !fingerprints.contains_key(&package.input.fingerprint) {
                            return Err(PkgdbError::InvalidLockfile(format!(
                                "'{}' on '{}' is locked to '{}' which is not in the registry",
                                iid, system, package.input.url
                            )));
                        }
                        if !descriptor.applies_to(system) {
                            return Err(PkgdbError::InvalidLockfile(format!(
                                "'{}' is locked on '{}' but does not install on that system",
                                iid, system
                            )));
                        }
                    }
                    None if descriptor.optional || !descriptor.applies_to(system) => {}
                    None => {
                        return Err(PkgdbError::InvalidLockfile(format!(
                            "'{}' on '{}' is unresolved but not optional",
                            iid, system
                        )))
                    }
                }
            }
            for iid in manifest.descriptors().keys() {
                if !packages.contains_key(iid) {
                    return Err(PkgdbError::InvalidLockfile(format!(
                        "'{}' is missing from the packages of '{}'",
                        iid, system
                    )));
                }
            }
        }

        Ok(())
    }

    /// Every group resolves to one input per system
    pub fn check_groups(&self) -> Result<()> {
        let manifest = self.parsed_manifest()?;
        for packages in self.packages.values() {
            let mut groups: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
            for (iid, locked) in packages {
                let group = manifest
                    .descriptors()
                    .get(iid)
                    .and_then(|d| d.group.as_deref());
                if let (Some(group), Some(package)) = (group, locked) {
                    groups
                        .entry(group)
                        .or_default()
                        .insert(&package.input.fingerprint);
                }
            }
            if let Some((group, _)) = groups.iter().find(|(_, inputs)| inputs.len() > 1) {
                return Err(PkgdbError::InvalidLockfile(format!(
                    "invalid group '{}' uses multiple inputs",
                    group
                )));
            }
        }
        Ok(())
    }

    /// Check locked packages against `allow.unfree` and `allow.broken`.
    ///
    /// Packages that do not report a flag are assumed unfree and not broken;
    /// each assumption is returned as a warning.
    pub fn check_packages(&self) -> Result<Vec<String>> {
        let options = self.manifest.options.clone().unwrap_or_default();
        let allow_unfree = options.allow_unfree().unwrap_or(true);
        let allow_broken = options.allow_broken().unwrap_or(false);

        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        for (system, packages) in &self.packages {
            for (iid, package) in packages {
                let Some(package) = package else { continue };
                let path = display_attr_path(&package.attr_path);

                let unfree = match package.info.unfree {
                    Some(unfree) => unfree,
                    None => {
                        tracing::warn!(install_id = %iid, %system, "Package has no 'unfree' metadata, assuming unfree");
                        warnings.push(format!(
                            "'{}' ({}) on '{}' does not specify 'unfree', assuming it is unfree",
                            iid, path, system
                        ));
                        true
                    }
                };
                if unfree && !allow_unfree {
                    errors.push(format!("'{}' ({}) on '{}' is unfree", iid, path, system));
                }

                let broken = match package.info.broken {
                    Some(broken) => broken,
                    None => {
                        tracing::warn!(install_id = %iid, %system, "Package has no 'broken' metadata, assuming it works");
                        warnings.push(format!(
                            "'{}' ({}) on '{}' does not specify 'broken', assuming it is not broken",
                            iid, path, system
                        ));
                        false
                    }
                };
                if broken && !allow_broken {
                    errors.push(format!("'{}' ({}) on '{}' is broken", iid, path, system));
                }
            }
        }

        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(PkgdbError::InvalidLockfile(errors.join("; ")))
        }
    }

    /// Drop registry inputs that the manifest does not declare and no
    /// package is locked to.
    pub fn remove_unused_inputs(&mut self) {
        let declared: BTreeSet<String> = self
            .manifest
            .registry
            .as_ref()
            .map(|r| r.inputs.keys().cloned().collect())
            .unwrap_or_default();
        let used: BTreeSet<String> = self
            .packages
            .values()
            .flat_map(|packages| packages.values().flatten())
            .map(|package| package.input.fingerprint.clone())
            .collect();
        let fingerprints = self.input_fingerprints();

        let keep: BTreeSet<String> = self
            .registry
            .inputs
            .keys()
            .filter(|name| {
                declared.contains(*name)
                    || fingerprints
                        .iter()
                        .any(|(fp, input)| input == *name && used.contains(fp))
            })
            .cloned()
            .collect();

        self.registry.inputs.retain(|name, _| keep.contains(name));
        self.registry.priority.retain(|name| keep.contains(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryInput, SourceLocator};
    use pretty_assertions::assert_eq;

    const REV_A: &str = "1111111111111111111111111111111111111111";
    const REV_B: &str = "2222222222222222222222222222222222222222";

    fn locked(url: &str) -> LockedInput {
        LockedInput::new(SourceLocator::parse(url).unwrap()).unwrap()
    }

    fn package(input: &LockedInput, name: &str) -> LockedPackage {
        LockedPackage {
            input: input.clone(),
            attr_path: vec![
                "legacyPackages".to_string(),
                "x86_64-linux".to_string(),
                name.to_string(),
            ],
            priority: 5,
            info: PackageInfo {
                pname: name.to_string(),
                version: Some("1.0.0".to_string()),
                license: None,
                broken: Some(false),
                unfree: Some(false),
            },
        }
    }

    fn lockfile(install: &str) -> Lockfile {
        let manifest = ManifestRaw::from_str(install).unwrap();
        let mut registry = Registry::new();
        registry.insert(
            "a",
            RegistryInput::new(SourceLocator::parse(&format!("github:acme/a/{}", REV_A)).unwrap()),
        );
        registry.insert(
            "b",
            RegistryInput::new(SourceLocator::parse(&format!("github:acme/b/{}", REV_B)).unwrap()),
        );
        Lockfile::new(manifest, registry)
    }

    fn input_a() -> LockedInput {
        locked(&format!("github:acme/a/{}", REV_A))
    }

    fn input_b() -> LockedInput {
        locked(&format!("github:acme/b/{}", REV_B))
    }

    #[test]
    fn test_valid_lockfile_round_trips() {
        let mut lockfile = lockfile(r#"{ "install": { "hello": {} } }"#);
        lockfile.packages.insert(
            "x86_64-linux".to_string(),
            BTreeMap::from([("hello".to_string(), Some(package(&input_a(), "hello")))]),
        );
        lockfile.check().unwrap();

        let parsed = Lockfile::from_str(&lockfile.to_string().unwrap()).unwrap();
        assert_eq!(parsed, lockfile);
    }

    #[test]
    fn test_unsupported_version() {
        let mut lockfile = lockfile("{}");
        lockfile.lockfile_version = 1;
        let err = Lockfile::from_str(&lockfile.to_string().unwrap()).unwrap_err();
        assert!(err.to_string().contains("unsupported lockfile version 1"));
    }

    #[test]
    fn test_unknown_field() {
        let result = Lockfile::from_str(
            r#"{ "manifest": {}, "registry": {}, "packages": {}, "lockfile-version": 0, "extra": 1 }"#,
        );
        assert!(matches!(result, Err(PkgdbError::InvalidLockfile(_))));
    }

    #[test]
    fn test_group_with_two_inputs() {
        let mut lockfile = lockfile(
            r#"{ "install": {
                "hello": { "package-group": "g" },
                "world": { "package-group": "g" }
            } }"#,
        );
        lockfile.packages.insert(
            "x86_64-linux".to_string(),
            BTreeMap::from([
                ("hello".to_string(), Some(package(&input_a(), "hello"))),
                ("world".to_string(), Some(package(&input_b(), "world"))),
            ]),
        );
        let err = lockfile.check().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid lockfile: invalid group 'g' uses multiple inputs"
        );
    }

    #[test]
    fn test_input_missing_from_registry() {
        let mut lockfile = lockfile(r#"{ "install": { "hello": {} } }"#);
        let stray = locked(&format!("github:acme/c/{}", REV_A));
        lockfile.packages.insert(
            "x86_64-linux".to_string(),
            BTreeMap::from([("hello".to_string(), Some(package(&stray, "hello")))]),
        );
        assert!(matches!(
            lockfile.check(),
            Err(PkgdbError::InvalidLockfile(_))
        ));
    }

    #[test]
    fn test_null_requires_optional() {
        let mut lockfile = lockfile(
            r#"{ "install": { "hello": {}, "maybe": { "optional": true } } }"#,
        );
        lockfile.packages.insert(
            "x86_64-linux".to_string(),
            BTreeMap::from([
                ("hello".to_string(), Some(package(&input_a(), "hello"))),
                ("maybe".to_string(), None),
            ]),
        );
        lockfile.check().unwrap();

        lockfile
            .packages
            .get_mut("x86_64-linux")
            .unwrap()
            .insert("hello".to_string(), None);
        assert!(lockfile.check().is_err());
    }

    #[test]
    fn test_check_packages_policy() {
        let mut lockfile = lockfile(
            r#"{ "options": { "allow": { "unfree": false } }, "install": { "hello": {}, "world": {} } }"#,
        );
        let mut unknown = package(&input_a(), "world");
        unknown.info.unfree = None;
        lockfile.packages.insert(
            "x86_64-linux".to_string(),
            BTreeMap::from([
                ("hello".to_string(), Some(package(&input_a(), "hello"))),
                ("world".to_string(), Some(unknown)),
            ]),
        );
        let err = lockfile.check_packages().unwrap_err();
        assert!(err.to_string().contains("'world'"));

        lockfile.manifest.options = None;
        let warnings = lockfile.check_packages().unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_remove_unused_inputs() {
        let mut lockfile = lockfile(r#"{ "install": { "hello": {} } }"#);
        lockfile.registry.priority = vec!["b".to_string(), "a".to_string()];
        lockfile.packages.insert(
            "x86_64-linux".to_string(),
            BTreeMap::from([("hello".to_string(), Some(package(&input_a(), "hello")))]),
        );
        lockfile.remove_unused_inputs();
        assert_eq!(
            lockfile.registry.inputs.keys().collect::<Vec<_>>(),
            vec!["a"]
        );
        assert_eq!(lockfile.registry.priority, vec!["a".to_string()]);
    }
}
