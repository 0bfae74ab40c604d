//! Environment manifests (`manifest.{json,toml,yaml}`)

mod descriptor;

pub use descriptor::{parse_install, AttrPathSpec, Descriptor, DescriptorRaw, DEFAULT_PRIORITY};

use crate::query::PkgQueryArgs;
use crate::registry::Registry;
use crate::types::InstallId;
use crate::{PkgdbError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Package policy switches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Allows {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unfree: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub licenses: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct SemverOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer_pre_releases: Option<bool>,
}

/// Options shared by every descriptor of an environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Options {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systems: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<Allows>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver: Option<SemverOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_grouping_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_strategy: Option<String>,
}

fn override_with<T: Clone>(lower: &mut Option<T>, higher: &Option<T>) {
    if higher.is_some() {
        lower.clone_from(higher);
    }
}

impl Options {
    /// Field-wise override by `higher`
    pub fn merge(&mut self, higher: &Options) {
        override_with(&mut self.systems, &higher.systems);

        if let Some(high) = &higher.allow {
            let allow = self.allow.get_or_insert_with(Allows::default);
            override_with(&mut allow.unfree, &high.unfree);
            override_with(&mut allow.broken, &high.broken);
            override_with(&mut allow.licenses, &high.licenses);
        }

        if let Some(high) = &higher.semver {
            let semver = self.semver.get_or_insert_with(SemverOptions::default);
            override_with(&mut semver.prefer_pre_releases, &high.prefer_pre_releases);
        }

        override_with(
            &mut self.package_grouping_strategy,
            &higher.package_grouping_strategy,
        );
        override_with(&mut self.activation_strategy, &higher.activation_strategy);
    }

    /// `self` overridden by `higher`
    pub fn merged(&self, higher: &Options) -> Options {
        let mut merged = self.clone();
        merged.merge(higher);
        merged
    }

    pub fn allow_unfree(&self) -> Option<bool> {
        self.allow.as_ref().and_then(|a| a.unfree)
    }

    pub fn allow_broken(&self) -> Option<bool> {
        self.allow.as_ref().and_then(|a| a.broken)
    }

    /// Apply policy and system settings to `args`
    pub fn fill_query_args(&self, args: &mut PkgQueryArgs) {
        if let Some(systems) = &self.systems {
            args.systems = systems.clone();
        }
        if let Some(allow) = &self.allow {
            if let Some(unfree) = allow.unfree {
                args.allow_unfree = unfree;
            }
            if let Some(broken) = allow.broken {
                args.allow_broken = broken;
            }
            if allow.licenses.is_some() {
                args.licenses = allow.licenses.clone();
            }
        }
        if let Some(prefer) = self.semver.as_ref().and_then(|s| s.prefer_pre_releases) {
            args.prefer_pre_releases = prefer;
        }
    }
}

/// Hook run when an environment activates
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Hook {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Manifest as written by users
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestRaw {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<Registry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Options>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub install: BTreeMap<InstallId, DescriptorRaw>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<Hook>,
}

impl ManifestRaw {
    /// Parse a JSON manifest
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        parse_document(content, Format::Json, "manifest")
    }

    /// Load a manifest, picking the format from the file extension
    pub fn from_file(path: &Path) -> Result<Self> {
        load_document(path, "manifest")
    }

    /// Serialize to pretty JSON
    pub fn to_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Options and registry shared by every environment of a user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<Registry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Options>,
}

impl GlobalManifest {
    /// Parse a JSON global manifest
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        parse_document(content, Format::Json, "global manifest")
    }

    /// Load a global manifest, picking the format from the file extension
    pub fn from_file(path: &Path) -> Result<Self> {
        load_document(path, "global manifest")
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone().unwrap_or_default()
    }

    pub fn options(&self) -> Options {
        self.options.clone().unwrap_or_default()
    }
}

/// Where a manifest's registry comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySource {
    /// Declared by the manifest (possibly empty)
    Explicit(Registry),
    /// Fixed upstream package set; manifests may not declare their own
    HardCodedDefault,
}

/// A parsed manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    raw: ManifestRaw,
    registry_source: RegistrySource,
    descriptors: BTreeMap<InstallId, Descriptor>,
}

impl Manifest {
    /// Parse a manifest that may declare its own registry
    pub fn from_raw(raw: ManifestRaw) -> Result<Self> {
        let registry_source = RegistrySource::Explicit(raw.registry.clone().unwrap_or_default());
        Self::build(raw, registry_source)
    }

    /// Parse a manifest restricted to the hard-coded default registry
    pub fn from_raw_ga(raw: ManifestRaw) -> Result<Self> {
        if raw.registry.is_some() {
            return Err(PkgdbError::InvalidManifest(
                "'registry' may not be set; only the default registry is available".to_string(),
            ));
        }
        Self::build(raw, RegistrySource::HardCodedDefault)
    }

    fn build(raw: ManifestRaw, registry_source: RegistrySource) -> Result<Self> {
        if let RegistrySource::Explicit(registry) = &registry_source {
            registry
                .validate()
                .map_err(|e| PkgdbError::InvalidManifest(e.to_string()))?;
        }
        if let Some(hook) = &raw.hook {
            if hook.script.is_some() && hook.file.is_some() {
                return Err(PkgdbError::InvalidManifest(
                    "'hook.script' and 'hook.file' are mutually exclusive".to_string(),
                ));
            }
        }
        let descriptors = parse_install(&raw.install)?;
        Ok(Self {
            raw,
            registry_source,
            descriptors,
        })
    }

    /// Load a manifest file
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_raw(ManifestRaw::from_file(path)?)
    }

    pub fn raw(&self) -> &ManifestRaw {
        &self.raw
    }

    pub fn registry_source(&self) -> &RegistrySource {
        &self.registry_source
    }

    /// The manifest's registry; `ga_registry_ref` pins the hard-coded default
    pub fn registry(&self, ga_registry_ref: &str) -> Registry {
        match &self.registry_source {
            RegistrySource::Explicit(registry) => registry.clone(),
            RegistrySource::HardCodedDefault => Registry::hard_coded_default(ga_registry_ref),
        }
    }

    pub fn options(&self) -> Options {
        self.raw.options.clone().unwrap_or_default()
    }

    pub fn descriptors(&self) -> &BTreeMap<InstallId, Descriptor> {
        &self.descriptors
    }

    /// Systems the environment is resolved for, or `default` when undeclared
    pub fn systems(&self, default: &str) -> Vec<String> {
        self.options()
            .systems
            .unwrap_or_else(|| vec![default.to_string()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Toml,
    Yaml,
}

impl Format {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" | "lock" => Some(Format::Json),
            "toml" => Some(Format::Toml),
            "yaml" | "yml" => Some(Format::Yaml),
            _ => None,
        }
    }
}

fn parse_document<T: DeserializeOwned>(content: &str, format: Format, what: &str) -> Result<T> {
    let parsed = match format {
        Format::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        Format::Toml => toml::from_str(content).map_err(|e| e.to_string()),
        Format::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
    };
    parsed.map_err(|e| PkgdbError::InvalidManifest(format!("failed to parse {}: {}", what, e)))
}

fn load_document<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let format = Format::from_path(path).ok_or_else(|| {
        PkgdbError::InvalidManifest(format!(
            "{} '{}' must be a .json, .toml or .yaml file",
            what,
            path.display()
        ))
    })?;
    let content = std::fs::read_to_string(path)?;
    parse_document(&content, format, what)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    const TOML_MANIFEST: &str = r#"
[options]
systems = ["x86_64-linux", "aarch64-darwin"]
allow.unfree = false

[install]
hello = {}
pip = { path = "python3Packages.pip", version = "^23" }

[vars]
GREETING = "hi"
"#;

    #[test]
    fn test_formats_agree() {
        let dir = TempDir::new().unwrap();
        let toml_path = dir.path().join("manifest.toml");
        fs::write(&toml_path, TOML_MANIFEST).unwrap();
        let from_toml = ManifestRaw::from_file(&toml_path).unwrap();

        let json_path = dir.path().join("manifest.json");
        fs::write(&json_path, from_toml.to_string().unwrap()).unwrap();
        let from_json = ManifestRaw::from_file(&json_path).unwrap();

        let yaml_path = dir.path().join("manifest.yaml");
        fs::write(&yaml_path, serde_yaml::to_string(&from_toml).unwrap()).unwrap();
        let from_yaml = ManifestRaw::from_file(&yaml_path).unwrap();

        assert_eq!(from_toml, from_json);
        assert_eq!(from_toml, from_yaml);
        assert_eq!(from_toml.install.len(), 2);
    }

    #[test]
    fn test_unknown_extension() {
        let result = ManifestRaw::from_file(Path::new("manifest.ini"));
        assert!(matches!(result, Err(PkgdbError::InvalidManifest(_))));
    }

    #[test]
    fn test_unknown_key_is_invalid_manifest() {
        let result = ManifestRaw::from_str(r#"{ "install": {}, "packages": {} }"#);
        assert!(matches!(result, Err(PkgdbError::InvalidManifest(_))));
    }

    #[test]
    fn test_options_merge_field_wise() {
        let global = Options {
            systems: Some(vec!["x86_64-linux".to_string()]),
            allow: Some(Allows {
                unfree: Some(false),
                broken: Some(true),
                licenses: None,
            }),
            ..Default::default()
        };
        let local = Options {
            allow: Some(Allows {
                unfree: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let merged = global.merged(&local);
        assert_eq!(merged.systems, Some(vec!["x86_64-linux".to_string()]));
        assert_eq!(merged.allow_unfree(), Some(true));
        assert_eq!(merged.allow_broken(), Some(true));
    }

    #[test]
    fn test_options_fill_query_args() {
        let options = Options {
            allow: Some(Allows {
                unfree: Some(false),
                broken: None,
                licenses: Some(vec!["MIT".to_string()]),
            }),
            semver: Some(SemverOptions {
                prefer_pre_releases: Some(true),
            }),
            ..Default::default()
        };
        let mut args = PkgQueryArgs::default();
        options.fill_query_args(&mut args);
        assert!(!args.allow_unfree);
        assert!(!args.allow_broken);
        assert!(args.prefer_pre_releases);
        assert_eq!(args.licenses, Some(vec!["MIT".to_string()]));
    }

    #[test]
    fn test_ga_manifest_rejects_registry() {
        let raw = ManifestRaw::from_str(r#"{ "registry": { "inputs": {} } }"#).unwrap();
        assert!(matches!(
            Manifest::from_raw_ga(raw.clone()),
            Err(PkgdbError::InvalidManifest(_))
        ));
        let manifest = Manifest::from_raw(raw).unwrap();
        assert!(matches!(
            manifest.registry_source(),
            RegistrySource::Explicit(_)
        ));
    }

    #[test]
    fn test_ga_manifest_uses_default_registry() {
        let manifest = Manifest::from_raw_ga(ManifestRaw::default()).unwrap();
        let registry = manifest.registry("release-23.05");
        assert_eq!(registry.priority, vec!["nixpkgs".to_string()]);
    }

    #[test]
    fn test_hook_script_and_file_conflict() {
        let raw = ManifestRaw::from_str(r#"{ "hook": { "script": "echo", "file": "hook.sh" } }"#)
            .unwrap();
        assert!(Manifest::from_raw(raw).is_err());
    }
}
