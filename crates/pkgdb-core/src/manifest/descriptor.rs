//! Install descriptors
//!
//! A [`DescriptorRaw`] is what users write under `install.<id>`. It is parsed
//! into a [`Descriptor`], whose fields map directly onto query arguments.

use crate::query::PkgQueryArgs;
use crate::types::{parse_attr_path, AttrPath, InstallId, Subtree};
use crate::versions::{is_date, is_semver, is_semver_range};
use crate::{PkgdbError, Result};
use serde::{Deserialize, Serialize};

/// Priority used when a descriptor does not set one
pub const DEFAULT_PRIORITY: u64 = 5;

/// An attribute path written either dotted or as a list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrPathSpec {
    Dotted(String),
    Parts(Vec<String>),
}

impl AttrPathSpec {
    pub fn to_path(&self) -> AttrPath {
        match self {
            AttrPathSpec::Dotted(path) => parse_attr_path(path),
            AttrPathSpec::Parts(parts) => parts.clone(),
        }
    }
}

/// Descriptor as written in a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DescriptorRaw {
    /// Matches either `pname` or the attribute name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pname: Option<String>,
    /// Exact version, or a semantic version range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Attribute path below `<subtree>.<system>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<AttrPathSpec>,
    /// `<subtree>.<system>.<path...>`; a system of `*` matches any system
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abspath: Option<AttrPathSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub systems: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_group: Option<String>,
    /// Registry input this descriptor must resolve in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u64>,
}

/// Parsed descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// `pname` or attribute name
    pub name: Option<String>,
    pub pname: Option<String>,
    /// Exact version
    pub version: Option<String>,
    /// Semantic version range
    pub semver: Option<String>,
    pub prefer_pre_releases: bool,
    pub subtree: Option<Subtree>,
    /// Systems to install on; `None` means every system of the environment
    pub systems: Option<Vec<String>>,
    /// Attribute path below `<subtree>.<system>`
    pub path: Option<AttrPath>,
    pub optional: bool,
    pub group: Option<String>,
    /// Forced registry input
    pub input: Option<String>,
    pub priority: u64,
}

fn invalid(iid: &str, reason: impl std::fmt::Display) -> PkgdbError {
    PkgdbError::InvalidManifest(format!("install.{}: {}", iid, reason))
}

/// Split a version string into an exact version or a semantic version range
fn parse_version(version: &str) -> (Option<String>, Option<String>) {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return (None, Some(String::new()));
    }
    if let Some(exact) = trimmed.strip_prefix('=') {
        return (Some(exact.to_string()), None);
    }
    if trimmed.starts_with(['*', '~', '^', '>', '<']) {
        return (None, Some(trimmed.to_string()));
    }
    if is_semver(trimmed) || is_date(trimmed) || !is_semver_range(trimmed) {
        (Some(trimmed.to_string()), None)
    } else {
        (None, Some(trimmed.to_string()))
    }
}

/// `~1.2.3-beta` style ranges ask for pre-releases
fn wants_pre_releases(range: &str) -> bool {
    range
        .strip_prefix('~')
        .and_then(|rest| rest.split(' ').next())
        .and_then(|token| token.find('-'))
        .is_some_and(|idx| idx > 0)
}

impl Descriptor {
    /// Parse the descriptor installed as `iid`
    pub fn from_raw(iid: &str, raw: &DescriptorRaw) -> Result<Self> {
        let mut descriptor = Descriptor {
            name: raw.name.clone(),
            pname: raw.pname.clone(),
            version: None,
            semver: None,
            prefer_pre_releases: false,
            subtree: None,
            systems: raw.systems.clone(),
            path: raw.path.as_ref().map(AttrPathSpec::to_path),
            optional: raw.optional.unwrap_or(false),
            group: raw.package_group.clone(),
            input: raw.package_repository.clone(),
            priority: raw.priority.unwrap_or(DEFAULT_PRIORITY),
        };

        if let Some(version) = &raw.version {
            let (exact, semver) = parse_version(version);
            descriptor.prefer_pre_releases = semver.as_deref().is_some_and(wants_pre_releases);
            descriptor.version = exact;
            descriptor.semver = semver;
        }

        if let Some(abspath) = &raw.abspath {
            descriptor.apply_abspath(iid, &abspath.to_path())?;
        }

        if descriptor.name.is_none() && descriptor.pname.is_none() && descriptor.path.is_none() {
            descriptor.name = Some(iid.to_string());
        }

        if let Some(systems) = &descriptor.systems {
            if systems.is_empty() {
                return Err(invalid(iid, "'systems' may not be empty"));
            }
        }
        Ok(descriptor)
    }

    fn apply_abspath(&mut self, iid: &str, parts: &[String]) -> Result<()> {
        if parts.len() < 3 {
            return Err(invalid(iid, "'abspath' must have at least three parts"));
        }
        if self.path.is_some() {
            return Err(invalid(iid, "'path' conflicts with 'abspath'"));
        }
        let subtree = parts[0]
            .parse::<Subtree>()
            .map_err(|_| invalid(iid, "'abspath' must have a subtree as its first element"))?;
        if parts[2..].iter().any(|p| p == "*") {
            return Err(invalid(
                iid,
                "'abspath' may only have a glob as its second element",
            ));
        }

        let system = parts[1].as_str();
        if system != "*" && system != "null" {
            match &self.systems {
                Some(systems) if !systems.iter().any(|s| s == system) => {
                    return Err(invalid(
                        iid,
                        "'systems' conflicts with the system in 'abspath'",
                    ));
                }
                _ => self.systems = Some(vec![system.to_string()]),
            }
        }

        self.subtree = Some(subtree);
        self.path = Some(parts[2..].to_vec());
        Ok(())
    }

    /// Whether this descriptor installs anything on `system`
    pub fn applies_to(&self, system: &str) -> bool {
        self.systems
            .as_ref()
            .map_or(true, |systems| systems.iter().any(|s| s == system))
    }

    /// Whether the descriptor names an exact attribute path and nothing to search for
    pub fn is_path_only(&self) -> bool {
        self.path.is_some()
            && self.subtree.is_some()
            && self.name.is_none()
            && self.pname.is_none()
            && self.version.is_none()
            && self.semver.is_none()
    }

    /// Narrow `args` to packages matching this descriptor
    pub fn fill_query_args(&self, args: &mut PkgQueryArgs) {
        args.pname_or_attr_name = self.name.clone();
        args.pname = self.pname.clone();
        args.version = self.version.clone();
        args.semver = self.semver.clone();
        if self.prefer_pre_releases {
            args.prefer_pre_releases = true;
        }
        if let Some(subtree) = self.subtree {
            args.subtrees = Some(vec![subtree]);
        }
        args.rel_path = self.path.clone();
    }
}

/// Parse every descriptor of an `install` table
pub fn parse_install(
    install: &std::collections::BTreeMap<InstallId, DescriptorRaw>,
) -> Result<std::collections::BTreeMap<InstallId, Descriptor>> {
    install
        .iter()
        .map(|(iid, raw)| Ok((iid.clone(), Descriptor::from_raw(iid, raw)?)))
        .collect()
}
