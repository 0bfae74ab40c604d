//! Normalized query arguments

use super::QueryError;
use crate::types::{is_supported_system, AttrPath, Subtree};
use crate::versions::SemverRange;
use serde::{Deserialize, Serialize};

/// Engine-level filter set accepted by [`super::PkgQuery`].
///
/// Higher level structures (manifest options, descriptors, search queries)
/// are flattened into this lowest-priority-first before compiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PkgQueryArgs {
    /// Exact derivation name, e.g. `hello-2.12.1`
    pub name: Option<String>,
    pub pname: Option<String>,
    pub version: Option<String>,
    /// Semantic version range
    pub semver: Option<String>,
    /// Matched against `pname`, `attrName` and `description`
    pub partial_match: Option<String>,
    /// Matched against `pname` and `attrName` only
    pub partial_name_match: Option<String>,
    /// Matched against `pname`, `attrName` and the dotted `relPath`
    pub partial_name_or_rel_path_match: Option<String>,
    /// Exact match against either `pname` or `attrName`
    pub pname_or_attr_name: Option<String>,
    /// Allowed licenses; `None` allows any
    pub licenses: Option<Vec<String>>,
    pub allow_broken: bool,
    pub allow_unfree: bool,
    pub prefer_pre_releases: bool,
    /// Subtrees in rank order; `None` searches every subtree
    pub subtrees: Option<Vec<Subtree>>,
    /// Systems in rank order
    pub systems: Vec<String>,
    /// Attribute path below `<subtree>.<system>`
    pub rel_path: Option<AttrPath>,
    /// Stop after this many results
    pub limit: Option<usize>,
    /// Keep one arbitrary row per `relPath`
    pub deduplicate: bool,
}

impl Default for PkgQueryArgs {
    fn default() -> Self {
        Self {
            name: None,
            pname: None,
            version: None,
            semver: None,
            partial_match: None,
            partial_name_match: None,
            partial_name_or_rel_path_match: None,
            pname_or_attr_name: None,
            licenses: None,
            allow_broken: false,
            allow_unfree: true,
            prefer_pre_releases: false,
            subtrees: None,
            systems: vec![pkgdb_config::loader::current_system()],
            rel_path: None,
            limit: None,
            deduplicate: false,
        }
    }
}

impl PkgQueryArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject conflicting or malformed filters
    pub fn check(&self) -> Result<(), QueryError> {
        if self.name.is_some() {
            for (field, set) in [
                ("pname", self.pname.is_some()),
                ("version", self.version.is_some()),
                ("semver", self.semver.is_some()),
            ] {
                if set {
                    return Err(QueryError::Conflict {
                        first: "name",
                        second: field,
                    });
                }
            }
        }

        if self.version.is_some() && self.semver.is_some() {
            return Err(QueryError::Conflict {
                first: "version",
                second: "semver",
            });
        }

        let partials = [
            ("partialMatch", self.partial_match.is_some()),
            ("partialNameMatch", self.partial_name_match.is_some()),
            (
                "partialNameOrRelPathMatch",
                self.partial_name_or_rel_path_match.is_some(),
            ),
        ];
        let mut set = partials.iter().filter(|(_, set)| *set).map(|(field, _)| *field);
        if let (Some(first), Some(second)) = (set.next(), set.next()) {
            return Err(QueryError::Conflict { first, second });
        }

        if let Some(range) = &self.semver {
            SemverRange::parse(range)?;
        }

        if let Some(licenses) = &self.licenses {
            if let Some(bad) = licenses.iter().find(|l| l.contains('\'')) {
                return Err(QueryError::InvalidLicense(bad.clone()));
            }
        }

        if self.systems.is_empty() {
            return Err(QueryError::InvalidField {
                field: "systems",
                reason: "at least one system is required".to_string(),
            });
        }
        if let Some(bad) = self.systems.iter().find(|s| !is_supported_system(s)) {
            return Err(QueryError::InvalidSystem(bad.clone()));
        }

        if let Some(subtrees) = &self.subtrees {
            if subtrees.is_empty() {
                return Err(QueryError::InvalidField {
                    field: "subtrees",
                    reason: "an empty list matches nothing".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Treat empty match strings and an empty license list as unset
    pub fn drop_empty_filters(&mut self) {
        for field in [
            &mut self.pname_or_attr_name,
            &mut self.partial_match,
            &mut self.partial_name_match,
            &mut self.partial_name_or_rel_path_match,
        ] {
            if field.as_deref() == Some("") {
                *field = None;
            }
        }
        if self.licenses.as_ref().is_some_and(Vec::is_empty) {
            self.licenses = None;
        }
    }

    /// Drop every filter while keeping scoping and policy settings
    pub fn clear_filters(&mut self) {
        self.name = None;
        self.pname = None;
        self.version = None;
        self.semver = None;
        self.partial_match = None;
        self.partial_name_match = None;
        self.partial_name_or_rel_path_match = None;
        self.pname_or_attr_name = None;
        self.rel_path = None;
        self.limit = None;
    }
}
