//! Shared vocabulary types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Systems a query may be scoped to
pub const SUPPORTED_SYSTEMS: [&str; 4] = [
    "x86_64-linux",
    "aarch64-linux",
    "x86_64-darwin",
    "aarch64-darwin",
];

/// Attribute path below an input's root, e.g. `["legacyPackages", "x86_64-linux", "hello"]`
pub type AttrPath = Vec<String>;

/// Key of a descriptor in a manifest's `install` table
pub type InstallId = String;

/// Row id of a package in a package database
pub type RowId = i64;

/// Top-level category partition of an input's package namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Subtree {
    #[serde(rename = "packages")]
    Packages,
    #[serde(rename = "legacyPackages")]
    LegacyPackages,
}

impl Subtree {
    pub const ALL: [Subtree; 2] = [Subtree::Packages, Subtree::LegacyPackages];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subtree::Packages => "packages",
            Subtree::LegacyPackages => "legacyPackages",
        }
    }
}

impl fmt::Display for Subtree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subtree {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "packages" => Ok(Subtree::Packages),
            "legacyPackages" => Ok(Subtree::LegacyPackages),
            other => Err(format!(
                "unknown subtree '{}', expected 'packages' or 'legacyPackages'",
                other
            )),
        }
    }
}

/// Whether `system` is one of [`SUPPORTED_SYSTEMS`]
pub fn is_supported_system(system: &str) -> bool {
    SUPPORTED_SYSTEMS.contains(&system)
}

/// Render an attribute path the way users write it: `a.b."c.d"`
pub fn display_attr_path(path: &[String]) -> String {
    path.iter()
        .map(|part| {
            if part.contains('.') {
                format!("\"{}\"", part)
            } else {
                part.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Split a dotted attribute path, honouring double-quoted components
pub fn parse_attr_path(path: &str) -> AttrPath {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in path.chars() {
        match c {
            '"' => quoted = !quoted,
            '.' if !quoted => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}
