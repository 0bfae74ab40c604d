//! Package-source registries
//!
//! A registry is a named set of package-source inputs plus a priority list.
//! Inputs are described by a [`SourceLocator`]; locking pins every locator to
//! an exact revision so that a lockfile can be replayed.

use crate::provider::PackageProvider;
use crate::query::PkgQueryArgs;
use crate::types::Subtree;
use crate::{PkgdbError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the input in the hard-coded default registry
pub const DEFAULT_INPUT_NAME: &str = "nixpkgs";

/// Where a package source lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum SourceLocator {
    /// GitHub repository
    Github {
        owner: String,
        repo: String,
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rev: Option<String>,
    },
    /// Arbitrary git repository
    Git {
        url: String,
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rev: Option<String>,
    },
    /// Local directory
    Path {
        path: String,
        #[serde(rename = "narHash", default, skip_serializing_if = "Option::is_none")]
        nar_hash: Option<String>,
    },
    /// Archive fetched over HTTP
    Tarball {
        url: String,
        #[serde(rename = "narHash", default, skip_serializing_if = "Option::is_none")]
        nar_hash: Option<String>,
    },
    /// Symbolic name resolved through a user registry; never lockable here
    Indirect {
        id: String,
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
}

fn looks_like_rev(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Split `base?k=v&k2=v2` into the base and its query parameters
fn split_query(url: &str) -> (&str, BTreeMap<String, String>) {
    match url.split_once('?') {
        Some((base, query)) => {
            let params = query
                .split('&')
                .filter_map(|kv| kv.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            (base, params)
        }
        None => (url, BTreeMap::new()),
    }
}

fn with_query(base: String, params: &[(&str, &Option<String>)]) -> String {
    let query: Vec<String> = params
        .iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| format!("{}={}", k, v)))
        .collect();
    if query.is_empty() {
        base
    } else {
        format!("{}?{}", base, query.join("&"))
    }
}

impl SourceLocator {
    /// Parse a URL-like reference such as `github:NixOS/nixpkgs/release-23.05`
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| PkgdbError::InvalidRegistry(format!("'{}': {}", url, reason));
        let (base, mut params) = split_query(url.trim());

        if let Some(rest) = base.strip_prefix("github:") {
            let mut parts = rest.split('/');
            let owner = parts.next().filter(|s| !s.is_empty());
            let repo = parts.next().filter(|s| !s.is_empty());
            let (Some(owner), Some(repo)) = (owner, repo) else {
                return Err(invalid("expected github:<owner>/<repo>[/<ref-or-rev>]"));
            };
            let mut reference = params.remove("ref");
            let mut rev = params.remove("rev");
            if let Some(third) = parts.next() {
                if looks_like_rev(third) {
                    rev = Some(third.to_string());
                } else {
                    reference = Some(third.to_string());
                }
            }
            if parts.next().is_some() {
                return Err(invalid("too many path components"));
            }
            return Ok(SourceLocator::Github {
                owner: owner.to_string(),
                repo: repo.to_string(),
                reference,
                rev,
            });
        }

        if let Some(rest) = base.strip_prefix("git+") {
            return Ok(SourceLocator::Git {
                url: rest.to_string(),
                reference: params.remove("ref"),
                rev: params.remove("rev"),
            });
        }

        if let Some(rest) = base.strip_prefix("path:") {
            return Ok(SourceLocator::Path {
                path: rest.to_string(),
                nar_hash: params.remove("narHash"),
            });
        }
        if base.starts_with('/') || base.starts_with("./") || base.starts_with("../") {
            return Ok(SourceLocator::Path {
                path: base.to_string(),
                nar_hash: params.remove("narHash"),
            });
        }

        if let Some(rest) = base.strip_prefix("tarball+") {
            return Ok(SourceLocator::Tarball {
                url: rest.to_string(),
                nar_hash: params.remove("narHash"),
            });
        }
        if (base.starts_with("https://") || base.starts_with("http://"))
            && [".tar.gz", ".tgz", ".tar.xz", ".tar.zst", ".zip"]
                .iter()
                .any(|ext| base.ends_with(ext))
        {
            return Ok(SourceLocator::Tarball {
                url: base.to_string(),
                nar_hash: params.remove("narHash"),
            });
        }

        let id = base.strip_prefix("flake:").unwrap_or(base);
        if id.is_empty() || id.contains(':') {
            return Err(invalid("unsupported source locator"));
        }
        let (id, reference) = match id.split_once('/') {
            Some((id, reference)) => (id, Some(reference.to_string())),
            None => (id, None),
        };
        Ok(SourceLocator::Indirect {
            id: id.to_string(),
            reference,
        })
    }

    /// Render back to URL form
    pub fn to_url(&self) -> String {
        match self {
            SourceLocator::Github {
                owner,
                repo,
                reference,
                rev,
            } => {
                let base = format!("github:{}/{}", owner, repo);
                match (rev, reference) {
                    (Some(rev), _) => format!("{}/{}", base, rev),
                    (None, Some(reference)) => format!("{}/{}", base, reference),
                    (None, None) => base,
                }
            }
            SourceLocator::Git {
                url,
                reference,
                rev,
            } => with_query(
                format!("git+{}", url),
                &[("ref", reference), ("rev", rev)],
            ),
            SourceLocator::Path { path, nar_hash } => {
                with_query(format!("path:{}", path), &[("narHash", nar_hash)])
            }
            SourceLocator::Tarball { url, nar_hash } => {
                with_query(format!("tarball+{}", url), &[("narHash", nar_hash)])
            }
            SourceLocator::Indirect { id, reference } => match reference {
                Some(reference) => format!("flake:{}/{}", id, reference),
                None => format!("flake:{}", id),
            },
        }
    }

    /// Whether the locator pins an exact, reproducible revision
    pub fn is_locked(&self) -> bool {
        match self {
            SourceLocator::Github { rev, .. } | SourceLocator::Git { rev, .. } => rev.is_some(),
            SourceLocator::Path { nar_hash, .. } | SourceLocator::Tarball { nar_hash, .. } => {
                nar_hash.is_some()
            }
            SourceLocator::Indirect { .. } => false,
        }
    }

    pub fn is_indirect(&self) -> bool {
        matches!(self, SourceLocator::Indirect { .. })
    }

    /// Revision a locked locator is pinned to, for diagnostics
    pub fn revision(&self) -> Option<&str> {
        match self {
            SourceLocator::Github { rev, .. } | SourceLocator::Git { rev, .. } => rev.as_deref(),
            SourceLocator::Path { nar_hash, .. } | SourceLocator::Tarball { nar_hash, .. } => {
                nar_hash.as_deref()
            }
            SourceLocator::Indirect { .. } => None,
        }
    }

    /// The locator with its pin removed, identifying the source itself
    pub fn unlocked(&self) -> SourceLocator {
        let mut unlocked = self.clone();
        match &mut unlocked {
            SourceLocator::Github { rev, .. } | SourceLocator::Git { rev, .. } => *rev = None,
            SourceLocator::Path { nar_hash, .. } | SourceLocator::Tarball { nar_hash, .. } => {
                *nar_hash = None
            }
            SourceLocator::Indirect { .. } => {}
        }
        unlocked
    }

    /// The source itself, independent of branch or revision
    pub fn source_key(&self) -> String {
        let mut bare = self.unlocked();
        match &mut bare {
            SourceLocator::Github { reference, .. }
            | SourceLocator::Git { reference, .. }
            | SourceLocator::Indirect { reference, .. } => *reference = None,
            SourceLocator::Path { .. } | SourceLocator::Tarball { .. } => {}
        }
        bare.to_url()
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

/// Accept either a URL string or an attribute set for a locator
fn locator_from_str_or_attrs<'de, D>(deserializer: D) -> std::result::Result<SourceLocator, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrAttrs {
        Url(String),
        Attrs(SourceLocator),
    }

    match StringOrAttrs::deserialize(deserializer)? {
        StringOrAttrs::Url(url) => SourceLocator::parse(&url).map_err(serde::de::Error::custom),
        StringOrAttrs::Attrs(locator) => Ok(locator),
    }
}

/// Preferences applied to every input unless the input overrides them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtrees: Option<Vec<Subtree>>,
}

impl InputPreferences {
    /// Field-wise override by `higher`
    pub fn merge(&mut self, higher: &InputPreferences) {
        if higher.subtrees.is_some() {
            self.subtrees = higher.subtrees.clone();
        }
    }
}

/// One named package source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryInput {
    #[serde(deserialize_with = "locator_from_str_or_attrs")]
    pub from: SourceLocator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtrees: Option<Vec<Subtree>>,
}

impl RegistryInput {
    pub fn new(from: SourceLocator) -> Self {
        Self {
            from,
            subtrees: None,
        }
    }

    /// Subtrees searched in this input
    pub fn effective_subtrees(&self, defaults: &InputPreferences) -> Vec<Subtree> {
        self.subtrees
            .clone()
            .or_else(|| defaults.subtrees.clone())
            .unwrap_or_else(|| Subtree::ALL.to_vec())
    }

    /// Scope `args` to this input's subtrees
    pub fn fill_query_args(&self, defaults: &InputPreferences, args: &mut PkgQueryArgs) {
        args.subtrees = Some(self.effective_subtrees(defaults));
    }
}

/// Registry as written by users (`RegistryRaw`); also the locked form once
/// every input carries a pinned locator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Registry {
    #[serde(default)]
    pub inputs: BTreeMap<String, RegistryInput>,
    #[serde(default, skip_serializing_if = "is_default_preferences")]
    pub defaults: InputPreferences,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priority: Vec<String>,
}

fn is_default_preferences(prefs: &InputPreferences) -> bool {
    prefs == &InputPreferences::default()
}

/// `higher` followed by the members of `lower` it does not already contain
fn merge_priority(lower: &[String], higher: &[String]) -> Vec<String> {
    let mut merged = higher.to_vec();
    for name in lower {
        if !merged.contains(name) {
            merged.push(name.clone());
        }
    }
    merged
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry used when a manifest may not declare its own
    pub fn hard_coded_default(reference: &str) -> Self {
        let (reference, rev) = if looks_like_rev(reference) {
            (None, Some(reference.to_string()))
        } else {
            (Some(reference.to_string()), None)
        };
        let mut inputs = BTreeMap::new();
        inputs.insert(
            DEFAULT_INPUT_NAME.to_string(),
            RegistryInput {
                from: SourceLocator::Github {
                    owner: "NixOS".to_string(),
                    repo: "nixpkgs".to_string(),
                    reference,
                    rev,
                },
                subtrees: Some(vec![Subtree::LegacyPackages]),
            },
        );
        Self {
            inputs,
            defaults: InputPreferences::default(),
            priority: vec![DEFAULT_INPUT_NAME.to_string()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&RegistryInput> {
        self.inputs.get(name)
    }

    /// Add or replace an input
    pub fn insert(&mut self, name: impl Into<String>, input: RegistryInput) {
        self.inputs.insert(name.into(), input);
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for name in &self.priority {
            if !seen.insert(name) {
                return Err(PkgdbError::InvalidRegistry(format!(
                    "input '{}' appears more than once in 'priority'",
                    name
                )));
            }
            if !self.inputs.contains_key(name) {
                return Err(PkgdbError::InvalidRegistry(format!(
                    "'priority' names unknown input '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Override this registry with `higher`: inputs are replaced per key,
    /// defaults are merged field-wise and `higher`'s priority comes first.
    pub fn merge(&mut self, higher: &Registry) {
        for (name, input) in &higher.inputs {
            self.inputs.insert(name.clone(), input.clone());
        }
        self.defaults.merge(&higher.defaults);
        self.priority = merge_priority(&self.priority, &higher.priority);
    }

    /// Inputs in traversal order: the priority list, then the rest by name
    pub fn order(&self) -> Vec<(&str, &RegistryInput)> {
        let mut ordered: Vec<(&str, &RegistryInput)> = self
            .priority
            .iter()
            .filter_map(|name| self.inputs.get_key_value(name))
            .map(|(name, input)| (name.as_str(), input))
            .collect();
        for (name, input) in &self.inputs {
            if !self.priority.contains(name) {
                ordered.push((name.as_str(), input));
            }
        }
        ordered
    }

    /// Whether every input is pinned
    pub fn is_locked(&self) -> bool {
        self.inputs.values().all(|input| input.from.is_locked())
    }

    /// Pin every input to an exact revision.
    ///
    /// Already locked inputs are kept as they are, so locking a locked
    /// registry is a no-op. Indirect locators cannot be locked.
    pub fn lock(&self, provider: &dyn PackageProvider) -> Result<Registry> {
        let mut locked = self.clone();
        for (name, input) in locked.inputs.iter_mut() {
            if input.from.is_indirect() {
                return Err(PkgdbError::InvalidRegistry(format!(
                    "input '{}' uses the indirect reference '{}'",
                    name, input.from
                )));
            }
            if input.from.is_locked() {
                continue;
            }
            let pinned = provider.lock_source(&input.from)?;
            if !pinned.is_locked() {
                return Err(PkgdbError::InvalidRegistry(format!(
                    "input '{}' could not be locked: '{}' is not pinned",
                    name, pinned
                )));
            }
            tracing::debug!(input = %name, locked = %pinned, "Locked registry input");
            input.from = pinned;
        }
        Ok(locked)
    }

    /// Locked inputs in traversal order
    pub fn locked_inputs(&self) -> Result<Vec<(String, LockedInput)>> {
        self.order()
            .into_iter()
            .map(|(name, input)| Ok((name.to_string(), LockedInput::new(input.from.clone())?)))
            .collect()
    }

    /// Scope `args` to the subtrees of input `name`
    pub fn fill_query_args(&self, name: &str, args: &mut PkgQueryArgs) -> Result<()> {
        let input = self.inputs.get(name).ok_or_else(|| {
            PkgdbError::InvalidRegistry(format!("no such input '{}'", name))
        })?;
        input.fill_query_args(&self.defaults, args);
        Ok(())
    }
}

/// A source pinned to an exact revision, keyed by a content fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockedInput {
    pub fingerprint: String,
    pub url: String,
    pub attrs: SourceLocator,
}

impl LockedInput {
    /// Fingerprint a locked locator
    pub fn new(locator: SourceLocator) -> Result<Self> {
        if !locator.is_locked() {
            return Err(PkgdbError::InvalidRegistry(format!(
                "'{}' is not locked",
                locator
            )));
        }
        let url = locator.to_url();
        Ok(Self {
            fingerprint: fingerprint(&url),
            url,
            attrs: locator,
        })
    }
}

/// Stable hash of a locked source URL
pub fn fingerprint(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FixtureProvider;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const REV: &str = "e8039594435c68eb4f780f3e9bf3972a7399c4b1";

    fn input(url: &str) -> RegistryInput {
        RegistryInput::new(SourceLocator::parse(url).unwrap())
    }

    #[rstest]
    #[case("github:NixOS/nixpkgs/release-23.05")]
    #[case("github:NixOS/nixpkgs/e8039594435c68eb4f780f3e9bf3972a7399c4b1")]
    #[case("git+https://example.com/pkgs.git?ref=main&rev=e8039594435c68eb4f780f3e9bf3972a7399c4b1")]
    #[case("path:/srv/pkgs")]
    #[case("tarball+https://example.com/pkgs.tar.gz?narHash=sha256-abc")]
    #[case("flake:nixpkgs")]
    fn test_locator_url_round_trip(#[case] url: &str) {
        let locator = SourceLocator::parse(url).unwrap();
        assert_eq!(locator.to_url(), url);
    }

    #[test]
    fn test_github_third_component() {
        let by_ref = SourceLocator::parse("github:NixOS/nixpkgs/release-23.05").unwrap();
        assert!(!by_ref.is_locked());
        let by_rev = SourceLocator::parse(&format!("github:NixOS/nixpkgs/{}", REV)).unwrap();
        assert!(by_rev.is_locked());
        assert_eq!(by_rev.revision(), Some(REV));
    }

    #[test]
    fn test_bare_name_is_indirect() {
        let locator = SourceLocator::parse("nixpkgs").unwrap();
        assert!(locator.is_indirect());
        assert!(!locator.is_locked());
    }

    #[test]
    fn test_order_priority_then_lexicographic() {
        let mut registry = Registry::new();
        registry.insert("zeta", input("github:acme/zeta"));
        registry.insert("alpha", input("github:acme/alpha"));
        registry.insert("mid", input("github:acme/mid"));
        registry.priority = vec!["mid".to_string()];

        let names: Vec<&str> = registry.order().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["mid", "alpha", "zeta"]);
    }

    #[test]
    fn test_merge_overrides_and_recomputes_priority() {
        let mut lower = Registry::new();
        lower.insert("nixpkgs", input("github:NixOS/nixpkgs/release-23.05"));
        lower.insert("extra", input("github:acme/extra"));
        lower.priority = vec!["nixpkgs".to_string(), "extra".to_string()];

        let mut higher = Registry::new();
        higher.insert("nixpkgs", input("github:NixOS/nixpkgs/release-23.11"));
        higher.insert("mine", input("github:me/pkgs"));
        higher.priority = vec!["mine".to_string()];
        higher.defaults.subtrees = Some(vec![Subtree::Packages]);

        lower.merge(&higher);

        assert_eq!(
            lower.get("nixpkgs").unwrap().from.to_url(),
            "github:NixOS/nixpkgs/release-23.11"
        );
        assert_eq!(lower.priority, vec!["mine", "nixpkgs", "extra"]);
        assert_eq!(lower.defaults.subtrees, Some(vec![Subtree::Packages]));
    }

    #[test]
    fn test_validate_unknown_priority() {
        let mut registry = Registry::new();
        registry.priority = vec!["ghost".to_string()];
        assert!(matches!(
            registry.validate(),
            Err(PkgdbError::InvalidRegistry(_))
        ));
    }

    #[test]
    fn test_lock_rejects_indirect() {
        let mut registry = Registry::new();
        registry.insert("nixpkgs", input("flake:nixpkgs"));
        let provider = FixtureProvider::new();

        let err = registry.lock(&provider).unwrap_err();
        assert!(matches!(err, PkgdbError::InvalidRegistry(_)));
    }

    #[test]
    fn test_lock_is_idempotent() {
        let mut registry = Registry::new();
        registry.insert("nixpkgs", input("github:NixOS/nixpkgs/release-23.05"));
        let provider = FixtureProvider::new().with_source("github:NixOS/nixpkgs", REV, vec![]);

        let locked = registry.lock(&provider).unwrap();
        assert!(locked.is_locked());
        assert_eq!(locked.get("nixpkgs").unwrap().from.revision(), Some(REV));

        let relocked = locked.lock(&FixtureProvider::new()).unwrap();
        assert_eq!(relocked, locked);
    }

    #[test]
    fn test_registry_deserializes_url_and_attrs() {
        let json = serde_json::json!({
            "inputs": {
                "nixpkgs": { "from": "github:NixOS/nixpkgs/release-23.05" },
                "local": {
                    "from": { "type": "path", "path": "/srv/pkgs" },
                    "subtrees": ["packages"]
                }
            },
            "defaults": { "subtrees": ["legacyPackages"] },
            "priority": ["local", "nixpkgs"]
        });
        let registry: Registry = serde_json::from_value(json).unwrap();
        registry.validate().unwrap();

        let mut args = PkgQueryArgs::default();
        registry.fill_query_args("nixpkgs", &mut args).unwrap();
        assert_eq!(args.subtrees, Some(vec![Subtree::LegacyPackages]));
        registry.fill_query_args("local", &mut args).unwrap();
        assert_eq!(args.subtrees, Some(vec![Subtree::Packages]));
    }

    #[test]
    fn test_registry_rejects_unknown_fields() {
        let json = serde_json::json!({ "inputs": {}, "order": [] });
        assert!(serde_json::from_value::<Registry>(json).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let locator = SourceLocator::parse(&format!("github:NixOS/nixpkgs/{}", REV)).unwrap();
        let a = LockedInput::new(locator.clone()).unwrap();
        let b = LockedInput::new(locator).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);
    }
}
