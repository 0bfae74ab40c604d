//! Package search across every input of an environment's registry

use crate::db::PackageRow;
use crate::lockfile::Lockfile;
use crate::manifest::{GlobalManifest, Manifest, ManifestRaw};
use crate::provider::PackageProvider;
use crate::query::{PkgQuery, PkgQueryArgs};
use crate::resolver::Environment;
use crate::types::{AttrPath, RowId, Subtree};
use crate::{PkgdbError, Result};
use pkgdb_config::Settings;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Filters of a search, the `query` field of [`SearchParams`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchQuery {
    /// Exact derivation name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semver: Option<String>,
    /// Matched against `pname`, attribute name and description
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub partial_match: Option<String>,
    /// Matched against `pname` and attribute name
    #[serde(rename = "match-name", skip_serializing_if = "Option::is_none")]
    pub partial_name_match: Option<String>,
    /// Matched against `pname`, attribute name and the dotted relative path
    #[serde(rename = "match-name-or-rel-path", skip_serializing_if = "Option::is_none")]
    pub partial_name_or_rel_path_match: Option<String>,
    /// Report one result per relative path
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deduplicate: bool,
}

impl<'de> Deserialize<'de> for SearchQuery {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let fields = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut query = SearchQuery::default();
        for (key, value) in fields {
            let string = |value: serde_json::Value| match value {
                serde_json::Value::Null => Ok(None),
                serde_json::Value::String(text) => Ok(Some(text)),
                _ => Err(D::Error::custom(format!("'query.{}' must be a string", key))),
            };
            match key.as_str() {
                "name" => query.name = string(value)?,
                "pname" => query.pname = string(value)?,
                "version" => query.version = string(value)?,
                "semver" => query.semver = string(value)?,
                "match" => query.partial_match = string(value)?,
                "match-name" => query.partial_name_match = string(value)?,
                "match-name-or-rel-path" => query.partial_name_or_rel_path_match = string(value)?,
                "deduplicate" => {
                    query.deduplicate = match value {
                        serde_json::Value::Null => false,
                        serde_json::Value::Bool(flag) => flag,
                        _ => return Err(D::Error::custom("'query.deduplicate' must be a boolean")),
                    }
                }
                "name-match" => {
                    return Err(D::Error::custom(
                        "unknown key 'query.name-match', did you mean 'query.match-name'?",
                    ))
                }
                other => {
                    return Err(D::Error::custom(format!(
                        "unknown key 'query.{}'",
                        other
                    )))
                }
            }
        }
        Ok(query)
    }
}

impl SearchQuery {
    /// Apply the filters on top of `args`, keeping its policy settings
    pub fn fill_query_args(&self, args: &mut PkgQueryArgs) {
        args.name = self.name.clone();
        args.pname = self.pname.clone();
        args.version = self.version.clone();
        args.semver = self.semver.clone();
        args.partial_match = self.partial_match.clone();
        args.partial_name_match = self.partial_name_match.clone();
        args.partial_name_or_rel_path_match = self.partial_name_or_rel_path_match.clone();
        args.deduplicate = self.deduplicate;
    }
}

/// A document given either as a path or inline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathOrInline<T> {
    Path(PathBuf),
    Inline(T),
}

impl<T: Clone> PathOrInline<T> {
    fn load(&self, from_file: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        match self {
            PathOrInline::Path(path) => from_file(path),
            PathOrInline::Inline(value) => Ok(value.clone()),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for PathOrInline<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(path) => Ok(PathOrInline::Path(PathBuf::from(path))),
            value => serde_json::from_value(value)
                .map(PathOrInline::Inline)
                .map_err(D::Error::custom),
        }
    }
}

impl<T: Serialize> Serialize for PathOrInline<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            PathOrInline::Path(path) => path.serialize(serializer),
            PathOrInline::Inline(value) => value.serialize(serializer),
        }
    }
}

/// Parameters of a search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SearchParams {
    pub global_manifest: PathOrInline<GlobalManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathOrInline<ManifestRaw>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockfile: Option<PathOrInline<Lockfile>>,
    #[serde(default)]
    pub query: SearchQuery,
}

impl SearchParams {
    /// Parse JSON search parameters
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| PkgdbError::InvalidSearchParams(e.to_string()))
    }

    /// Load JSON search parameters from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Inline JSON when `arg` is an object, otherwise a path to a file
    pub fn from_arg(arg: &str) -> Result<Self> {
        if arg.trim_start().starts_with('{') {
            Self::from_str(arg)
        } else {
            Self::from_file(Path::new(arg))
        }
    }

    pub fn load_global_manifest(&self) -> Result<GlobalManifest> {
        self.global_manifest.load(GlobalManifest::from_file)
    }

    pub fn load_manifest(&self) -> Result<ManifestRaw> {
        match &self.manifest {
            Some(manifest) => manifest.load(ManifestRaw::from_file),
            None => Ok(ManifestRaw::default()),
        }
    }

    pub fn load_lockfile(&self) -> Result<Option<Lockfile>> {
        let Some(lockfile) = &self.lockfile else {
            return Ok(None);
        };
        let lockfile = lockfile.load(Lockfile::from_file)?;
        lockfile.check()?;
        Ok(Some(lockfile))
    }
}

/// One search result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: RowId,
    pub input: String,
    pub subtree: Subtree,
    pub abs_path: AttrPath,
    pub rel_path: AttrPath,
    pub pname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    pub broken: Option<bool>,
    pub unfree: Option<bool>,
    pub system: String,
}

impl SearchResult {
    fn new(input: &str, row: PackageRow) -> Self {
        Self {
            id: row.id,
            input: input.to_string(),
            subtree: row.subtree,
            abs_path: row.abs_path,
            rel_path: row.rel_path,
            pname: row.pname,
            version: row.version,
            description: row.description,
            license: row.license,
            broken: row.broken,
            unfree: row.unfree,
            system: row.system,
        }
    }
}

/// A search prepared against the registry of an environment
#[derive(Debug)]
pub struct Search {
    env: Environment,
    query: SearchQuery,
}

impl Search {
    /// Load every document named by `params`.
    ///
    /// With `ga_registry` the manifest may not declare a registry and the
    /// hard-coded default registry is used instead.
    pub fn new(
        params: &SearchParams,
        settings: &Settings,
        provider: Arc<dyn PackageProvider>,
        ga_registry: bool,
    ) -> Result<Self> {
        let global = params.load_global_manifest()?;
        let raw = params.load_manifest()?;
        let manifest = if ga_registry {
            Manifest::from_raw_ga(raw)?
        } else {
            Manifest::from_raw(raw)?
        };

        let mut env = Environment::new(manifest, global, settings.clone(), provider);
        if let Some(lockfile) = params.load_lockfile()? {
            env = env.with_lockfile(lockfile);
        }
        Ok(Self {
            env,
            query: params.query.clone(),
        })
    }

    /// Take part in database locking as `owner` instead of this process
    pub fn with_lock_owner(mut self, owner: u32) -> Self {
        self.env = self.env.with_lock_owner(owner);
        self
    }

    /// Query arguments before per-input scoping: options, then the query
    pub fn query_args(&self) -> PkgQueryArgs {
        let mut args = PkgQueryArgs::default();
        self.env.options().fill_query_args(&mut args);
        args.systems = self.env.systems();
        self.query.fill_query_args(&mut args);
        args
    }

    /// The compiled query, unscoped to any input
    pub fn query(&self) -> Result<PkgQuery> {
        Ok(PkgQuery::new(self.query_args())?)
    }

    /// Search every input in priority order, handing each result to `emit`
    /// as soon as its input has been searched.
    ///
    /// Returns the number of results.
    pub fn run(&self, mut emit: impl FnMut(&SearchResult) -> Result<()>) -> Result<usize> {
        let base = self.query_args();
        // Reject bad filters before anything is scraped
        PkgQuery::new(base.clone())?;

        let registry = self.env.locked_registry()?;
        let mut count = 0;
        for (name, _) in registry.order() {
            let input = self.env.db_input(&registry, name)?;
            let db = input.db(&base.systems)?;

            let mut args = base.clone();
            input.fill_query_args(&mut args);
            let query = PkgQuery::new(args)?;

            let ids = db.execute(&query)?;
            tracing::debug!(input = %name, results = ids.len(), "Searched input");
            for id in ids {
                emit(&SearchResult::new(name, db.get_package(id)?))?;
                count += 1;
            }
        }
        Ok(count)
    }
}
