//! Query compiler
//!
//! Turns [`PkgQueryArgs`] into a ranked SQL query over the `v_PackagesSearch`
//! view. Compilation is deterministic: the same arguments always produce the
//! same query text and bindings. Semantic version ranges cannot be evaluated
//! by SQLite, so they are applied in a second pass over the ranked rows.

mod args;

pub use args::PkgQueryArgs;

use crate::types::RowId;
use crate::versions::{is_match_all_range, InvalidRange, SemverRange};
use rusqlite::types::ToSql;
use rusqlite::Connection;
use std::collections::BTreeMap;

/// Query compilation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("'{first}' and '{second}' are mutually exclusive")]
    Conflict {
        first: &'static str,
        second: &'static str,
    },

    #[error(transparent)]
    InvalidSemver(#[from] InvalidRange),

    #[error("license '{0}' may not contain single quotes")]
    InvalidLicense(String),

    #[error("unsupported system '{0}'")]
    InvalidSystem(String),

    #[error("invalid '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Escape `%` and `_` and wrap in wildcards for a `LIKE ... ESCAPE '\'` pattern
fn like_pattern(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Quote a string literal that is inlined into the query text
fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Columns a partial match is tested against, beyond `pname` and `attrName`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchScope {
    Name,
    Description,
    RelPath,
}

/// A compiled package query
#[derive(Debug, Clone)]
pub struct PkgQuery {
    args: PkgQueryArgs,
    selects: Vec<String>,
    wheres: Vec<String>,
    orders: Vec<&'static str>,
    binds: BTreeMap<String, String>,
    semver: Option<SemverRange>,
}

impl PkgQuery {
    /// Validate `args` and compile them
    pub fn new(mut args: PkgQueryArgs) -> Result<Self, QueryError> {
        args.drop_empty_filters();
        args.check()?;
        let semver = match &args.semver {
            Some(range) if !is_match_all_range(range) => Some(SemverRange::parse(range)?),
            _ => None,
        };

        let mut query = Self {
            args,
            selects: vec!["*".to_string()],
            wheres: Vec::new(),
            orders: Vec::new(),
            binds: BTreeMap::new(),
            semver,
        };
        query.init_match();
        query.init_filters();
        query.init_subtrees();
        query.init_systems();
        query.init_order_by();
        Ok(query)
    }

    pub fn args(&self) -> &PkgQueryArgs {
        &self.args
    }

    /// Named parameters and their values, sorted by name
    pub fn binds(&self) -> &BTreeMap<String, String> {
        &self.binds
    }

    fn bind(&mut self, name: &str, value: impl Into<String>) {
        self.binds.insert(format!(":{}", name), value.into());
    }

    fn select(&mut self, column: impl Into<String>) {
        self.selects.push(column.into());
    }

    fn filter(&mut self, condition: impl Into<String>) {
        self.wheres.push(condition.into());
    }

    fn init_match(&mut self) {
        if let Some(name) = self.args.pname_or_attr_name.clone() {
            self.bind("pnameOrAttrName", name);
            self.select("( :pnameOrAttrName = pname ) AS exactPname");
            self.select("( :pnameOrAttrName = attrName ) AS exactAttrName");
            self.filter("( exactPname OR exactAttrName )");
        } else {
            self.select("NULL AS exactPname");
            self.select("NULL AS exactAttrName");
        }

        let partial = if let Some(text) = self.args.partial_match.clone() {
            Some((text, MatchScope::Description))
        } else if let Some(text) = self.args.partial_name_match.clone() {
            Some((text, MatchScope::Name))
        } else {
            self.args
                .partial_name_or_rel_path_match
                .clone()
                .map(|text| (text, MatchScope::RelPath))
        };
        let Some((text, scope)) = partial else {
            for column in [
                "matchExactPname",
                "matchExactAttrName",
                "matchPartialPname",
                "matchPartialAttrName",
                "matchPartialDescription",
                "matchExactRelPath",
                "matchPartialRelPath",
            ] {
                self.select(format!("NULL AS {}", column));
            }
            return;
        };

        self.bind("partialMatch", text.clone());
        self.bind("partialMatchPattern", like_pattern(&text));
        self.select("( LOWER( pname ) = LOWER( :partialMatch ) ) AS matchExactPname");
        self.select("( LOWER( attrName ) = LOWER( :partialMatch ) ) AS matchExactAttrName");
        self.select("( pname LIKE :partialMatchPattern ESCAPE '\\' ) AS matchPartialPname");
        self.select("( attrName LIKE :partialMatchPattern ESCAPE '\\' ) AS matchPartialAttrName");

        let names = "matchExactPname OR matchExactAttrName OR matchPartialPname \
                     OR matchPartialAttrName";
        match scope {
            MatchScope::Description => {
                self.select(
                    "( description LIKE :partialMatchPattern ESCAPE '\\' ) AS matchPartialDescription",
                );
                self.filter(format!("( {} OR matchPartialDescription )", names));
            }
            MatchScope::Name => {
                self.select("NULL AS matchPartialDescription");
                self.filter(format!("( {} )", names));
            }
            MatchScope::RelPath => {
                self.select("NULL AS matchPartialDescription");
                // Joined with dots so that searches may contain them
                self.select(
                    "( SELECT LOWER( group_concat( value, '.' ) ) = LOWER( :partialMatch ) \
                     FROM json_each( v_PackagesSearch.relPath ) ) AS matchExactRelPath",
                );
                self.select(
                    "( SELECT group_concat( value, '.' ) LIKE :partialMatchPattern ESCAPE '\\' \
                     FROM json_each( v_PackagesSearch.relPath ) ) AS matchPartialRelPath",
                );
                self.filter(format!("( {} OR matchPartialRelPath )", names));
                return;
            }
        }
        self.select("NULL AS matchExactRelPath");
        self.select("NULL AS matchPartialRelPath");
    }

    fn init_filters(&mut self) {
        if let Some(name) = self.args.name.clone() {
            self.bind("name", name);
            self.filter("( name = :name )");
        }
        if let Some(pname) = self.args.pname.clone() {
            self.bind("pname", pname);
            self.filter("( pname = :pname )");
        }
        if let Some(version) = self.args.version.clone() {
            self.bind("version", version);
            self.filter("( version = :version )");
        } else if self.args.semver.is_some() {
            self.filter("( semver IS NOT NULL )");
        }

        if let Some(licenses) = self.args.licenses.clone() {
            let list: Vec<String> = licenses.iter().map(|l| quote(l)).collect();
            self.filter("( license IS NOT NULL )");
            self.filter(format!("( license IN ( {} ) )", list.join(", ")));
        }

        if !self.args.allow_broken {
            self.filter("( ( broken IS NULL ) OR ( broken = FALSE ) )");
        }
        if !self.args.allow_unfree {
            self.filter("( ( unfree IS NULL ) OR ( unfree = FALSE ) )");
        }

        if let Some(rel_path) = self.args.rel_path.clone() {
            let json = serde_json::Value::from(rel_path).to_string();
            self.bind("relPath", json);
            self.filter("( relPath = :relPath )");
        }
    }

    fn init_subtrees(&mut self) {
        let Some(subtrees) = self.args.subtrees.clone() else {
            self.select("0 AS subtreesRank");
            return;
        };
        let mut rank = String::from("CASE");
        let mut list = Vec::new();
        for (idx, subtree) in subtrees.iter().enumerate() {
            rank.push_str(&format!(" WHEN ( subtree = {} ) THEN {}", quote(subtree.as_str()), idx));
            list.push(quote(subtree.as_str()));
        }
        rank.push_str(" END AS subtreesRank");
        self.select(rank);
        self.filter(format!("( subtree IN ( {} ) )", list.join(", ")));
    }

    fn init_systems(&mut self) {
        let systems = self.args.systems.clone();
        let mut rank = String::from("CASE");
        let mut list = Vec::new();
        for (idx, system) in systems.iter().enumerate() {
            rank.push_str(&format!(" WHEN ( system = {} ) THEN {}", quote(system), idx));
            list.push(quote(system));
        }
        rank.push_str(" END AS systemsRank");
        self.select(rank);
        self.filter(format!("( system IN ( {} ) )", list.join(", ")));
    }

    fn init_order_by(&mut self) {
        self.orders.extend([
            "exactPname DESC",
            "matchExactPname DESC",
            "exactAttrName DESC",
            "matchExactAttrName DESC",
            "matchExactRelPath DESC",
            "depth ASC",
            "matchPartialPname DESC",
            "matchPartialAttrName DESC",
            "matchPartialRelPath DESC",
            "matchPartialDescription DESC",
            "subtreesRank ASC",
            "systemsRank ASC",
            "pname ASC",
            "versionType ASC",
        ]);
        let release = [
            "major DESC NULLS LAST",
            "minor DESC NULLS LAST",
            "patch DESC NULLS LAST",
        ];
        if self.args.prefer_pre_releases {
            self.orders.extend(release);
            self.orders.push("preTag DESC NULLS FIRST");
        } else {
            self.orders.push("preTag DESC NULLS FIRST");
            self.orders.extend(release);
        }
        self.orders.extend([
            "versionDate DESC NULLS LAST",
            "version ASC NULLS LAST",
            "brokenRank ASC",
            "unfreeRank ASC",
            "attrName ASC",
        ]);
    }

    /// Executable query text, without binding comments
    pub fn sql(&self) -> String {
        let mut inner = format!(
            "SELECT {} FROM v_PackagesSearch",
            self.selects.join(", ")
        );
        if !self.wheres.is_empty() {
            inner.push_str(" WHERE ");
            inner.push_str(&self.wheres.join(" AND "));
        }
        // Other columns come from an arbitrary row of each group
        if self.args.deduplicate {
            inner.push_str(" GROUP BY relPath");
        }
        inner.push_str(" ORDER BY ");
        inner.push_str(&self.orders.join(", "));
        format!("SELECT id, semver FROM ( {} )", inner)
    }

    /// Query text followed by one `-- :param = 'value'` comment per binding
    pub fn to_sql_string(&self) -> String {
        let mut text = self.sql();
        if !self.binds.is_empty() {
            text.push_str("\n-- with bindings:");
            for (name, value) in &self.binds {
                text.push_str(&format!("\n-- {} = {}", name, quote(value)));
            }
        }
        text
    }

    /// Run the query and return matching row ids in rank order
    pub fn execute(&self, conn: &Connection) -> rusqlite::Result<Vec<RowId>> {
        let mut stmt = conn.prepare(&self.sql())?;
        let params: Vec<(&str, &dyn ToSql)> = self
            .binds
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect();
        let rows = stmt.query_map(params.as_slice(), |row| {
            Ok((row.get::<_, RowId>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            let (id, semver) = row?;
            if let Some(range) = &self.semver {
                match semver {
                    Some(version) if range.matches_str(&version) => {}
                    _ => continue,
                }
            }
            ids.push(id);
            if self.args.limit.is_some_and(|limit| ids.len() >= limit) {
                break;
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Subtree;
    use pretty_assertions::assert_eq;

    fn args() -> PkgQueryArgs {
        PkgQueryArgs {
            systems: vec!["x86_64-linux".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("a_b%c"), "%a\\_b\\%c%");
    }

    #[test]
    fn test_compile_is_deterministic() {
        let mut a = args();
        a.partial_match = Some("hello".to_string());
        a.licenses = Some(vec!["MIT".to_string(), "GPL-3.0".to_string()]);
        a.subtrees = Some(vec![Subtree::Packages, Subtree::LegacyPackages]);
        a.semver = Some("^2".to_string());

        let first = PkgQuery::new(a.clone()).unwrap().to_sql_string();
        let second = PkgQuery::new(a).unwrap().to_sql_string();
        assert_eq!(first, second);
    }

    #[test]
    fn test_minimal_query_text() {
        let query = PkgQuery::new(args()).unwrap();
        insta::assert_snapshot!(query.to_sql_string(), @"SELECT id, semver FROM ( SELECT *, NULL AS exactPname, NULL AS exactAttrName, NULL AS matchExactPname, NULL AS matchExactAttrName, NULL AS matchPartialPname, NULL AS matchPartialAttrName, NULL AS matchPartialDescription, NULL AS matchExactRelPath, NULL AS matchPartialRelPath, 0 AS subtreesRank, CASE WHEN ( system = 'x86_64-linux' ) THEN 0 END AS systemsRank FROM v_PackagesSearch WHERE ( ( broken IS NULL ) OR ( broken = FALSE ) ) AND ( system IN ( 'x86_64-linux' ) ) ORDER BY exactPname DESC, matchExactPname DESC, exactAttrName DESC, matchExactAttrName DESC, matchExactRelPath DESC, depth ASC, matchPartialPname DESC, matchPartialAttrName DESC, matchPartialRelPath DESC, matchPartialDescription DESC, subtreesRank ASC, systemsRank ASC, pname ASC, versionType ASC, preTag DESC NULLS FIRST, major DESC NULLS LAST, minor DESC NULLS LAST, patch DESC NULLS LAST, versionDate DESC NULLS LAST, version ASC NULLS LAST, brokenRank ASC, unfreeRank ASC, attrName ASC )");
    }

    #[test]
    fn test_bindings_listed_in_sorted_order() {
        let mut a = args();
        a.pname = Some("hello".to_string());
        a.partial_name_match = Some("hel".to_string());
        let text = PkgQuery::new(a).unwrap().to_sql_string();
        let comments: Vec<&str> = text.lines().skip(1).collect();
        assert_eq!(
            comments,
            vec![
                "-- with bindings:",
                "-- :partialMatch = 'hel'",
                "-- :partialMatchPattern = '%hel%'",
                "-- :pname = 'hello'",
            ]
        );
    }

    #[test]
    fn test_prefer_pre_releases_reorders() {
        let mut a = args();
        a.prefer_pre_releases = true;
        let sql = PkgQuery::new(a).unwrap().sql();
        let pre = sql.find("preTag DESC").unwrap();
        let patch = sql.find("patch DESC").unwrap();
        assert!(patch < pre);
    }

    #[test]
    fn test_match_all_semver_skips_second_pass() {
        let mut a = args();
        a.semver = Some("*".to_string());
        let query = PkgQuery::new(a).unwrap();
        assert!(query.semver.is_none());
        assert!(query.sql().contains("semver IS NOT NULL"));
    }

    #[test]
    fn test_malformed_semver_never_compiles() {
        let mut a = args();
        a.semver = Some("not-a-range".to_string());
        assert!(matches!(
            PkgQuery::new(a),
            Err(QueryError::InvalidSemver(_))
        ));
    }

    #[test]
    fn test_oversized_semver_component_is_rejected() {
        let mut a = args();
        a.semver = Some("^18446744073709551615".to_string());
        assert!(matches!(
            PkgQuery::new(a),
            Err(QueryError::InvalidSemver(_))
        ));
    }

    #[test]
    fn test_empty_match_strings_are_ignored() {
        let mut a = args();
        a.pname_or_attr_name = Some(String::new());
        a.partial_name_match = Some(String::new());
        let query = PkgQuery::new(a).unwrap();
        assert_eq!(query.sql(), PkgQuery::new(args()).unwrap().sql());
        assert!(query.binds().is_empty());
    }

    #[test]
    fn test_rel_path_match_selects_joined_path() {
        let mut a = args();
        a.partial_name_or_rel_path_match = Some("python3Packages.pip".to_string());
        let sql = PkgQuery::new(a).unwrap().sql();
        assert!(sql.contains("json_each( v_PackagesSearch.relPath ) ) AS matchPartialRelPath"));
        assert!(sql.contains("OR matchPartialRelPath )"));
        assert!(sql.contains("NULL AS matchPartialDescription"));
    }

    #[test]
    fn test_deduplicate_groups_by_rel_path() {
        let mut a = args();
        a.deduplicate = true;
        let sql = PkgQuery::new(a).unwrap().sql();
        let group = sql.find(" GROUP BY relPath").unwrap();
        assert!(group < sql.find(" ORDER BY ").unwrap());
        assert!(!PkgQuery::new(args()).unwrap().sql().contains("GROUP BY"));
    }

    #[test]
    fn test_license_literals_are_quoted() {
        let mut a = args();
        a.licenses = Some(vec!["MIT".to_string(), "Apache-2.0".to_string()]);
        let sql = PkgQuery::new(a).unwrap().sql();
        assert!(sql.contains("( license IN ( 'MIT', 'Apache-2.0' ) )"));
    }
}
