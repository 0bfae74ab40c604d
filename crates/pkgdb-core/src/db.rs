//! Package databases
//!
//! Every locked input gets its own SQLite database, named after the input's
//! fingerprint. A database is filled one `<subtree>.<system>` prefix at a
//! time; a prefix marked done is complete and never rewritten.

mod input;
pub mod lock;
pub mod schema;

pub use input::PkgDbInput;

use crate::provider::PackageRecord;
use crate::query::PkgQuery;
use crate::registry::{LockedInput, SourceLocator};
use crate::types::{AttrPath, RowId, Subtree};
use crate::versions::coerce_semver;
use crate::{PkgdbError, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// A package row as reported by searches
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRow {
    pub id: RowId,
    pub subtree: Subtree,
    pub system: String,
    pub abs_path: AttrPath,
    pub rel_path: AttrPath,
    pub name: String,
    pub pname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    pub broken: Option<bool>,
    pub unfree: Option<bool>,
}

/// Handle to one package database
#[derive(Debug)]
pub struct PkgDb {
    conn: Connection,
    path: PathBuf,
    locked_input: LockedInput,
}

impl PkgDb {
    /// Create the database file with its schema and locked input row.
    ///
    /// The database is built next to `path` and renamed into place once
    /// committed, so `path` never names a database without its schema.
    /// Callers hold the database lock.
    pub fn create(path: &Path, input: &LockedInput) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        // Left behind by a creator that crashed
        if tmp_path.exists() {
            std::fs::remove_file(&tmp_path)?;
        }

        Self::init(&tmp_path, input)?;
        std::fs::rename(&tmp_path, path)?;
        tracing::debug!(db = %path.display(), input = %input.url, "Created package database");
        Self::open_read_write(path)
    }

    fn init(path: &Path, input: &LockedInput) -> Result<()> {
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
        tx.execute_batch(schema::TABLES)?;
        tx.execute_batch(schema::VIEWS)?;
        for (name, version) in [
            ("pkgdb", env!("CARGO_PKG_VERSION").to_string()),
            ("pkgdb_tables_schema", schema::TABLES_VERSION.to_string()),
            ("pkgdb_views_schema", schema::VIEWS_VERSION.to_string()),
        ] {
            tx.execute(
                "INSERT OR REPLACE INTO DbVersions ( name, version ) VALUES ( ?1, ?2 )",
                params![name, version],
            )?;
        }
        tx.execute(
            "INSERT OR IGNORE INTO LockedInput ( fingerprint, url, attrs ) VALUES ( ?1, ?2, ?3 )",
            params![
                input.fingerprint,
                input.url,
                serde_json::to_string(&input.attrs)?
            ],
        )?;
        tx.commit()?;
        conn.close().map_err(|(_, e)| e)?;
        Ok(())
    }

    /// Whether `path` holds a database with its locked input recorded.
    ///
    /// An empty or schema-less file, as a crashed creator may leave behind,
    /// is not initialized.
    pub fn is_initialized(path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let has_table: bool = conn.query_row(
            "SELECT EXISTS ( SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'LockedInput' )",
            [],
            |row| row.get(0),
        )?;
        if !has_table {
            return Ok(false);
        }
        let has_row: bool =
            conn.query_row("SELECT EXISTS ( SELECT 1 FROM LockedInput )", [], |row| row.get(0))?;
        Ok(has_row)
    }

    /// Open an existing database for reading
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::from_connection(conn, path)
    }

    /// Open an existing database for writing, refreshing outdated views.
    ///
    /// Callers hold the database lock.
    pub fn open_read_write(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self::from_connection(conn, path)?;
        db.update_views()?;
        Ok(db)
    }

    fn from_connection(conn: Connection, path: &Path) -> Result<Self> {
        let row = conn
            .query_row(
                "SELECT fingerprint, url, attrs FROM LockedInput LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((fingerprint, url, attrs)) = row else {
            return Err(PkgdbError::InvalidDatabase {
                path: path.to_path_buf(),
                reason: "no locked input recorded".to_string(),
            });
        };
        let attrs: SourceLocator = serde_json::from_str(&attrs)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            locked_input: LockedInput {
                fingerprint,
                url,
                attrs,
            },
        })
    }

    fn update_views(&self) -> Result<()> {
        let current = self.schema_versions()?;
        let expected = schema::VIEWS_VERSION.to_string();
        if current.get("pkgdb_views_schema") == Some(&expected) {
            return Ok(());
        }
        tracing::info!(db = %self.path.display(), "Updating package database views");
        self.conn.execute_batch(schema::DROP_VIEWS)?;
        self.conn.execute_batch(schema::VIEWS)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO DbVersions ( name, version ) VALUES ( 'pkgdb_views_schema', ?1 )",
            params![expected],
        )?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn locked_input(&self) -> &LockedInput {
        &self.locked_input
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Rows of the `DbVersions` table
    pub fn schema_versions(&self) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare("SELECT name, version FROM DbVersions")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<String, String>>>()?;
        Ok(rows)
    }

    /// Id of the attribute set at `path`, if present
    pub fn attr_set_id(&self, path: &[String]) -> Result<Option<RowId>> {
        let mut parent = schema::ROOT_PARENT;
        for name in path {
            let id = self
                .conn
                .query_row(
                    "SELECT id FROM AttrSets WHERE ( parent = ?1 ) AND ( attrName = ?2 )",
                    params![parent, name],
                    |row| row.get::<_, RowId>(0),
                )
                .optional()?;
            match id {
                Some(id) => parent = id,
                None => return Ok(None),
            }
        }
        Ok(Some(parent))
    }

    /// Whether every package below `prefix` has been recorded
    pub fn is_prefix_done(&self, prefix: &[String]) -> Result<bool> {
        let Some(id) = self.attr_set_id(prefix)? else {
            return Ok(false);
        };
        let done = self.conn.query_row(
            "SELECT done FROM AttrSets WHERE ( id = ?1 )",
            params![id],
            |row| row.get::<_, bool>(0),
        )?;
        Ok(done)
    }

    /// Record `packages` below `prefix` and mark it done, atomically
    pub fn add_prefix(&mut self, prefix: &[String], packages: &[PackageRecord]) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut attr_sets: HashMap<AttrPath, RowId> = HashMap::new();
        let prefix_id = add_attr_set_path(&tx, prefix, &mut attr_sets)?;

        let mut added = 0;
        for record in packages {
            let abs_path = record.abs_path();
            if !abs_path.starts_with(prefix) {
                return Err(PkgdbError::Provider(format!(
                    "package '{}' is outside of '{}'",
                    abs_path.join("."),
                    prefix.join(".")
                )));
            }
            let Some((attr_name, parent_path)) = abs_path.split_last() else {
                continue;
            };
            let parent = add_attr_set_path(&tx, parent_path, &mut attr_sets)?;
            add_package(&tx, parent, attr_name, record)?;
            added += 1;
        }

        tx.execute(
            "UPDATE AttrSets SET done = TRUE WHERE ( id = ?1 )",
            params![prefix_id],
        )?;
        tx.commit()?;
        tracing::debug!(db = %self.path.display(), prefix = %prefix.join("."), packages = added, "Recorded package prefix");
        Ok(added)
    }

    /// Package row by id
    pub fn get_package(&self, id: RowId) -> Result<PackageRow> {
        let row = self
            .conn
            .query_row(
                "SELECT id, subtree, system, path, relPath, name, pname, version, \
                 description, license, broken, unfree FROM v_PackagesSearch WHERE ( id = ?1 )",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, RowId>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        PackageColumns {
                            name: row.get(5)?,
                            pname: row.get(6)?,
                            version: row.get(7)?,
                            description: row.get(8)?,
                            license: row.get(9)?,
                            broken: row.get(10)?,
                            unfree: row.get(11)?,
                        },
                    ))
                },
            )
            .optional()?;
        let Some((id, subtree, system, path, rel_path, columns)) = row else {
            return Err(PkgdbError::Database(rusqlite::Error::QueryReturnedNoRows));
        };
        let subtree = subtree
            .parse::<Subtree>()
            .map_err(|e| PkgdbError::InvalidDatabase {
                path: self.path.clone(),
                reason: format!("package {}: {}", id, e),
            })?;
        Ok(PackageRow {
            id,
            subtree,
            system,
            abs_path: serde_json::from_str(&path)?,
            rel_path: serde_json::from_str(&rel_path)?,
            name: columns.name,
            pname: columns.pname,
            version: columns.version,
            description: columns.description,
            license: columns.license,
            broken: columns.broken,
            unfree: columns.unfree,
        })
    }

    /// Number of recorded packages
    pub fn package_count(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT( id ) FROM Packages", [], |row| {
                row.get::<_, i64>(0)
            })?;
        Ok(count.max(0) as usize)
    }

    /// Ids of every package below the attribute set at `prefix`, in id order
    pub fn package_ids(&self, prefix: &[String]) -> Result<Vec<RowId>> {
        let Some(root) = self.attr_set_id(prefix)? else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(
            "WITH RECURSIVE Tree ( id ) AS (
               SELECT ?1
               UNION ALL SELECT AttrSets.id FROM AttrSets
                 JOIN Tree ON ( AttrSets.parent = Tree.id )
             )
             SELECT Packages.id FROM Packages
               WHERE ( Packages.parentId IN ( SELECT id FROM Tree ) )
               ORDER BY Packages.id",
        )?;
        let ids = stmt
            .query_map(params![root], |row| row.get::<_, RowId>(0))?
            .collect::<rusqlite::Result<Vec<RowId>>>()?;
        Ok(ids)
    }

    /// Ids of the packages matched by `query`, best match first
    pub fn execute(&self, query: &PkgQuery) -> Result<Vec<RowId>> {
        Ok(query.execute(&self.conn)?)
    }
}

struct PackageColumns {
    name: String,
    pname: Option<String>,
    version: Option<String>,
    description: Option<String>,
    license: Option<String>,
    broken: Option<bool>,
    unfree: Option<bool>,
}

fn add_attr_set(conn: &Connection, parent: RowId, name: &str) -> rusqlite::Result<RowId> {
    conn.execute(
        "INSERT OR IGNORE INTO AttrSets ( parent, attrName ) VALUES ( ?1, ?2 )",
        params![parent, name],
    )?;
    conn.query_row(
        "SELECT id FROM AttrSets WHERE ( parent = ?1 ) AND ( attrName = ?2 )",
        params![parent, name],
        |row| row.get(0),
    )
}

fn add_attr_set_path(
    conn: &Connection,
    path: &[String],
    cache: &mut HashMap<AttrPath, RowId>,
) -> rusqlite::Result<RowId> {
    if let Some(id) = cache.get(path) {
        return Ok(*id);
    }
    let mut parent = schema::ROOT_PARENT;
    for depth in 1..=path.len() {
        let partial = &path[..depth];
        parent = match cache.get(partial) {
            Some(id) => *id,
            None => {
                let id = add_attr_set(conn, parent, &path[depth - 1])?;
                cache.insert(partial.to_vec(), id);
                id
            }
        };
    }
    Ok(parent)
}

fn add_description(conn: &Connection, description: &str) -> rusqlite::Result<RowId> {
    conn.execute(
        "INSERT OR IGNORE INTO Descriptions ( description ) VALUES ( ?1 )",
        params![description],
    )?;
    conn.query_row(
        "SELECT id FROM Descriptions WHERE ( description = ?1 )",
        params![description],
        |row| row.get(0),
    )
}

fn add_package(
    conn: &Connection,
    parent: RowId,
    attr_name: &str,
    record: &PackageRecord,
) -> Result<RowId> {
    let description = record
        .description
        .as_deref()
        .map(|d| add_description(conn, d))
        .transpose()?;
    let semver = record.version.as_deref().and_then(coerce_semver);
    let outputs_to_install = record
        .outputs_to_install
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT OR REPLACE INTO Packages ( parentId, attrName, name, pname, version, semver, \
         license, outputs, outputsToInstall, broken, unfree, descriptionId ) \
         VALUES ( ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12 )",
        params![
            parent,
            attr_name,
            record.derivation_name(),
            record.pname,
            record.version,
            semver,
            record.license,
            serde_json::to_string(&record.outputs)?,
            outputs_to_install,
            record.broken,
            record.unfree,
            description,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::PkgQueryArgs;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const REV: &str = "0123456789abcdef0123456789abcdef01234567";

    fn locked() -> LockedInput {
        LockedInput::new(SourceLocator::parse(&format!("github:acme/pkgs/{}", REV)).unwrap())
            .unwrap()
    }

    fn prefix() -> AttrPath {
        vec!["legacyPackages".to_string(), "x86_64-linux".to_string()]
    }

    fn records() -> Vec<PackageRecord> {
        vec![
            PackageRecord::new(Subtree::LegacyPackages, "x86_64-linux", &["hello"], "hello")
                .with_version("2.12.1")
                .with_license("GPL-3.0-or-later")
                .with_description("A program that produces a familiar, friendly greeting")
                .with_flags(false, false),
            PackageRecord::new(
                Subtree::LegacyPackages,
                "x86_64-linux",
                &["python3Packages", "pip"],
                "pip",
            )
            .with_version("23.0.1"),
            PackageRecord::new(Subtree::LegacyPackages, "x86_64-linux", &["tzdata"], "tzdata")
                .with_version("2023-01-02"),
        ]
    }

    fn populated(dir: &TempDir) -> PkgDb {
        let path = dir.path().join("db.sqlite");
        let mut db = PkgDb::create(&path, &locked()).unwrap();
        db.add_prefix(&prefix(), &records()).unwrap();
        db
    }

    fn query(db: &PkgDb, f: impl FnOnce(&mut PkgQueryArgs)) -> Vec<PackageRow> {
        let mut args = PkgQueryArgs {
            systems: vec!["x86_64-linux".to_string()],
            ..Default::default()
        };
        f(&mut args);
        let ids = db.execute(&PkgQuery::new(args).unwrap()).unwrap();
        ids.into_iter().map(|id| db.get_package(id).unwrap()).collect()
    }

    #[test]
    fn test_create_records_locked_input() {
        let dir = TempDir::new().unwrap();
        let db = populated(&dir);
        assert_eq!(db.locked_input(), &locked());

        let reopened = PkgDb::open_read_only(db.path()).unwrap();
        assert_eq!(reopened.locked_input(), &locked());
        let versions = reopened.schema_versions().unwrap();
        assert_eq!(versions["pkgdb_tables_schema"], "1");
    }

    #[test]
    fn test_deduplicate_keeps_one_row_per_rel_path() {
        let dir = TempDir::new().unwrap();
        let mut db = populated(&dir);
        let arm = vec!["legacyPackages".to_string(), "aarch64-linux".to_string()];
        db.add_prefix(
            &arm,
            &[PackageRecord::new(Subtree::LegacyPackages, "aarch64-linux", &["hello"], "hello")
                .with_version("2.12.1")],
        )
        .unwrap();

        let hello_everywhere = |args: &mut PkgQueryArgs| {
            args.systems = vec!["x86_64-linux".to_string(), "aarch64-linux".to_string()];
            args.pname = Some("hello".to_string());
        };
        assert_eq!(query(&db, hello_everywhere).len(), 2);

        let rows = query(&db, |args| {
            hello_everywhere(args);
            args.deduplicate = true;
        });
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rel_path, vec!["hello".to_string()]);
    }

    #[test]
    fn test_is_initialized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.sqlite");
        assert!(!PkgDb::is_initialized(&path).unwrap());

        std::fs::File::create(&path).unwrap();
        assert!(!PkgDb::is_initialized(&path).unwrap());

        std::fs::remove_file(&path).unwrap();
        PkgDb::create(&path, &locked()).unwrap();
        assert!(PkgDb::is_initialized(&path).unwrap());
        assert!(!dir.path().join("db.sqlite.tmp").exists());
    }

    #[test]
    fn test_prefix_done_flag() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.sqlite");
        let mut db = PkgDb::create(&path, &locked()).unwrap();
        assert!(!db.is_prefix_done(&prefix()).unwrap());

        db.add_prefix(&prefix(), &[]).unwrap();
        assert!(db.is_prefix_done(&prefix()).unwrap());
        assert_eq!(db.package_count().unwrap(), 0);
    }

    #[test]
    fn test_get_package_paths() {
        let dir = TempDir::new().unwrap();
        let db = populated(&dir);
        let rows = query(&db, |args| args.pname = Some("pip".to_string()));
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].abs_path,
            vec!["legacyPackages", "x86_64-linux", "python3Packages", "pip"]
        );
        assert_eq!(rows[0].rel_path, vec!["python3Packages", "pip"]);
        assert_eq!(rows[0].name, "pip-23.0.1");
    }

    #[test]
    fn test_version_classification() {
        let dir = TempDir::new().unwrap();
        let db = populated(&dir);
        let (date, kind): (Option<String>, i64) = db
            .connection()
            .query_row(
                "SELECT versionDate, versionType FROM v_PackagesSearch WHERE ( pname = 'tzdata' )",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(date.as_deref(), Some("2023-01-02"));
        assert_eq!(kind, 1);

        let (major, minor, patch): (i64, i64, i64) = db
            .connection()
            .query_row(
                "SELECT major, minor, patch FROM v_PackagesSearch WHERE ( pname = 'hello' )",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!((major, minor, patch), (2, 12, 1));
    }

    #[test]
    fn test_package_ids_below_prefix() {
        let dir = TempDir::new().unwrap();
        let db = populated(&dir);
        assert_eq!(db.package_ids(&prefix()).unwrap().len(), 3);

        let mut python = prefix();
        python.push("python3Packages".to_string());
        let ids = db.package_ids(&python).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(db.get_package(ids[0]).unwrap().pname.as_deref(), Some("pip"));

        python.push("missing".to_string());
        assert!(db.package_ids(&python).unwrap().is_empty());
    }

    #[test]
    fn test_rel_path_filter() {
        let dir = TempDir::new().unwrap();
        let db = populated(&dir);
        let rows = query(&db, |args| {
            args.rel_path = Some(vec!["python3Packages".to_string(), "pip".to_string()])
        });
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pname.as_deref(), Some("pip"));
    }

    #[test]
    fn test_package_row_json() {
        let dir = TempDir::new().unwrap();
        let db = populated(&dir);
        let rows = query(&db, |args| args.pname = Some("hello".to_string()));
        let mut value = serde_json::to_value(&rows[0]).unwrap();
        value.as_object_mut().unwrap().remove("id");
        insta::assert_json_snapshot!(value, @r###"
        {
          "absPath": [
            "legacyPackages",
            "x86_64-linux",
            "hello"
          ],
          "broken": false,
          "description": "A program that produces a familiar, friendly greeting",
          "license": "GPL-3.0-or-later",
          "name": "hello-2.12.1",
          "pname": "hello",
          "relPath": [
            "hello"
          ],
          "subtree": "legacyPackages",
          "system": "x86_64-linux",
          "unfree": false,
          "version": "2.12.1"
        }
        "###);
    }
}
