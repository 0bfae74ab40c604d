//! List command (pkgdb list)

use crate::config::{self, Overrides};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pkgdb_core::db::schema::TABLES_VERSION;
use pkgdb_core::PkgDb;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

/// A cached database and the input it holds
#[derive(Debug)]
struct CachedDb {
    path: PathBuf,
    fingerprint: String,
    url: String,
    packages: usize,
    modified: Option<DateTime<Utc>>,
}

fn read_cached(path: &Path) -> Result<CachedDb> {
    let db = PkgDb::open_read_only(path)?;
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    Ok(CachedDb {
        path: path.to_path_buf(),
        fingerprint: db.locked_input().fingerprint.clone(),
        url: db.locked_input().url.clone(),
        packages: db.package_count()?,
        modified,
    })
}

/// Databases under `cache_dir`, sorted by path
fn cached_dbs(cache_dir: &Path) -> Result<Vec<CachedDb>> {
    let dir = cache_dir.join(format!("v{}", TABLES_VERSION));
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "sqlite") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut dbs = Vec::new();
    for path in paths {
        match read_cached(&path) {
            Ok(db) => dbs.push(db),
            // Being created by another process, or not ours
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable database"),
        }
    }
    Ok(dbs)
}

/// Run the list command
pub fn run(json: bool, overrides: &Overrides) -> Result<()> {
    let settings = config::load_settings(overrides)?;
    let dbs = cached_dbs(&settings.cache_dir)?;

    if json {
        let entries: Vec<_> = dbs
            .iter()
            .map(|db| {
                json!({
                    "path": db.path,
                    "fingerprint": db.fingerprint,
                    "url": db.url,
                    "packages": db.packages,
                    "modified": db.modified.map(|m| m.to_rfc3339()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if dbs.is_empty() {
        println!("No cached databases in {}", settings.cache_dir.display());
        return Ok(());
    }
    for db in &dbs {
        let modified = db
            .modified
            .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{}  {}  {} packages  {}", db.fingerprint, modified, db.packages, db.url);
    }
    Ok(())
}
