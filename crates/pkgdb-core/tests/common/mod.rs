//! Fixtures shared by the integration tests

#![allow(dead_code)]

use pkgdb_config::{DbLockSettings, ProviderSettings, Settings};
use pkgdb_core::manifest::ManifestRaw;
use pkgdb_core::{Environment, FixtureProvider, GlobalManifest, Manifest, PackageRecord, Subtree};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const SYSTEM: &str = "x86_64-linux";
pub const REV_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const REV_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

/// Lock timings short enough for tests
pub fn fast_lock() -> DbLockSettings {
    DbLockSettings {
        touch_interval: Duration::from_millis(20),
        max_update_age: Duration::from_millis(300),
        poll_interval: Duration::from_millis(10),
        max_attempts: 5,
    }
}

pub fn settings(cache_dir: &Path) -> Settings {
    Settings {
        cache_dir: cache_dir.to_path_buf(),
        system: SYSTEM.to_string(),
        ga_registry_ref: "release-23.05".to_string(),
        db_lock: fast_lock(),
        provider: ProviderSettings::Unconfigured,
    }
}

pub fn package(rel_path: &[&str], pname: &str, version: &str) -> PackageRecord {
    PackageRecord::new(Subtree::LegacyPackages, SYSTEM, rel_path, pname)
        .with_version(version)
        .with_flags(false, false)
}

/// `primary` has `hello` and `curl`; `secondary` has an older `hello` and `world`
pub fn provider() -> FixtureProvider {
    FixtureProvider::new()
        .with_source(
            "github:acme/primary",
            REV_A,
            vec![
                package(&["hello"], "hello", "2.12.1"),
                package(&["curl"], "curl", "8.4.0"),
            ],
        )
        .with_source(
            "github:acme/secondary",
            REV_A,
            vec![
                package(&["hello"], "hello", "2.10.0"),
                package(&["world"], "world", "1.0.0"),
                package(&["maybe-beta"], "maybe", "2.0.0-beta.1"),
            ],
        )
}

/// `primary` moved on to `REV_B` with a newer `hello`
pub fn upgraded_provider() -> FixtureProvider {
    provider().with_source(
        "github:acme/primary",
        REV_B,
        vec![
            package(&["hello"], "hello", "2.13.0"),
            package(&["curl"], "curl", "8.5.0"),
        ],
    )
}

pub fn global() -> GlobalManifest {
    GlobalManifest::from_str(
        r#"{
            "registry": {
                "inputs": {
                    "primary": { "from": "github:acme/primary" },
                    "secondary": { "from": "github:acme/secondary" }
                },
                "defaults": { "subtrees": ["legacyPackages"] },
                "priority": ["primary", "secondary"]
            },
            "options": { "systems": ["x86_64-linux"] }
        }"#,
    )
    .unwrap()
}

pub fn manifest(json: &str) -> Manifest {
    Manifest::from_raw(ManifestRaw::from_str(json).unwrap()).unwrap()
}

pub fn environment(cache_dir: &Path, manifest_json: &str, provider: &FixtureProvider) -> Environment {
    Environment::new(
        manifest(manifest_json),
        global(),
        settings(cache_dir),
        Arc::new(provider.clone()),
    )
}
