//! Database creation coordinated through the lock file

mod common;

use common::*;
use pkgdb_core::db::lock::{Acquired, DbLock};
use pkgdb_core::registry::InputPreferences;
use pkgdb_core::{FixtureProvider, PackageProvider, PkgDbInput, RegistryInput, SourceLocator};
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn primary_input(cache_dir: &Path, provider: &FixtureProvider, owner: u32) -> PkgDbInput {
    let from = SourceLocator::parse(&format!("github:acme/primary/{}", REV_A)).unwrap();
    let provider: Arc<dyn PackageProvider> = Arc::new(provider.clone());
    let defaults = InputPreferences {
        subtrees: Some(vec![pkgdb_core::Subtree::LegacyPackages]),
    };
    PkgDbInput::new(
        "primary",
        &RegistryInput::new(from),
        &defaults,
        &settings(cache_dir),
        provider,
    )
    .unwrap()
    .with_lock_owner(owner)
}

/// Leave a lock file behind as a crashed holder would, untouched for a while
fn leave_stale_lock(lock_path: &Path, waiters: &str) {
    std::fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
    std::fs::write(lock_path, waiters).unwrap();
    File::options()
        .write(true)
        .open(lock_path)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(10))
        .unwrap();
}

mod concurrency {
    use super::*;

    #[test]
    fn test_concurrent_scrapes_happen_once() {
        let dir = TempDir::new().unwrap();
        let provider = provider().with_scrape_delay(Duration::from_millis(100));
        let systems = vec![SYSTEM.to_string()];

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let input = primary_input(dir.path(), &provider, 1000 + i);
                let systems = systems.clone();
                thread::spawn(move || input.db(&systems).map(|db| db.package_count()))
            })
            .collect();

        for handle in handles {
            let count = handle.join().unwrap().unwrap().unwrap();
            assert_eq!(count, 2);
        }
        assert_eq!(provider.scrape_count(), 1);
    }

    #[test]
    fn test_lock_is_removed_after_scrape() {
        let dir = TempDir::new().unwrap();
        let input = primary_input(dir.path(), &provider(), 1);
        input.ensure_scraped(&[SYSTEM.to_string()]).unwrap();

        let lock = DbLock::new(input.db_path(), fast_lock());
        assert!(!lock.lock_path().exists());
    }
}

mod recovery {
    use super::*;

    #[test]
    fn test_stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let provider = provider();
        let input = primary_input(dir.path(), &provider, 7);
        let lock = DbLock::new(input.db_path(), fast_lock());
        leave_stale_lock(lock.lock_path(), "");

        let db = input.db(&[SYSTEM.to_string()]).unwrap();
        assert_eq!(db.package_count().unwrap(), 2);
        assert_eq!(provider.scrape_count(), 1);
        assert!(!lock.lock_path().exists());
    }

    #[test]
    fn test_stale_lock_has_one_successor() {
        for _ in 0..10 {
            let dir = TempDir::new().unwrap();
            let db_path = dir.path().join("db.sqlite");
            leave_stale_lock(DbLock::new(&db_path, fast_lock()).lock_path(), "1\n2\n");

            let start = Arc::new(Barrier::new(2));
            let holding = Arc::new(AtomicUsize::new(0));
            let most_holding = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = [1, 2]
                .into_iter()
                .map(|owner| {
                    let lock = DbLock::new(&db_path, fast_lock()).with_owner(owner);
                    let (start, holding, most_holding) =
                        (start.clone(), holding.clone(), most_holding.clone());
                    thread::spawn(move || {
                        start.wait();
                        match lock.acquire().unwrap() {
                            Acquired::Holder(guard) => {
                                let now = holding.fetch_add(1, Ordering::SeqCst) + 1;
                                most_holding.fetch_max(now, Ordering::SeqCst);
                                thread::sleep(fast_lock().max_update_age);
                                holding.fetch_sub(1, Ordering::SeqCst);
                                guard.release().unwrap();
                            }
                            Acquired::PeerFinished => {}
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(most_holding.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_half_created_database_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let provider = provider();
        let input = primary_input(dir.path(), &provider, 9);
        let lock = DbLock::new(input.db_path(), fast_lock());
        leave_stale_lock(lock.lock_path(), "");
        File::create(input.db_path()).unwrap();

        let db = input.db(&[SYSTEM.to_string()]).unwrap();
        assert_eq!(db.package_count().unwrap(), 2);
        assert_eq!(provider.scrape_count(), 1);
        assert!(!lock.lock_path().exists());
    }

    #[test]
    fn test_abandoned_holder_is_replaced() {
        let dir = TempDir::new().unwrap();
        let input = primary_input(dir.path(), &provider(), 2);
        let crashed = DbLock::new(input.db_path(), fast_lock()).with_owner(1);
        match crashed.acquire().unwrap() {
            Acquired::Holder(guard) => guard.abandon(),
            Acquired::PeerFinished => panic!("expected to hold the lock"),
        }
        assert!(crashed.lock_path().exists());

        let db = input.db(&[SYSTEM.to_string()]).unwrap();
        assert_eq!(db.package_count().unwrap(), 2);
        assert!(!crashed.lock_path().exists());
    }
}
