//! Cross-process database lock
//!
//! Guards creation and population of a package database with a lock file
//! next to it (`<db>.lock`). The protocol only relies on filesystem
//! atomicity:
//!
//! - Creating the lock file with `create_new` makes the caller the holder.
//! - The holder runs one heartbeat thread that refreshes the file's
//!   modification time, and deletes the file when done.
//! - Other processes append their id to the file (rewrite the existing file
//!   in place, re-read to confirm) and poll its modification time. If the
//!   file disappears the database is ready; if it stops being touched the
//!   first id listed takes over.
//! - Rewrites never create the file, so a released lock stays released.
//! - A takeover only happens while the file still carries the stale
//!   modification time the waiter observed. The takeover rewrite refreshes
//!   it, so a second waiter that saw the same stale lock backs off.
//!
//! Take-over order is the order ids appear in the file, which concurrent
//! appends may shuffle. Exactly one process holds the lock at a time, but
//! waiters are not served first-come first-served.

use pkgdb_config::DbLockSettings;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Registration rounds allowed per configured attempt; appends lose races
/// far more often than ordinary I/O fails.
const REGISTRATION_ROUNDS_PER_ATTEMPT: u32 = 10;

/// Errors for lock operations
#[derive(Debug, Error)]
pub enum DbLockError {
    /// The lock vanished while this process still held it
    #[error("database lock {path} disappeared while held by {owner}; another process treated the lock as free")]
    Inconsistency { path: PathBuf, owner: u32 },

    /// Lock file IO error
    #[error("database lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A transient operation kept failing
    #[error("database lock {path}: could not {action} after {attempts} attempts")]
    RetriesExhausted {
        path: PathBuf,
        action: &'static str,
        attempts: u32,
    },

    /// The waiter list holds something other than process ids
    #[error("database lock {path}: malformed waiter entry '{entry}'")]
    Malformed { path: PathBuf, entry: String },
}

/// Outcome of [`DbLock::acquire`]
#[derive(Debug)]
pub enum Acquired {
    /// The caller now holds the lock and must populate the database
    Holder(DbLockGuard),
    /// Another process released the lock; re-check the database
    PeerFinished,
}

/// What a waiter observed while polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockActivity {
    /// The lock file is gone
    Deleted,
    /// The lock file has not been touched for `age`; `modified` is the stale
    /// modification time
    WriterDied { age: Duration, modified: SystemTime },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Registered,
    LockGone,
}

/// Lock coordinator for one database
#[derive(Debug, Clone)]
pub struct DbLock {
    lock_path: PathBuf,
    owner: u32,
    settings: DbLockSettings,
}

impl DbLock {
    /// Lock guarding the database at `db_path`, owned by this process
    pub fn new(db_path: &Path, settings: DbLockSettings) -> Self {
        let mut lock_path: OsString = db_path.as_os_str().to_owned();
        lock_path.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_path),
            owner: std::process::id(),
            settings,
        }
    }

    /// Identify as `owner` instead of the current process id
    pub fn with_owner(mut self, owner: u32) -> Self {
        self.owner = owner;
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    fn io_error(&self, source: io::Error) -> DbLockError {
        DbLockError::Io {
            path: self.lock_path.clone(),
            source,
        }
    }

    /// Run `op`, retrying transient IO failures
    fn retry<T>(
        &self,
        action: &'static str,
        mut op: impl FnMut() -> io::Result<T>,
    ) -> Result<T, DbLockError> {
        let attempts = self.settings.max_attempts.max(1);
        for attempt in 1..=attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt == attempts => {
                    tracing::warn!(lock = %self.lock_path.display(), action, error = %e, "Giving up on lock operation");
                    return Err(DbLockError::RetriesExhausted {
                        path: self.lock_path.clone(),
                        action,
                        attempts,
                    });
                }
                Err(e) => {
                    tracing::debug!(lock = %self.lock_path.display(), action, attempt, error = %e, "Retrying lock operation");
                    thread::sleep(self.settings.poll_interval);
                }
            }
        }
        Err(DbLockError::RetriesExhausted {
            path: self.lock_path.clone(),
            action,
            attempts,
        })
    }

    /// Atomically create the lock file; `false` if it already exists
    pub fn try_create(&self) -> Result<bool, DbLockError> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Waiter ids in file order, with the file's modification time; `None`
    /// if the lock file does not exist.
    pub fn read_waiters(&self) -> Result<Option<(Vec<u32>, SystemTime)>, DbLockError> {
        let content = self.retry("read waiters", || {
            match fs::read_to_string(&self.lock_path) {
                Ok(content) => {
                    let modified = fs::metadata(&self.lock_path)?.modified()?;
                    Ok(Some((content, modified)))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        });
        // Deleted between read and stat
        let content = match content {
            Ok(content) => content,
            Err(DbLockError::RetriesExhausted { .. }) if !self.lock_path.exists() => None,
            Err(e) => return Err(e),
        };
        let Some((content, modified)) = content else {
            return Ok(None);
        };

        let waiters = parse_waiters(&content).map_err(|entry| DbLockError::Malformed {
            path: self.lock_path.clone(),
            entry,
        })?;
        Ok(Some((waiters, modified)))
    }

    /// Replace the waiter list of an existing lock file. `modified` keeps
    /// the holder's last touch so that rewriting the list is not mistaken for
    /// a sign of life; `None` marks the file as freshly touched.
    ///
    /// Returns `false` without writing anything if the lock file is gone.
    pub fn write_waiters(
        &self,
        waiters: &[u32],
        modified: Option<SystemTime>,
    ) -> Result<bool, DbLockError> {
        self.retry("write waiters", || {
            match rewrite_lock(&self.lock_path, waiters, modified) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    /// Append this owner to the waiter list until the append is confirmed
    fn register_interest(&self) -> Result<Registration, DbLockError> {
        let rounds = self
            .settings
            .max_attempts
            .max(1)
            .saturating_mul(REGISTRATION_ROUNDS_PER_ATTEMPT);
        for round in 0..rounds {
            let Some((mut waiters, modified)) = self.read_waiters()? else {
                return Ok(Registration::LockGone);
            };
            if waiters.contains(&self.owner) {
                tracing::debug!(lock = %self.lock_path.display(), owner = self.owner, "Registered as lock waiter");
                return Ok(Registration::Registered);
            }
            if round > 0 {
                tracing::debug!(lock = %self.lock_path.display(), owner = self.owner, round, "Waiter registration lost a race, retrying");
            }
            waiters.push(self.owner);
            if !self.write_waiters(&waiters, Some(modified))? {
                return Ok(Registration::LockGone);
            }
        }
        Err(DbLockError::RetriesExhausted {
            path: self.lock_path.clone(),
            action: "register as waiter",
            attempts: rounds,
        })
    }

    /// Remove this owner from the waiter list
    pub fn unregister_interest(&self) -> Result<(), DbLockError> {
        let rounds = self.settings.max_attempts.max(1);
        for _ in 0..rounds {
            let Some((waiters, modified)) = self.read_waiters()? else {
                return Ok(());
            };
            if !waiters.contains(&self.owner) {
                return Ok(());
            }
            let remaining: Vec<u32> = waiters.into_iter().filter(|p| *p != self.owner).collect();
            if !self.write_waiters(&remaining, Some(modified))? {
                return Ok(());
            }
        }
        Err(DbLockError::RetriesExhausted {
            path: self.lock_path.clone(),
            action: "unregister as waiter",
            attempts: rounds,
        })
    }

    /// Whether this owner is next in line
    pub fn should_take_over(&self, waiters: &[u32]) -> bool {
        waiters.first() == Some(&self.owner)
    }

    /// Poll until the lock is deleted or goes stale
    pub fn wait_for_lock_activity(&self) -> Result<LockActivity, DbLockError> {
        loop {
            let modified = match fs::metadata(&self.lock_path).and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockActivity::Deleted),
                Err(e) => return Err(self.io_error(e)),
            };
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO);
            if age > self.settings.max_update_age {
                return Ok(LockActivity::WriterDied { age, modified });
            }
            thread::sleep(self.settings.poll_interval);
        }
    }

    /// Become the holder or wait until the current holder finishes.
    ///
    /// Blocks for as long as the holder keeps touching the lock.
    pub fn acquire(&self) -> Result<Acquired, DbLockError> {
        if self.try_create()? {
            tracing::debug!(lock = %self.lock_path.display(), owner = self.owner, "Created database lock");
            return Ok(Acquired::Holder(self.start_holding()?));
        }

        if self.register_interest()? == Registration::LockGone {
            return Ok(Acquired::PeerFinished);
        }

        loop {
            let (age, stale) = match self.wait_for_lock_activity()? {
                LockActivity::Deleted => {
                    tracing::debug!(lock = %self.lock_path.display(), owner = self.owner, "Database lock released by peer");
                    return Ok(Acquired::PeerFinished);
                }
                LockActivity::WriterDied { age, modified } => (age, modified),
            };

            let Some((waiters, modified)) = self.read_waiters()? else {
                return Ok(Acquired::PeerFinished);
            };

            // A changed modification time means someone else already took over
            if modified == stale && self.should_take_over(&waiters) {
                let remaining: Vec<u32> = waiters.into_iter().skip(1).collect();
                if !self.write_waiters(&remaining, None)? {
                    return Ok(Acquired::PeerFinished);
                }
                tracing::warn!(
                    lock = %self.lock_path.display(),
                    owner = self.owner,
                    stale_for_ms = age.as_millis() as u64,
                    "Taking over stale database lock"
                );
                return Ok(Acquired::Holder(self.start_holding()?));
            }

            if !waiters.contains(&self.owner)
                && self.register_interest()? == Registration::LockGone
            {
                return Ok(Acquired::PeerFinished);
            }
            thread::sleep(self.settings.poll_interval);
        }
    }

    fn start_holding(&self) -> Result<DbLockGuard, DbLockError> {
        let (stop, stopped) = mpsc::channel::<()>();
        let lost = Arc::new(AtomicBool::new(false));
        let heartbeat = Heartbeat {
            lock_path: self.lock_path.clone(),
            owner: self.owner,
            interval: self.settings.touch_interval,
            max_failures: self.settings.max_attempts.max(1),
            lost: Arc::clone(&lost),
        };
        let handle = thread::Builder::new()
            .name("pkgdb-lock-heartbeat".to_string())
            .spawn(move || heartbeat.run(stopped))
            .map_err(|e| self.io_error(e))?;

        Ok(DbLockGuard {
            lock_path: self.lock_path.clone(),
            owner: self.owner,
            stop: Some(stop),
            heartbeat: Some(handle),
            lost,
            leave_lock: false,
        })
    }
}

/// Background task refreshing the lock file's modification time
struct Heartbeat {
    lock_path: PathBuf,
    owner: u32,
    interval: Duration,
    max_failures: u32,
    lost: Arc<AtomicBool>,
}

impl Heartbeat {
    fn run(self, stopped: mpsc::Receiver<()>) -> Result<(), DbLockError> {
        let mut failures = 0;
        loop {
            match stopped.recv_timeout(self.interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => {}
            }
            match self.touch() {
                Ok(()) => failures = 0,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.lost.store(true, Ordering::SeqCst);
                    tracing::error!(
                        lock = %self.lock_path.display(),
                        owner = self.owner,
                        "Database lock disappeared while held"
                    );
                    return Err(DbLockError::Inconsistency {
                        path: self.lock_path.clone(),
                        owner: self.owner,
                    });
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(lock = %self.lock_path.display(), error = %e, failures, "Failed to touch database lock");
                    if failures >= self.max_failures {
                        return Err(DbLockError::Io {
                            path: self.lock_path.clone(),
                            source: e,
                        });
                    }
                }
            }
        }
    }

    /// Refresh the modification time, dropping this owner from the waiter
    /// list if a lost update put it back there
    fn touch(&self) -> io::Result<()> {
        let content = fs::read_to_string(&self.lock_path)?;
        match parse_waiters(&content) {
            Ok(waiters) if waiters.contains(&self.owner) => {
                let remaining: Vec<u32> = waiters.into_iter().filter(|p| *p != self.owner).collect();
                rewrite_lock(&self.lock_path, &remaining, None)
            }
            _ => {
                let file = OpenOptions::new().write(true).open(&self.lock_path)?;
                file.set_modified(SystemTime::now())
            }
        }
    }
}

/// Waiter ids of a lock file; an unterminated last line is still being
/// written and is ignored
fn parse_waiters(content: &str) -> Result<Vec<u32>, String> {
    let mut waiters = Vec::new();
    for line in content.split_inclusive('\n').filter(|l| l.ends_with('\n')) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        waiters.push(line.parse::<u32>().map_err(|_| line.to_string())?);
    }
    Ok(waiters)
}

/// Overwrite an existing lock file with `waiters`, then set its
/// modification time. Fails with `NotFound` instead of creating the file.
fn rewrite_lock(path: &Path, waiters: &[u32], modified: Option<SystemTime>) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    let content: String = waiters.iter().map(|pid| format!("{}\n", pid)).collect();
    file.set_len(0)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    file.set_modified(modified.unwrap_or_else(SystemTime::now))
}

/// Held database lock. Dropping it stops the heartbeat and deletes the lock
/// file; [`DbLockGuard::release`] does the same and reports failures.
#[derive(Debug)]
pub struct DbLockGuard {
    lock_path: PathBuf,
    owner: u32,
    stop: Option<Sender<()>>,
    heartbeat: Option<JoinHandle<Result<(), DbLockError>>>,
    lost: Arc<AtomicBool>,
    leave_lock: bool,
}

impl DbLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Fail if the heartbeat found the lock file missing
    pub fn check(&self) -> Result<(), DbLockError> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(DbLockError::Inconsistency {
                path: self.lock_path.clone(),
                owner: self.owner,
            });
        }
        Ok(())
    }

    /// Stop the heartbeat and delete the lock file
    pub fn release(mut self) -> Result<(), DbLockError> {
        self.finish()
    }

    /// Stop the heartbeat but leave the lock file behind, exactly as a
    /// crashed holder would.
    pub fn abandon(mut self) {
        self.leave_lock = true;
        if let Err(e) = self.stop_heartbeat() {
            tracing::warn!(lock = %self.lock_path.display(), error = %e, "Heartbeat failed before abandoning lock");
        }
    }

    fn stop_heartbeat(&mut self) -> Result<(), DbLockError> {
        drop(self.stop.take());
        match self.heartbeat.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(DbLockError::Io {
                    path: self.lock_path.clone(),
                    source: io::Error::other("lock heartbeat thread panicked"),
                })
            }),
            None => Ok(()),
        }
    }

    fn finish(&mut self) -> Result<(), DbLockError> {
        let heartbeat = self.stop_heartbeat();
        if self.leave_lock {
            return heartbeat;
        }
        self.leave_lock = true;

        let removed = match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::error!(lock = %self.lock_path.display(), owner = self.owner, "Database lock disappeared while held");
                Err(DbLockError::Inconsistency {
                    path: self.lock_path.clone(),
                    owner: self.owner,
                })
            }
            Err(e) => Err(DbLockError::Io {
                path: self.lock_path.clone(),
                source: e,
            }),
        };
        tracing::debug!(lock = %self.lock_path.display(), owner = self.owner, "Released database lock");
        heartbeat.and(removed)
    }
}

impl Drop for DbLockGuard {
    fn drop(&mut self) {
        if self.leave_lock {
            return;
        }
        if let Err(e) = self.finish() {
            tracing::warn!(lock = %self.lock_path.display(), error = %e, "Failed to release database lock");
        }
    }
}
