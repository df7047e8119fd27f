/*!
Exclusive lock files.

A lock is a file created with `create_new`, so acquisition is atomic on any
local filesystem. The file records who holds it and is removed when the
[`DirLock`] guard is dropped. Locks older than the configured staleness
threshold are assumed to belong to a crashed process and are broken.
*/

use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const ASYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Contents of a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub token: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub purpose: String,
}

/// RAII guard for an acquired lock file
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
    token: Uuid,
}

impl DirLock {
    /// Try to take the lock once
    ///
    /// # Arguments
    /// * `path` - Lock file location; its parent directory must exist
    /// * `purpose` - Free-form label recorded in the lock file
    /// * `stale_after` - Age after which an existing lock is broken
    ///
    /// # Errors
    /// [`BackupError::RunInProgress`] when a live lock is already held.
    pub fn acquire(path: &Path, purpose: &str, stale_after: Duration) -> Result<Self> {
        match Self::create(path, purpose) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !is_stale(path, stale_after) {
                    return Err(BackupError::RunInProgress(path.display().to_string()));
                }
                warn!(path = %path.display(), "Breaking stale lock");
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(lock_error(path, e)),
                }
                Self::create(path, purpose).map_err(|e| match e.kind() {
                    ErrorKind::AlreadyExists => {
                        BackupError::RunInProgress(path.display().to_string())
                    }
                    _ => lock_error(path, e),
                })
            }
            Err(e) => Err(lock_error(path, e)),
        }
    }

    /// Poll for the lock until `wait` has elapsed, blocking the thread
    ///
    /// Only call this off the async runtime, e.g. inside
    /// `tokio::task::spawn_blocking`; use [`DirLock::acquire_waiting`] from
    /// async code.
    pub fn acquire_with_wait(
        path: &Path,
        purpose: &str,
        stale_after: Duration,
        wait: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + wait;
        loop {
            match Self::acquire(path, purpose, stale_after) {
                Err(BackupError::RunInProgress(_)) if Instant::now() < deadline => {
                    std::thread::sleep(POLL_INTERVAL);
                }
                other => return other,
            }
        }
    }

    /// Async counterpart of [`DirLock::acquire_with_wait`]
    ///
    /// Sleeps on the tokio timer between attempts so the runtime thread stays
    /// free while another run finishes.
    pub async fn acquire_waiting(
        path: &Path,
        purpose: &str,
        stale_after: Duration,
        wait: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + wait;
        let mut announced = false;
        loop {
            match Self::acquire(path, purpose, stale_after) {
                Err(BackupError::RunInProgress(_)) if Instant::now() < deadline => {
                    if !announced {
                        let holder = Self::owner(path).map(|owner| owner.purpose);
                        info!(path = %path.display(), ?holder, "Lock held, waiting for release");
                        announced = true;
                    }
                    tokio::time::sleep(ASYNC_POLL_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    /// Read the owner record of an existing lock file
    pub fn owner(path: &Path) -> Option<LockOwner> {
        let contents = fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create(path: &Path, purpose: &str) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let owner = LockOwner {
            token: Uuid::new_v4(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
            purpose: purpose.to_string(),
        };
        let contents = serde_json::to_vec(&owner)?;
        if let Err(e) = file.write_all(&contents).and_then(|_| file.sync_all()) {
            let _ = fs::remove_file(path);
            return Err(e);
        }
        debug!(path = %path.display(), purpose, "Acquired lock");
        Ok(Self {
            path: path.to_path_buf(),
            token: owner.token,
        })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // Only remove the file if it is still ours; a stale-breaker may have replaced it.
        let ours = Self::owner(&self.path).is_some_and(|owner| owner.token == self.token);
        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to release lock");
            } else {
                debug!(path = %self.path.display(), "Released lock");
            }
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        // Vanished between the failed create and now; let the retry decide.
        Err(_) => return true,
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

fn lock_error(path: &Path, e: std::io::Error) -> BackupError {
    BackupError::lock(format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_acquire_and_release() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".run.lock");

        let lock = DirLock::acquire(&path, "test", HOUR).unwrap();
        assert!(path.exists());
        let owner = DirLock::owner(&path).unwrap();
        assert_eq!(owner.pid, std::process::id());
        assert_eq!(owner.purpose, "test");

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".run.lock");

        let _held = DirLock::acquire(&path, "first", HOUR).unwrap();
        let err = DirLock::acquire(&path, "second", HOUR).unwrap_err();
        assert!(matches!(err, BackupError::RunInProgress(_)));
    }

    #[test]
    fn test_stale_lock_is_broken() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".run.lock");
        fs::write(&path, "{}").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - 2 * HOUR)
            .unwrap();

        let lock = DirLock::acquire(&path, "recovery", HOUR).unwrap();
        assert_eq!(DirLock::owner(&path).unwrap().purpose, "recovery");
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_leaves_foreign_lock_alone() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".tier.lock");

        let lock = DirLock::acquire(&path, "mine", HOUR).unwrap();
        fs::remove_file(&path).unwrap();
        let other = DirLock::acquire(&path, "theirs", HOUR).unwrap();

        drop(lock);
        assert!(path.exists());
        drop(other);
        assert!(!path.exists());
    }

    #[test]
    fn test_acquire_with_wait_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".tier.lock");
        let _held = DirLock::acquire(&path, "holder", HOUR).unwrap();

        let started = Instant::now();
        let err = DirLock::acquire_with_wait(&path, "waiter", HOUR, Duration::from_millis(120))
            .unwrap_err();
        assert!(matches!(err, BackupError::RunInProgress(_)));
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn test_acquire_waiting_takes_lock_after_release() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".run.lock");
        let held = DirLock::acquire(&path, "holder", HOUR).unwrap();

        let release = async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            drop(held);
        };
        let wait = DirLock::acquire_waiting(&path, "waiter", HOUR, Duration::from_secs(5));
        let ((), lock) = tokio::join!(release, wait);

        let lock = lock.unwrap();
        assert_eq!(DirLock::owner(&path).unwrap().purpose, "waiter");
        drop(lock);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_acquire_waiting_leaves_runtime_free() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".run.lock");
        let _held = DirLock::acquire(&path, "holder", HOUR).unwrap();

        // Single-threaded test runtime: the ticker only advances if the
        // waiter yields between attempts.
        let ticks = std::sync::atomic::AtomicUsize::new(0);
        let ticker = async {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        };
        let wait = async {
            let result =
                DirLock::acquire_waiting(&path, "waiter", HOUR, Duration::from_millis(300)).await;
            (result, ticks.load(std::sync::atomic::Ordering::SeqCst))
        };
        let ((), (result, ticks_when_done)) = tokio::join!(ticker, wait);

        assert!(matches!(result.unwrap_err(), BackupError::RunInProgress(_)));
        assert_eq!(ticks_when_done, 5);
    }
}
