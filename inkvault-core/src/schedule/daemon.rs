/*!
Files shared between a running scheduler daemon and one-shot CLI commands.

The daemon periodically rewrites `logs/scheduler.json` with its job table;
other processes read it to report status. A stop is requested by creating
`logs/scheduler.stop`, which the daemon polls for and removes.
*/

use super::JobStatus;
use crate::tier::BackupLayout;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

pub const STATE_FILE: &str = "scheduler.json";
pub const STOP_FILE: &str = "scheduler.stop";

/// Job table published by a running daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    /// Refreshed on every poll; used to tell a live daemon from a crashed one
    pub heartbeat_at: DateTime<Utc>,
    pub jobs: Vec<JobStatus>,
}

impl SchedulerState {
    pub fn new(started_at: DateTime<Utc>, jobs: Vec<JobStatus>) -> Self {
        Self {
            pid: std::process::id(),
            started_at,
            heartbeat_at: Utc::now(),
            jobs,
        }
    }

    /// True if the heartbeat is more recent than `max_age`
    pub fn is_alive(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        (now - self.heartbeat_at)
            .to_std()
            .map(|age| age <= max_age)
            .unwrap_or(true)
    }
}

pub fn state_path(layout: &BackupLayout) -> PathBuf {
    layout.logs_dir().join(STATE_FILE)
}

pub fn stop_path(layout: &BackupLayout) -> PathBuf {
    layout.logs_dir().join(STOP_FILE)
}

/// Atomically replace the state file
pub fn write_state(layout: &BackupLayout, state: &SchedulerState) -> Result<()> {
    let path = state_path(layout);
    fs::create_dir_all(layout.logs_dir())?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
    fs::rename(&tmp, &path)?;
    debug!(path = %path.display(), "Wrote scheduler state");
    Ok(())
}

/// Read the state file; a missing or unreadable file yields `None`
pub fn read_state(layout: &BackupLayout) -> Option<SchedulerState> {
    let path = state_path(layout);
    let contents = match fs::read(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read scheduler state");
            return None;
        }
    };
    match serde_json::from_slice(&contents) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring corrupt scheduler state");
            None
        }
    }
}

pub fn clear_state(layout: &BackupLayout) -> Result<()> {
    remove_if_present(state_path(layout))
}

/// Ask a running daemon to shut down
pub fn request_stop(layout: &BackupLayout) -> Result<PathBuf> {
    let path = stop_path(layout);
    fs::create_dir_all(layout.logs_dir())?;
    fs::write(&path, Utc::now().to_rfc3339())?;
    Ok(path)
}

/// Consume a pending stop request
///
/// # Returns
/// `true` if a request was present
pub fn take_stop_request(layout: &BackupLayout) -> Result<bool> {
    let path = stop_path(layout);
    match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_present(path: PathBuf) -> Result<()> {
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn job(name: &str) -> JobStatus {
        JobStatus {
            name: name.to_string(),
            expression: "0 2 * * *".to_string(),
            timezone: "UTC".to_string(),
            next_run: Some(Utc::now()),
            last_run: None,
            last_error: None,
            running: false,
        }
    }

    #[test]
    fn test_state_roundtrip_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let layout = BackupLayout::new(temp_dir.path());
        assert!(read_state(&layout).is_none());

        let state = SchedulerState::new(Utc::now(), vec![job("daily"), job("weekly")]);
        write_state(&layout, &state).unwrap();
        assert_eq!(read_state(&layout), Some(state));

        clear_state(&layout).unwrap();
        assert!(read_state(&layout).is_none());
        clear_state(&layout).unwrap();
    }

    #[test]
    fn test_corrupt_state_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let layout = BackupLayout::new(temp_dir.path());
        fs::create_dir_all(layout.logs_dir()).unwrap();
        fs::write(state_path(&layout), "{not json").unwrap();
        assert!(read_state(&layout).is_none());
    }

    #[test]
    fn test_stop_request_is_consumed_once() {
        let temp_dir = TempDir::new().unwrap();
        let layout = BackupLayout::new(temp_dir.path());

        assert!(!take_stop_request(&layout).unwrap());
        request_stop(&layout).unwrap();
        assert!(take_stop_request(&layout).unwrap());
        assert!(!take_stop_request(&layout).unwrap());
    }

    #[test]
    fn test_liveness() {
        let mut state = SchedulerState::new(Utc::now(), Vec::new());
        let window = Duration::from_secs(30);
        assert!(state.is_alive(Utc::now(), window));

        state.heartbeat_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(!state.is_alive(Utc::now(), window));
    }
}
