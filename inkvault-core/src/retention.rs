/*!
Retention and rotation of backup artifacts.

Each tier keeps a fixed number of its newest artifacts. Every operation that
changes a tier directory holds that tier's lock file for its whole duration,
so listing, deciding and deleting happen as one unit with respect to other
processes touching the same tier.
*/

use crate::artifact::{is_artifact_path, ArtifactFormat, ParsedArtifact};
use crate::config::RetentionPolicy;
use crate::lock::DirLock;
use crate::tier::{BackupLayout, Tier};
use crate::{BackupError, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Default age after which a tier lock is considered abandoned
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

/// How long a retention operation waits for a busy tier lock
const TIER_LOCK_WAIT: Duration = Duration::from_secs(30);

/// Outcome of one cleanup pass over a tier directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub directory: PathBuf,
    pub kept: usize,
    pub deleted: Vec<PathBuf>,
    /// Files that should have been deleted but could not be
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct ArtifactEntry {
    path: PathBuf,
    name: String,
    modified: SystemTime,
}

/// Applies the retention policy to the tiers of a backup layout
#[derive(Debug, Clone)]
pub struct RetentionManager {
    layout: BackupLayout,
    policy: RetentionPolicy,
    lock_stale_after: Duration,
}

impl RetentionManager {
    pub fn new(layout: BackupLayout, policy: RetentionPolicy) -> Self {
        Self {
            layout,
            policy,
            lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
        }
    }

    pub fn with_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.lock_stale_after = stale_after;
        self
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Trim one tier to its configured cap
    pub fn cleanup_tier(&self, tier: Tier) -> Result<CleanupReport> {
        cleanup_directory_with(
            &self.layout.tier_dir(tier),
            self.policy.cap(tier),
            self.lock_stale_after,
        )
    }

    /// Trim every tier, daily first
    pub fn cleanup_all(&self) -> Result<Vec<CleanupReport>> {
        Tier::ALL
            .into_iter()
            .map(|tier| self.cleanup_tier(tier))
            .collect()
    }

    /// Copy the newest artifact of `source` into `dest`
    pub fn promote(&self, source: Tier, dest: Tier) -> Result<Option<PathBuf>> {
        promote_tier_with(&self.layout, source, dest, self.lock_stale_after)
    }

    /// Remove automatic artifacts of `tier` dated `date`
    pub fn purge_same_day_auto(&self, tier: Tier, date: NaiveDate) -> Result<usize> {
        purge_same_day_auto_with(&self.layout.tier_dir(tier), date, self.lock_stale_after)
    }
}

/// Delete all but the `keep` newest artifacts in `dir`
///
/// Artifacts are ordered by modification time, newest first, with the file
/// name (descending) as tie-breaker. Files without an artifact extension are
/// never touched. A file that cannot be deleted is logged and counted in
/// [`CleanupReport::failed`]; the remaining deletions still happen.
///
/// # Arguments
/// * `dir` - Tier directory; a missing directory yields an empty report
/// * `keep` - Number of artifacts to retain
pub fn cleanup_directory(dir: &Path, keep: usize) -> Result<CleanupReport> {
    cleanup_directory_with(dir, keep, DEFAULT_LOCK_STALE_AFTER)
}

fn cleanup_directory_with(dir: &Path, keep: usize, stale_after: Duration) -> Result<CleanupReport> {
    let mut report = CleanupReport {
        directory: dir.to_path_buf(),
        ..CleanupReport::default()
    };
    if !dir.is_dir() {
        return Ok(report);
    }

    let _lock = lock_tier(dir, "cleanup", stale_after)?;
    let entries = list_artifacts(dir)?;
    report.kept = entries.len().min(keep);

    for entry in entries.into_iter().skip(keep) {
        match fs::remove_file(&entry.path) {
            Ok(()) => {
                debug!(path = %entry.path.display(), "Deleted expired artifact");
                report.deleted.push(entry.path);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "Failed to delete expired artifact");
                report.failed += 1;
            }
        }
    }

    if !report.deleted.is_empty() || report.failed > 0 {
        info!(
            directory = %dir.display(),
            kept = report.kept,
            deleted = report.deleted.len(),
            failed = report.failed,
            "Applied retention"
        );
    }
    Ok(report)
}

/// Copy the newest artifact of the `source` tier into the `dest` tier
///
/// The copy is renamed so its tier marker names `dest`: an existing tier
/// marker before the extension is replaced, otherwise one is added. The
/// source file is left in place.
///
/// # Returns
/// The path of the copy, or `None` when the source tier has no artifacts
pub fn promote_tier(layout: &BackupLayout, source: Tier, dest: Tier) -> Result<Option<PathBuf>> {
    promote_tier_with(layout, source, dest, DEFAULT_LOCK_STALE_AFTER)
}

fn promote_tier_with(
    layout: &BackupLayout,
    source: Tier,
    dest: Tier,
    stale_after: Duration,
) -> Result<Option<PathBuf>> {
    if source == dest {
        return Err(BackupError::validation(format!(
            "Cannot promote the {source} tier into itself"
        )));
    }
    let source_dir = layout.tier_dir(source);
    let dest_dir = layout.tier_dir(dest);
    if !source_dir.is_dir() {
        info!(%source, %dest, "Nothing to promote, source tier does not exist");
        return Ok(None);
    }
    fs::create_dir_all(&dest_dir)?;

    let _lock = lock_tier(&dest_dir, "promote", stale_after)?;
    let Some(newest) = list_artifacts(&source_dir)?.into_iter().next() else {
        info!(%source, %dest, "Nothing to promote, source tier is empty");
        return Ok(None);
    };

    let target = dest_dir.join(promoted_name(&newest.name, dest));
    fs::copy(&newest.path, &target)?;
    info!(
        %source,
        %dest,
        from = %newest.path.display(),
        to = %target.display(),
        "Promoted artifact"
    );
    Ok(Some(target))
}

/// Delete non-manual artifacts in `dir` whose timestamp falls on `date`
///
/// Manual artifacts and files that do not parse as artifacts are kept.
pub fn purge_same_day_auto(dir: &Path, date: NaiveDate) -> Result<usize> {
    purge_same_day_auto_with(dir, date, DEFAULT_LOCK_STALE_AFTER)
}

fn purge_same_day_auto_with(dir: &Path, date: NaiveDate, stale_after: Duration) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let _lock = lock_tier(dir, "purge", stale_after)?;

    let mut purged = 0;
    for entry in list_artifacts(dir)? {
        let same_day_auto = ParsedArtifact::parse(&entry.name)
            .is_some_and(|parsed| !parsed.manual && parsed.date == date);
        if !same_day_auto {
            continue;
        }
        match fs::remove_file(&entry.path) {
            Ok(()) => purged += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %entry.path.display(), error = %e, "Failed to purge same-day artifact")
            }
        }
    }

    if purged > 0 {
        info!(directory = %dir.display(), %date, purged, "Purged earlier automatic artifacts from today");
    }
    Ok(purged)
}

/// File name for a copy of `file_name` promoted into `dest`
pub fn promoted_name(file_name: &str, dest: Tier) -> String {
    let Some(format) = ArtifactFormat::from_file_name(file_name) else {
        return file_name.to_string();
    };
    let extension = format!(".{}", format.extension());
    let stem = file_name.strip_suffix(&extension).unwrap_or(file_name);
    let stem = Tier::ALL
        .into_iter()
        .find_map(|tier| stem.strip_suffix(&format!("_{}", tier.as_str())))
        .unwrap_or(stem);
    format!("{stem}_{dest}{extension}")
}

/// Artifacts in `dir`, newest first
fn list_artifacts(dir: &Path) -> Result<Vec<ArtifactEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !is_artifact_path(&path) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable artifact");
                continue;
            }
        };
        entries.push(ArtifactEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            path,
        });
    }

    entries.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| b.name.cmp(&a.name))
    });
    Ok(entries)
}

fn lock_tier(dir: &Path, purpose: &str, stale_after: Duration) -> Result<DirLock> {
    DirLock::acquire_with_wait(
        &dir.join(BackupLayout::TIER_LOCK),
        purpose,
        stale_after,
        TIER_LOCK_WAIT,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    /// Create a file whose mtime is `age_secs` in the past
    fn artifact(dir: &Path, name: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, name.as_bytes()).unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
        path
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_cleanup_keeps_newest() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        for (i, age) in [500u64, 100, 300, 200, 400].iter().enumerate() {
            artifact(dir, &format!("posts_{i}.sql.gz"), *age);
        }
        fs::write(dir.join("notes.txt"), "keep me").unwrap();

        let report = cleanup_directory(dir, 2).unwrap();
        assert_eq!(report.kept, 2);
        assert_eq!(report.deleted.len(), 3);
        assert_eq!(report.failed, 0);
        assert_eq!(names(dir), vec!["notes.txt", "posts_1.sql.gz", "posts_3.sql.gz"]);
    }

    #[test]
    fn test_cleanup_ties_break_by_name() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        artifact(dir, "a.xlsx", 60);
        artifact(dir, "b.xlsx", 60);
        artifact(dir, "c.xlsx", 60);

        cleanup_directory(dir, 1).unwrap();
        assert_eq!(names(dir), vec!["c.xlsx"]);
    }

    #[test]
    fn test_cleanup_under_cap_and_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        artifact(temp_dir.path(), "posts.bson.gz", 10);

        let report = cleanup_directory(temp_dir.path(), 7).unwrap();
        assert_eq!(report.kept, 1);
        assert!(report.deleted.is_empty());

        let missing = cleanup_directory(&temp_dir.path().join("absent"), 7).unwrap();
        assert_eq!(missing, CleanupReport {
            directory: temp_dir.path().join("absent"),
            ..CleanupReport::default()
        });
    }

    #[test]
    fn test_cleanup_releases_tier_lock() {
        let temp_dir = TempDir::new().unwrap();
        artifact(temp_dir.path(), "posts.xlsx", 10);
        cleanup_directory(temp_dir.path(), 1).unwrap();
        assert!(!temp_dir.path().join(BackupLayout::TIER_LOCK).exists());
    }

    #[test]
    fn test_promoted_name() {
        assert_eq!(
            promoted_name("posts_2024-03-10T02-00-00-000Z.sql.gz", Tier::Weekly),
            "posts_2024-03-10T02-00-00-000Z_weekly.sql.gz"
        );
        assert_eq!(
            promoted_name("posts_2024-03-10T02-00-00-000Z_weekly.xlsx", Tier::Monthly),
            "posts_2024-03-10T02-00-00-000Z_monthly.xlsx"
        );
    }

    #[test]
    fn test_promote_copies_newest_only() {
        let temp_dir = TempDir::new().unwrap();
        let layout = BackupLayout::new(temp_dir.path());
        layout.ensure_dirs().unwrap();
        let daily = layout.tier_dir(Tier::Daily);
        artifact(&daily, "posts_2024-03-09T02-00-00-000Z.sql.gz", 86_400);
        let newest = artifact(&daily, "posts_2024-03-10T02-00-00-000Z.xlsx", 60);

        let copy = promote_tier(&layout, Tier::Daily, Tier::Weekly)
            .unwrap()
            .unwrap();
        assert_eq!(
            copy,
            layout
                .tier_dir(Tier::Weekly)
                .join("posts_2024-03-10T02-00-00-000Z_weekly.xlsx")
        );
        assert_eq!(fs::read(&copy).unwrap(), fs::read(&newest).unwrap());
        assert!(newest.exists());
        assert_eq!(names(&layout.tier_dir(Tier::Weekly)).len(), 1);
    }

    #[test]
    fn test_promote_empty_source() {
        let temp_dir = TempDir::new().unwrap();
        let layout = BackupLayout::new(temp_dir.path());
        layout.ensure_dirs().unwrap();

        assert_eq!(promote_tier(&layout, Tier::Weekly, Tier::Monthly).unwrap(), None);
        assert!(promote_tier(&layout, Tier::Daily, Tier::Daily).is_err());
    }

    #[test]
    fn test_purge_same_day_auto() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        artifact(dir, "posts_2024-03-10T02-00-00-000Z.sql.gz", 10);
        artifact(dir, "posts_2024-03-10T02-00-00-000Z.xlsx", 10);
        artifact(dir, "posts_manual_2024-03-10T09-30-00-000Z.sql.gz", 10);
        artifact(dir, "posts_2024-03-09T02-00-00-000Z.sql.gz", 10);

        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(purge_same_day_auto(dir, date).unwrap(), 2);
        assert_eq!(
            names(dir),
            vec![
                "posts_2024-03-09T02-00-00-000Z.sql.gz",
                "posts_manual_2024-03-10T09-30-00-000Z.sql.gz",
            ]
        );
    }

    #[test]
    fn test_manager_uses_policy_caps() {
        let temp_dir = TempDir::new().unwrap();
        let layout = BackupLayout::new(temp_dir.path());
        layout.ensure_dirs().unwrap();
        for i in 0..5u64 {
            artifact(&layout.tier_dir(Tier::Weekly), &format!("w{i}.bson.gz"), i * 10);
        }
        let manager = RetentionManager::new(
            layout.clone(),
            RetentionPolicy {
                daily: 7,
                weekly: 3,
                monthly: 12,
            },
        );

        let reports = manager.cleanup_all().unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[1].deleted.len(), 2);
        assert_eq!(
            names(&layout.tier_dir(Tier::Weekly)),
            vec!["w0.bson.gz", "w1.bson.gz", "w2.bson.gz"]
        );
    }
}
