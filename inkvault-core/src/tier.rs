/*!
Backup tiers and the on-disk directory layout.

```text
{root}/
  daily/     artifacts from daily and manual runs
  weekly/    promoted daily artifacts + weekly runs
  monthly/   promoted weekly artifacts + monthly runs
  logs/      run summaries and scheduler state
```
*/

use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Retention bucket for backup artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Daily, Tier::Weekly, Tier::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
        }
    }

    /// The tier whose newest artifact is promoted into this one before a scheduled run
    pub fn promotion_source(&self) -> Option<Tier> {
        match self {
            Tier::Daily => None,
            Tier::Weekly => Some(Tier::Daily),
            Tier::Monthly => Some(Tier::Weekly),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Tier::Daily),
            "weekly" => Ok(Tier::Weekly),
            "monthly" => Ok(Tier::Monthly),
            other => Err(BackupError::validation(format!("Unknown backup tier: {other}"))),
        }
    }
}

/// Resolves tier, log and lock paths under a backup root
#[derive(Debug, Clone)]
pub struct BackupLayout {
    root: PathBuf,
}

impl BackupLayout {
    pub const LOGS_DIR: &'static str = "logs";
    pub const RUN_LOCK: &'static str = ".run.lock";
    pub const TIER_LOCK: &'static str = ".tier.lock";

    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tier_dir(&self, tier: Tier) -> PathBuf {
        self.root.join(tier.as_str())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(Self::LOGS_DIR)
    }

    pub fn run_lock_path(&self) -> PathBuf {
        self.root.join(Self::RUN_LOCK)
    }

    /// Create the three tier directories and the logs directory if absent
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in Tier::ALL
            .iter()
            .map(|tier| self.tier_dir(*tier))
            .chain(std::iter::once(self.logs_dir()))
        {
            fs::create_dir_all(&dir).map_err(|e| {
                BackupError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create directory {}: {e}", dir.display()),
                ))
            })?;
        }
        Ok(())
    }
}
