/*!
Run summaries persisted under `logs/` after every backup run.
*/

use crate::artifact::{ArtifactFormat, BackupKind};
use crate::tier::Tier;
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// One file written by an encoder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub path: PathBuf,
    pub format: ArtifactFormat,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the file contents
    pub sha256: String,
}

impl ArtifactRecord {
    /// Describe an artifact already on disk
    pub fn from_path(path: PathBuf, format: ArtifactFormat) -> Result<Self> {
        let size_bytes = fs::metadata(&path)?.len();
        let sha256 = file_sha256(&path)?;
        Ok(Self {
            path,
            format,
            size_bytes,
            sha256,
        })
    }
}

/// Per-collection outcome within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDetail {
    pub collection_id: String,
    pub records: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub artifacts: Vec<ArtifactRecord>,
}

/// Outcome of one backup run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Filesystem-safe run timestamp, shared with the artifact names
    pub timestamp: String,
    pub backup_type: BackupKind,
    pub tier: Tier,
    /// Non-empty collections exported without error
    pub collections_exported: usize,
    pub total_records: usize,
    pub duration_ms: u64,
    pub collections: Vec<CollectionDetail>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, timestamp: String, backup_type: BackupKind, tier: Tier) -> Self {
        Self {
            run_id,
            timestamp,
            backup_type,
            tier,
            collections_exported: 0,
            total_records: 0,
            duration_ms: 0,
            collections: Vec::new(),
        }
    }

    /// Add a collection outcome and update the totals
    pub fn push(&mut self, detail: CollectionDetail) {
        if detail.error.is_none() && detail.records > 0 {
            self.collections_exported += 1;
            self.total_records += detail.records;
        }
        self.collections.push(detail);
    }

    pub fn failed_collections(&self) -> impl Iterator<Item = &CollectionDetail> {
        self.collections.iter().filter(|c| c.error.is_some())
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactRecord> {
        self.collections.iter().flat_map(|c| c.artifacts.iter())
    }

    pub fn file_name(&self) -> String {
        format!("backup_{}.json", self.timestamp)
    }

    /// Write the summary as pretty JSON into `logs_dir`
    pub fn write_to(&self, logs_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(logs_dir)?;
        let path = logs_dir.join(self.file_name());
        fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        debug!(path = %path.display(), "Wrote run summary");
        Ok(path)
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let contents = fs::read(path)?;
        Ok(serde_json::from_slice(&contents)?)
    }
}

fn file_sha256(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn detail(id: &str, records: usize, error: Option<&str>) -> CollectionDetail {
        CollectionDetail {
            collection_id: id.to_string(),
            records,
            error: error.map(str::to_string),
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn test_totals_skip_failed_and_empty_collections() {
        let mut summary = RunSummary::new(
            Uuid::new_v4(),
            "2024-03-10T02-00-00-000Z".to_string(),
            BackupKind::Auto,
            Tier::Daily,
        );
        summary.push(detail("posts", 3, None));
        summary.push(detail("empty_collection", 0, None));
        summary.push(detail("comments", 0, Some("permission denied")));

        assert_eq!(summary.collections_exported, 1);
        assert_eq!(summary.total_records, 3);
        assert_eq!(summary.failed_collections().count(), 1);
        assert_eq!(summary.collections.len(), 3);
    }

    #[test]
    fn test_write_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let artifact_path = temp_dir.path().join("posts.xlsx");
        fs::write(&artifact_path, b"abc").unwrap();

        let mut summary = RunSummary::new(
            Uuid::new_v4(),
            "2024-03-10T02-00-00-000Z".to_string(),
            BackupKind::Manual,
            Tier::Weekly,
        );
        let mut posts = detail("posts", 1, None);
        posts
            .artifacts
            .push(ArtifactRecord::from_path(artifact_path, ArtifactFormat::Xlsx).unwrap());
        summary.push(posts);

        let path = summary.write_to(&temp_dir.path().join("logs")).unwrap();
        assert!(path.ends_with("logs/backup_2024-03-10T02-00-00-000Z.json"));

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["backup_type"], "manual");
        assert_eq!(raw["tier"], "weekly");
        assert!(raw["collections"][0].get("error").is_none());

        let restored = RunSummary::read_from(&path).unwrap();
        assert_eq!(restored, summary);
        let artifact = restored.artifacts().next().unwrap();
        assert_eq!(artifact.size_bytes, 3);
        assert_eq!(
            artifact.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
