/*!
Artifact naming: formats, run kinds and filesystem-safe timestamps.

Artifact file names follow `{collection}_{manual_}{timestamp}[_{tier}].{ext}`
where the tier marker is only present on promoted copies.
*/

use crate::tier::Tier;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Timestamp layout used in artifact and summary file names (UTC, millisecond precision)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";

/// Length of a formatted timestamp, e.g. `2024-03-10T02-00-00-000Z`
const TIMESTAMP_LEN: usize = 24;

const MANUAL_MARKER: &str = "manual";

/// Render a timestamp for use in file names
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// What started a backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Fired by the scheduler
    Auto,
    /// Requested by an operator (CLI, HTTP)
    Manual,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Auto => f.write_str("auto"),
            BackupKind::Manual => f.write_str("manual"),
        }
    }
}

/// Output formats produced for every non-empty collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// Relational dump, gzip compressed
    Sql,
    /// Document dump, gzip compressed
    Bson,
    /// Spreadsheet workbook, uncompressed
    Xlsx,
}

impl ArtifactFormat {
    pub const ALL: [ArtifactFormat; 3] =
        [ArtifactFormat::Sql, ArtifactFormat::Bson, ArtifactFormat::Xlsx];

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Sql => "sql.gz",
            ArtifactFormat::Bson => "bson.gz",
            ArtifactFormat::Xlsx => "xlsx",
        }
    }

    /// Detect the format from a file name's extension
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|format| file_name.ends_with(&format!(".{}", format.extension())))
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Build the file stem shared by all artifacts of one collection in one run
pub fn artifact_stem(collection_id: &str, kind: BackupKind, timestamp: &str) -> String {
    match kind {
        BackupKind::Auto => format!("{collection_id}_{timestamp}"),
        BackupKind::Manual => format!("{collection_id}_{MANUAL_MARKER}_{timestamp}"),
    }
}

/// Components recovered from an artifact file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArtifact {
    pub collection_id: String,
    pub manual: bool,
    pub timestamp: String,
    pub date: NaiveDate,
    pub tier_marker: Option<Tier>,
    pub format: ArtifactFormat,
}

impl ParsedArtifact {
    /// Parse a file name; returns `None` for anything that is not a backup artifact
    pub fn parse(file_name: &str) -> Option<Self> {
        let format = ArtifactFormat::from_file_name(file_name)?;
        let stem = file_name.strip_suffix(&format!(".{}", format.extension()))?;

        let (stem, tier_marker) = Tier::ALL
            .into_iter()
            .find_map(|tier| {
                stem.strip_suffix(&format!("_{}", tier.as_str()))
                    .map(|rest| (rest, Some(tier)))
            })
            .unwrap_or((stem, None));

        let split = stem.len().checked_sub(TIMESTAMP_LEN)?;
        let head = stem.get(..split)?;
        let timestamp = stem.get(split..)?;
        if !looks_like_timestamp(timestamp) {
            return None;
        }
        let date = NaiveDate::parse_from_str(timestamp.get(..10)?, "%Y-%m-%d").ok()?;

        let head = head.strip_suffix('_')?;
        let (collection_id, manual) = match head.strip_suffix(&format!("_{MANUAL_MARKER}")) {
            Some(collection_id) => (collection_id, true),
            None => (head, false),
        };
        if collection_id.is_empty() {
            return None;
        }

        Some(Self {
            collection_id: collection_id.to_string(),
            manual,
            timestamp: timestamp.to_string(),
            date,
            tier_marker,
            format,
        })
    }
}

fn looks_like_timestamp(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    bytes.len() == TIMESTAMP_LEN
        && bytes[10] == b'T'
        && bytes[TIMESTAMP_LEN - 1] == b'Z'
        && bytes[..TIMESTAMP_LEN - 1]
            .iter()
            .all(|b| b.is_ascii_digit() || *b == b'-' || *b == b'T')
}

/// True when the path names a file with one of the artifact extensions
pub fn is_artifact_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(ArtifactFormat::from_file_name)
        .is_some()
}
