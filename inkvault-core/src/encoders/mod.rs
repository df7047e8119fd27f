/*!
Format encoders.

Each encoder turns the rows of one collection into a single artifact file in
the target tier directory. Encoders are independent of each other; a failure
in any of them is returned to the caller untouched.
*/

pub mod bson;
pub mod sql;
pub mod xlsx;

use crate::artifact::ArtifactFormat;
use crate::compression::GzipCompressor;
use crate::config::FormatConfig;
use crate::record::Row;
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};

pub use self::bson::BsonEncoder;
pub use self::sql::SqlEncoder;
pub use self::xlsx::XlsxEncoder;

/// Everything an encoder needs to know besides the rows themselves
#[derive(Debug, Clone, Copy)]
pub struct EncodeContext<'a> {
    pub collection_id: &'a str,
    pub exported_at: DateTime<Utc>,
    /// File name without extension, shared by all formats of one collection
    pub file_stem: &'a str,
    pub output_dir: &'a Path,
}

impl EncodeContext<'_> {
    pub fn output_path(&self, format: ArtifactFormat) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", self.file_stem, format.extension()))
    }

    /// Export time as an RFC 3339 string for headers and metadata sheets
    pub fn exported_at_rfc3339(&self) -> String {
        self.exported_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Serializes a row set into one artifact file
pub trait Encoder: Send + Sync {
    fn format(&self) -> ArtifactFormat;

    /// Write the artifact and return its path
    fn encode(&self, rows: &[Row], ctx: &EncodeContext<'_>) -> Result<PathBuf>;
}

/// The enabled encoders, in a stable order (sql, bson, xlsx)
pub fn encoders_from_config(
    formats: &FormatConfig,
    compressor: GzipCompressor,
) -> Vec<Box<dyn Encoder>> {
    formats
        .enabled()
        .into_iter()
        .map(|format| -> Box<dyn Encoder> {
            match format {
                ArtifactFormat::Sql => Box::new(SqlEncoder::new(compressor)),
                ArtifactFormat::Bson => Box::new(BsonEncoder::new(compressor)),
                ArtifactFormat::Xlsx => Box::new(XlsxEncoder::new()),
            }
        })
        .collect()
}
