/*!
Document dump encoder (`.bson.gz`).

The artifact is a plain concatenation of BSON documents, one per row, the
same layout `mongodump` produces and `mongorestore` accepts. Store metadata
is mapped onto document-database conventions: `$id` becomes `_id`,
`$createdAt`/`$updatedAt` keep their values under `createdAt`/`updatedAt`,
and every other `$`-prefixed field is dropped.
*/

use super::{EncodeContext, Encoder};
use crate::artifact::ArtifactFormat;
use crate::compression::GzipCompressor;
use crate::record::{is_store_field, Row, CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD};
use crate::{BackupError, Result};
use bson::Document;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct BsonEncoder {
    compressor: GzipCompressor,
}

impl BsonEncoder {
    pub fn new(compressor: GzipCompressor) -> Self {
        Self { compressor }
    }
}

/// Convert one row into a document with document-store field names
///
/// # Arguments
/// * `row` - Row as returned by the store, metadata fields included
///
/// # Returns
/// The document, with `_id` first and the timestamps last
pub fn row_to_document(row: &Row) -> Result<Document> {
    let mut doc = Document::new();

    if let Some(id) = row.get(ID_FIELD) {
        doc.insert("_id", bson::to_bson(id)?);
    }
    for (key, value) in row {
        if is_store_field(key) {
            continue;
        }
        doc.insert(key.as_str(), bson::to_bson(value)?);
    }
    for (from, to) in [(CREATED_AT_FIELD, "createdAt"), (UPDATED_AT_FIELD, "updatedAt")] {
        if let Some(value) = row.get(from) {
            doc.insert(to, bson::to_bson(value)?);
        }
    }

    Ok(doc)
}

impl Encoder for BsonEncoder {
    fn format(&self) -> ArtifactFormat {
        ArtifactFormat::Bson
    }

    fn encode(&self, rows: &[Row], ctx: &EncodeContext<'_>) -> Result<PathBuf> {
        let path = ctx.output_path(ArtifactFormat::Bson);
        let mut writer = self.compressor.stream_to_file(&path)?;

        for row in rows {
            let doc = row_to_document(row)?;
            doc.to_writer(&mut writer).map_err(|e| {
                BackupError::bson(format!(
                    "Failed to write document for {}: {e}",
                    ctx.collection_id
                ))
            })?;
        }

        let path = writer.finish()?;
        debug!(
            collection = ctx.collection_id,
            documents = rows.len(),
            path = %path.display(),
            "Wrote BSON dump"
        );
        Ok(path)
    }
}

/// Parse a concatenated document stream back into documents
pub fn read_documents(data: &[u8]) -> Result<Vec<Document>> {
    let mut cursor = std::io::Cursor::new(data);
    let mut docs = Vec::new();
    while (cursor.position() as usize) < data.len() {
        let doc = Document::from_reader(&mut cursor)
            .map_err(|e| BackupError::bson(format!("Corrupt document stream: {e}")))?;
        docs.push(doc);
    }
    Ok(docs)
}
