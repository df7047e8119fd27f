/*!
Streaming gzip compression for backup artifacts.

Encoders write their output through a [`GzipFileWriter`], which compresses
while streaming into a buffered file so a large collection never has to be
held in memory in compressed and uncompressed form at the same time.
*/

use crate::{BackupError, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Gzip compressor with a configurable level
///
/// # Example
/// ```rust
/// use inkvault_core::GzipCompressor;
///
/// let compressor = GzipCompressor::new();
/// let compressed = compressor.compress(b"INSERT INTO posts VALUES ('a');").unwrap();
/// let restored = compressor.decompress(&compressed).unwrap();
/// assert_eq!(restored, b"INSERT INTO posts VALUES ('a');");
/// ```
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified compression level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    pub fn level(&self) -> u32 {
        self.compression_level.level()
    }

    /// Open `path` for writing and return a writer that gzips everything written to it
    pub fn stream_to_file(&self, path: &Path) -> Result<GzipFileWriter> {
        let file = File::create(path).map_err(|e| {
            BackupError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create {}: {e}", path.display()),
            ))
        })?;
        Ok(GzipFileWriter {
            encoder: GzEncoder::new(BufWriter::new(file), self.compression_level),
            path: path.to_path_buf(),
        })
    }

    /// Compress an in-memory buffer
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder.write_all(data).map_err(|e| {
            BackupError::compression(format!("Failed to write data for compression: {e}"))
        })?;

        encoder
            .finish()
            .map_err(|e| BackupError::compression(format!("Failed to finish compression: {e}")))
    }

    /// Decompress an in-memory buffer
    pub fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| BackupError::compression(format!("Failed to decompress data: {e}")))?;

        Ok(decompressed)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming gzip writer bound to an output file
///
/// Dropping the writer without calling [`GzipFileWriter::finish`] leaves a
/// truncated archive on disk.
pub struct GzipFileWriter {
    encoder: GzEncoder<BufWriter<File>>,
    path: PathBuf,
}

impl GzipFileWriter {
    /// Write the gzip trailer, flush to disk and return the output path
    pub fn finish(self) -> Result<PathBuf> {
        let path = self.path;
        let mut buffered = self.encoder.finish().map_err(|e| {
            BackupError::compression(format!(
                "Failed to finish compression of {}: {e}",
                path.display()
            ))
        })?;
        buffered.flush()?;
        let file = buffered
            .into_inner()
            .map_err(|e| BackupError::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(path)
    }
}

impl Write for GzipFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.encoder.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.encoder.flush()
    }
}
