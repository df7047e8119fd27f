/*!
Error types for the Inkvault core engine.
*/

use thiserror::Error;

/// Result type used throughout the Inkvault core.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors that can occur during backup operations.
#[derive(Error, Debug)]
pub enum BackupError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// BSON encoding errors
    #[error("BSON error: {0}")]
    Bson(String),

    /// Spreadsheet workbook errors
    #[error("Spreadsheet error: {0}")]
    Spreadsheet(String),

    /// Compression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Row store errors (network, permissions, missing collection)
    #[error("Row store error: {0}")]
    Store(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cron expression or scheduler errors
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// Another backup run holds the run lock
    #[error("A backup run is already in progress (lock held at {0})")]
    RunInProgress(String),

    /// Lock acquisition failures other than contention
    #[error("Lock error: {0}")]
    Lock(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}

impl BackupError {
    /// Create a new BSON error
    pub fn bson<S: Into<String>>(msg: S) -> Self {
        Self::Bson(msg.into())
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new row store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new schedule error
    pub fn schedule<S: Into<String>>(msg: S) -> Self {
        Self::Schedule(msg.into())
    }

    /// Create a new lock error
    pub fn lock<S: Into<String>>(msg: S) -> Self {
        Self::Lock(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<rust_xlsxwriter::XlsxError> for BackupError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        Self::Spreadsheet(err.to_string())
    }
}

impl From<bson::ser::Error> for BackupError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Bson(err.to_string())
    }
}
