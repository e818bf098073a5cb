//! Error types for stack ingestion and chunked storage

use crate::types::DataType;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for ingest operations
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unable to open file: {}", .0.display())]
    FileOpen(PathBuf),

    #[error(
        "Not all files have the same shape: {} is {found:?} {found_dtype}, expected {expected:?} {expected_dtype}",
        path.display()
    )]
    ShapeMismatch {
        path: PathBuf,
        expected: Vec<usize>,
        expected_dtype: DataType,
        found: Vec<usize>,
        found_dtype: DataType,
    },

    #[error("Image decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage write error: {0}")]
    StorageWrite(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Fetch task failed: {0}")]
    Task(String),
}

/// Coarse classification of failures, by the stage that raised them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing or invalid source/destination, detected before any I/O
    Configuration,
    /// A source file could not be opened or decoded, or disagreed in shape
    SourceRead,
    /// The destination store rejected a write
    StorageWrite,
}

impl IngestError {
    /// Which stage this error belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            IngestError::Configuration(_)
            | IngestError::InvalidDimensions(_)
            | IngestError::OutOfBounds(_) => ErrorCategory::Configuration,
            IngestError::FileOpen(_)
            | IngestError::ShapeMismatch { .. }
            | IngestError::Decode(_)
            | IngestError::Task(_) => ErrorCategory::SourceRead,
            IngestError::Io(_)
            | IngestError::StorageWrite(_)
            | IngestError::Compression(_)
            | IngestError::Decompression(_)
            | IngestError::Metadata(_)
            | IngestError::Serialization(_)
            | IngestError::NotFound(_) => ErrorCategory::StorageWrite,
        }
    }
}

/// Specialized Result type for ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Serialization(err.to_string())
    }
}

impl From<ndarray::ShapeError> for IngestError {
    fn from(err: ndarray::ShapeError) -> Self {
        IngestError::InvalidDimensions(err.to_string())
    }
}
