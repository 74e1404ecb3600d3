//! Error types for Spool

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Spool operations
pub type Result<T> = std::result::Result<T, SpoolError>;

/// Main error type for Spool
#[derive(Error, Debug)]
pub enum SpoolError {
    /// The watched directory could not be listed. Retried on the next poll.
    #[error("Directory unreadable: {path}: {source}")]
    DirectoryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A discovered file cannot become a job. The file is skipped.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A line carried the wrong number of fields. Blank lines count as zero.
    #[error("Malformed record at line {line}: expected {expected} fields, found {found}")]
    MalformedRecord {
        line: u64,
        expected: usize,
        found: usize,
    },

    /// A line could not be read or mapped onto the record type
    #[error("Parse error at line {line}: {message}")]
    Parse { line: u64, message: String },

    /// The transformer rejected a record
    #[error("Transform failed: {0}")]
    Transform(String),

    /// The output file could not be created or a chunk could not be committed
    #[error("Write failed for {path}: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Archival failed after the pipeline output was written.
    #[error("Cleanup failed for {path}: {reason}")]
    CleanupFailure { path: PathBuf, reason: String },

    /// The job key is already recorded or currently running
    #[error("Job already executed: {0}")]
    DuplicateJob(String),

    /// A job was asked to take an edge outside its state machine
    #[error("Invalid job state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The job history could not be read or written
    #[error("Job repository error: {0}")]
    Repository(String),

    /// A copied file does not hash to its source's digest
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// A setting is missing, unparsable or out of range
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A job history line is not valid JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SpoolError {
    /// Whether the poller should try again on the next tick
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SpoolError::DirectoryUnreadable { .. })
    }

    /// Whether the error leaves pipeline output on disk without an archived input
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, SpoolError::CleanupFailure { .. })
    }
}
