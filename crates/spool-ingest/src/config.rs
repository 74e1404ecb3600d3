//! Service configuration
//!
//! Loaded from `SPOOL_*` environment variables. Every value has a default, so
//! an empty environment yields a working configuration rooted at
//! `./test_files`.

use crate::codec::DEFAULT_DELIMITER;
use crate::pipeline::DEFAULT_CHUNK_SIZE;
use crate::poller::{
    FilePattern, DEFAULT_FILE_PATTERN, DEFAULT_MAX_PER_POLL, DEFAULT_POLL_INTERVAL_MS,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_INPUT_DIR: &str = "./test_files/input";
pub const DEFAULT_OUTPUT_DIR: &str = "./test_files/output";
pub const DEFAULT_PROCESSED_DIR: &str = "./test_files/processed";
pub const DEFAULT_FILE_EXTENSION: &str = "csv";
pub const DEFAULT_WORKERS: usize = 1;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1;

/// Directories, polling and pipeline settings for one service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolConfig {
    /// Watched directory
    pub input_dir: PathBuf,
    /// Where transformed files are written
    pub output_dir: PathBuf,
    /// Where processed inputs are archived
    pub processed_dir: PathBuf,
    /// Glob selecting files in the watched directory
    pub file_pattern: String,
    /// Extension replaced when naming output files
    pub file_extension: String,
    /// Delay between two directory scans
    pub poll_interval_ms: u64,
    /// Files claimed per scan at most
    pub max_per_poll: usize,
    /// Records per committed chunk
    pub chunk_size: usize,
    /// Field separator, in both input and output
    pub delimiter: char,
    /// Number of jobs that may run concurrently
    pub workers: usize,
    /// Discovered files waiting for a worker
    pub queue_capacity: usize,
    /// JSON-lines job history; in-memory when unset
    pub job_history: Option<PathBuf>,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from(DEFAULT_INPUT_DIR),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            processed_dir: PathBuf::from(DEFAULT_PROCESSED_DIR),
            file_pattern: DEFAULT_FILE_PATTERN.to_string(),
            file_extension: DEFAULT_FILE_EXTENSION.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_per_poll: DEFAULT_MAX_PER_POLL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            delimiter: DEFAULT_DELIMITER as char,
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            job_history: None,
        }
    }
}

impl SpoolConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let path = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);

        let config = Self {
            input_dir: path("SPOOL_INPUT_DIR", defaults.input_dir),
            output_dir: path("SPOOL_OUTPUT_DIR", defaults.output_dir),
            processed_dir: path("SPOOL_PROCESSED_DIR", defaults.processed_dir),
            file_pattern: lookup("SPOOL_FILE_PATTERN").unwrap_or(defaults.file_pattern),
            file_extension: lookup("SPOOL_FILE_EXTENSION").unwrap_or(defaults.file_extension),
            poll_interval_ms: parse_var(&lookup, "SPOOL_POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            max_per_poll: parse_var(&lookup, "SPOOL_MAX_PER_POLL", defaults.max_per_poll)?,
            chunk_size: parse_var(&lookup, "SPOOL_CHUNK_SIZE", defaults.chunk_size)?,
            delimiter: parse_var(&lookup, "SPOOL_DELIMITER", defaults.delimiter)?,
            workers: parse_var(&lookup, "SPOOL_WORKERS", defaults.workers)?,
            queue_capacity: parse_var(&lookup, "SPOOL_QUEUE_CAPACITY", defaults.queue_capacity)?,
            job_history: lookup("SPOOL_JOB_HISTORY")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            anyhow::bail!("SPOOL_POLL_INTERVAL_MS must be greater than 0");
        }
        if self.max_per_poll == 0 {
            anyhow::bail!("SPOOL_MAX_PER_POLL must be greater than 0");
        }
        if self.chunk_size == 0 {
            anyhow::bail!("SPOOL_CHUNK_SIZE must be greater than 0");
        }
        if self.workers == 0 {
            anyhow::bail!("SPOOL_WORKERS must be greater than 0");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("SPOOL_QUEUE_CAPACITY must be greater than 0");
        }
        if !self.delimiter.is_ascii() {
            anyhow::bail!("SPOOL_DELIMITER must be a single ASCII character");
        }
        if self.file_extension.trim_start_matches('.').is_empty() {
            anyhow::bail!("SPOOL_FILE_EXTENSION must not be empty");
        }
        FilePattern::new(&self.file_pattern).context("SPOOL_FILE_PATTERN is invalid")?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delimiter as the byte the codec works with
    pub fn delimiter_byte(&self) -> u8 {
        let mut buf = [0u8; 4];
        self.delimiter.encode_utf8(&mut buf).as_bytes()[0]
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}={raw:?} is invalid: {e}")),
        None => Ok(default),
    }
}
