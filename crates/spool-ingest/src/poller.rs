//! Directory polling
//!
//! On every tick the watched directory is listed, file names are matched
//! against a glob pattern and at most `max_per_poll` unclaimed files are
//! claimed and emitted, in file name order. A claimed file is not selected
//! again until its claim is released.

use crate::request::WatchedFile;
use regex::Regex;
use spool_common::{Result, SpoolError};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default number of files emitted per tick
pub const DEFAULT_MAX_PER_POLL: usize = 1;

/// Default file name pattern
pub const DEFAULT_FILE_PATTERN: &str = "*.csv";

/// File name glob supporting `*` and `?`, matched against the whole name
#[derive(Debug, Clone)]
pub struct FilePattern {
    glob: String,
    regex: Regex,
}

impl FilePattern {
    pub fn new(glob: &str) -> Result<Self> {
        if glob.is_empty() {
            return Err(SpoolError::Config("file pattern must not be empty".to_string()));
        }

        let mut expr = String::with_capacity(glob.len() + 8);
        expr.push('^');
        for c in glob.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr)
            .map_err(|e| SpoolError::Config(format!("invalid file pattern {glob:?}: {e}")))?;

        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.regex.is_match(file_name)
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }
}

/// Files currently owned by a job, shared by the poller and the workers
#[derive(Debug, Clone, Default)]
pub struct ClaimSet {
    inner: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a path. Returns `false` if it was already claimed.
    pub fn claim(&self, path: &Path) -> bool {
        match self.inner.lock() {
            Ok(mut claims) => claims.insert(path.to_path_buf()),
            Err(poisoned) => poisoned.into_inner().insert(path.to_path_buf()),
        }
    }

    pub fn release(&self, path: &Path) {
        match self.inner.lock() {
            Ok(mut claims) => claims.remove(path),
            Err(poisoned) => poisoned.into_inner().remove(path),
        };
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(claims) => claims.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Watches one directory for new files
#[derive(Debug, Clone)]
pub struct DirectoryPoller {
    dir: PathBuf,
    pattern: FilePattern,
    interval: Duration,
    max_per_poll: usize,
    claims: ClaimSet,
}

impl DirectoryPoller {
    pub fn new(dir: impl Into<PathBuf>, pattern: FilePattern) -> Self {
        Self {
            dir: dir.into(),
            pattern,
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_per_poll: DEFAULT_MAX_PER_POLL,
            claims: ClaimSet::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_per_poll(mut self, max_per_poll: usize) -> Self {
        self.max_per_poll = max_per_poll;
        self
    }

    pub fn with_claims(mut self, claims: ClaimSet) -> Self {
        self.claims = claims;
        self
    }

    pub fn claims(&self) -> &ClaimSet {
        &self.claims
    }

    /// List the directory once and claim up to `max_per_poll` new files
    pub async fn scan(&self) -> Result<Vec<WatchedFile>> {
        let unreadable = |source| SpoolError::DirectoryUnreadable {
            path: self.dir.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(unreadable)?;
        let mut candidates = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(unreadable)? {
            let is_file = match entry.file_type().await {
                Ok(file_type) => file_type.is_file(),
                Err(e) => {
                    debug!(path = %entry.path().display(), error = %e, "Skipping entry");
                    false
                },
            };
            if !is_file {
                continue;
            }

            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if self.pattern.matches(&name) {
                candidates.push((name, entry.path()));
            }
        }

        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut selected = Vec::new();
        for (_, path) in candidates {
            if selected.len() >= self.max_per_poll {
                break;
            }
            if !self.claims.claim(&path) {
                continue;
            }
            match WatchedFile::new(path.clone()) {
                Ok(file) => selected.push(file),
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring file"),
            }
        }

        Ok(selected)
    }

    /// Poll until cancelled, sending claimed files to `tx`
    ///
    /// Sending waits for channel capacity, so a full queue holds the poller
    /// back instead of growing.
    pub async fn run(self, tx: mpsc::Sender<WatchedFile>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            dir = %self.dir.display(),
            pattern = self.pattern.as_str(),
            interval_ms = self.interval.as_millis() as u64,
            max_per_poll = self.max_per_poll,
            "Directory poller started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }

            trace!(dir = %self.dir.display(), "Polling directory");

            let files = match self.scan().await {
                Ok(files) => files,
                Err(e) => {
                    warn!(error = %e, "Directory scan failed, retrying next tick");
                    continue;
                },
            };

            for file in files {
                debug!(path = %file.path.display(), "Discovered file");
                let path = file.path.clone();
                let sent = tokio::select! {
                    _ = cancel.cancelled() => false,
                    result = tx.send(file) => result.is_ok(),
                };
                if !sent {
                    self.claims.release(&path);
                    info!("Directory poller stopped");
                    return;
                }
            }
        }

        info!("Directory poller stopped");
    }
}
