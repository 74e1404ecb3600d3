//! Job repository
//!
//! The orchestrator asks the repository whether a job key has already been
//! executed before launching it, and records the final state afterwards.
//! Two implementations are provided: an in-memory one and a JSON-lines file
//! that survives restarts.

use crate::orchestrator::JobState;
use crate::request::JobKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spool_common::{Result, SpoolError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Durable store of job identities and their final states
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Whether a job with this key has already been recorded
    async fn exists(&self, key: &JobKey) -> Result<bool>;

    /// Record the final state of a job
    async fn record(&self, key: &JobKey, state: JobState) -> Result<()>;
}

/// One stored job outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub key: JobKey,
    /// Terminal state the job ended in
    pub state: JobState,
    pub recorded_at: DateTime<Utc>,
}

/// Process-local repository
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    records: RwLock<HashMap<JobKey, JobRecord>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &JobKey) -> Option<JobRecord> {
        self.records.read().await.get(key).cloned()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn exists(&self, key: &JobKey) -> Result<bool> {
        Ok(self.records.read().await.contains_key(key))
    }

    async fn record(&self, key: &JobKey, state: JobState) -> Result<()> {
        let record = JobRecord {
            key: key.clone(),
            state,
            recorded_at: Utc::now(),
        };
        self.records.write().await.insert(key.clone(), record);
        Ok(())
    }
}

/// Append-only JSON-lines file, one [`JobRecord`] per line
#[derive(Debug)]
pub struct FileJobRepository {
    path: PathBuf,
    records: RwLock<HashMap<JobKey, JobRecord>>,
}

impl FileJobRepository {
    /// Open the history file, loading any existing records
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = load_records(&path).await?;

        tracing::debug!(
            path = %path.display(),
            records = records.len(),
            "Loaded job history"
        );

        Ok(Self {
            path,
            records: RwLock::new(records.into_iter().map(|r| (r.key.clone(), r)).collect()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records ordered by key
    pub async fn records(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}

#[async_trait]
impl JobRepository for FileJobRepository {
    async fn exists(&self, key: &JobKey) -> Result<bool> {
        Ok(self.records.read().await.contains_key(key))
    }

    async fn record(&self, key: &JobKey, state: JobState) -> Result<()> {
        let record = JobRecord {
            key: key.clone(),
            state,
            recorded_at: Utc::now(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        // Held across the append so lines from concurrent jobs never interleave.
        let mut records = self.records.write().await;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                SpoolError::Repository(format!("cannot open {}: {e}", self.path.display()))
            })?;
        file.write_all(&line).await?;
        file.sync_data().await?;

        records.insert(key.clone(), record);
        Ok(())
    }
}

async fn load_records(path: &Path) -> Result<Vec<JobRecord>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| {
                SpoolError::Repository(format!(
                    "{}:{}: invalid job record: {e}",
                    path.display(),
                    index + 1
                ))
            })
        })
        .collect()
}
