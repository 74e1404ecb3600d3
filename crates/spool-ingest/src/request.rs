//! Turning discovered files into job descriptors
//!
//! A [`JobDescriptor`] carries everything one job needs: where to read, where
//! to write, where to archive, and the key that identifies the job instance.
//! The output file name embeds the creation timestamp, so two jobs for the
//! same input name never share an output path unless they were built in the
//! same millisecond.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spool_common::{Result, SpoolError};
use std::path::PathBuf;
use std::sync::Arc;

/// A file found in the watched directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub file_name: String,
    pub discovered_at: DateTime<Utc>,
}

impl WatchedFile {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                SpoolError::InvalidInput(format!(
                    "{} has no UTF-8 file name",
                    path.display()
                ))
            })?
            .to_string();

        Ok(Self {
            path,
            file_name,
            discovered_at: Utc::now(),
        })
    }
}

/// Identity of one job instance: input file name plus creation time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub file_name: String,
    pub created_at_millis: i64,
}

impl JobKey {
    pub fn new(file_name: impl Into<String>, created_at_millis: i64) -> Self {
        Self {
            file_name: file_name.into(),
            created_at_millis,
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.file_name, self.created_at_millis)
    }
}

/// Fully parameterized request for one file-processing job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub processed_dir_path: PathBuf,
    pub created_at_epoch_millis: i64,
    pub job_key: JobKey,
}

/// Source of the job creation timestamp
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Builds [`JobDescriptor`]s for files with a given extension
#[derive(Clone)]
pub struct JobRequestBuilder {
    output_dir: PathBuf,
    processed_dir: PathBuf,
    file_extension: String,
    clock: Arc<dyn Clock>,
}

impl JobRequestBuilder {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        processed_dir: impl Into<PathBuf>,
        file_extension: impl Into<String>,
    ) -> Self {
        let file_extension: String = file_extension.into();
        Self {
            output_dir: output_dir.into(),
            processed_dir: processed_dir.into(),
            file_extension: file_extension.trim_start_matches('.').to_string(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(&self, file: &WatchedFile) -> Result<JobDescriptor> {
        let now = self.clock.now_millis();
        let output_name = output_file_name(&file.file_name, &self.file_extension, now)?;
        let input_path = std::path::absolute(&file.path)?;

        Ok(JobDescriptor {
            input_path,
            output_path: self.output_dir.join(output_name),
            processed_dir_path: self.processed_dir.clone(),
            created_at_epoch_millis: now,
            job_key: JobKey::new(file.file_name.clone(), now),
        })
    }
}

/// `people.csv` -> `people-out-<millis>.csv`
///
/// The last occurrence of `.<extension>` is replaced. A name without it is
/// rejected, since keeping it unchanged would point the output at a file
/// named like the input.
pub fn output_file_name(file_name: &str, extension: &str, millis: i64) -> Result<String> {
    let suffix = format!(".{extension}");
    let Some(index) = file_name.rfind(&suffix) else {
        return Err(SpoolError::InvalidInput(format!(
            "{file_name} does not contain extension {suffix}"
        )));
    };

    Ok(format!(
        "{}-out-{millis}{suffix}{}",
        &file_name[..index],
        &file_name[index + suffix.len()..]
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Clock that advances by one millisecond per reading
    struct SteppingClock(AtomicI64);

    impl Clock for SteppingClock {
        fn now_millis(&self) -> i64 {
            self.0.fetch_add(1, Ordering::SeqCst)
        }
    }

    struct FixedClock(i64);

    impl Clock for FixedClock {
        fn now_millis(&self) -> i64 {
            self.0
        }
    }

    fn builder() -> JobRequestBuilder {
        JobRequestBuilder::new("/data/output", "/data/processed", "csv")
    }

    #[test]
    fn test_output_file_name() {
        assert_eq!(
            output_file_name("people.csv", "csv", 1700000000000).unwrap(),
            "people-out-1700000000000.csv"
        );
        assert_eq!(
            output_file_name("people.csv.csv", "csv", 5).unwrap(),
            "people.csv-out-5.csv"
        );
    }

    #[test]
    fn test_output_file_name_requires_extension() {
        let err = output_file_name("people.txt", "csv", 5).unwrap_err();
        assert!(matches!(err, SpoolError::InvalidInput(_)));
        assert!(output_file_name("peoplecsv", "csv", 5).is_err());
    }

    #[test]
    fn test_build_descriptor() {
        let builder = builder().with_clock(Arc::new(FixedClock(42)));
        let file = WatchedFile::new("/data/input/people.csv").unwrap();

        let descriptor = builder.build(&file).unwrap();

        assert_eq!(descriptor.input_path, PathBuf::from("/data/input/people.csv"));
        assert_eq!(
            descriptor.output_path,
            PathBuf::from("/data/output/people-out-42.csv")
        );
        assert_eq!(descriptor.processed_dir_path, PathBuf::from("/data/processed"));
        assert_eq!(descriptor.created_at_epoch_millis, 42);
        assert_eq!(descriptor.job_key, JobKey::new("people.csv", 42));
        assert_eq!(descriptor.job_key.to_string(), "people.csv@42");
    }

    #[test]
    fn test_relative_input_becomes_absolute() {
        let file = WatchedFile::new("input/people.csv").unwrap();
        let descriptor = builder().build(&file).unwrap();
        assert!(descriptor.input_path.is_absolute());
        assert!(descriptor.input_path.ends_with("input/people.csv"));
    }

    #[test]
    fn test_distinct_instants_give_distinct_jobs() {
        let builder = builder().with_clock(Arc::new(SteppingClock(AtomicI64::new(100))));
        let file = WatchedFile::new("/data/input/people.csv").unwrap();

        let first = builder.build(&file).unwrap();
        let second = builder.build(&file).unwrap();

        assert_ne!(first.job_key, second.job_key);
        assert_ne!(first.output_path, second.output_path);
    }

    #[test]
    fn test_same_instant_gives_same_key() {
        let builder = builder().with_clock(Arc::new(FixedClock(7)));
        let file = WatchedFile::new("/data/input/people.csv").unwrap();

        assert_eq!(
            builder.build(&file).unwrap().job_key,
            builder.build(&file).unwrap().job_key
        );
    }

    #[test]
    fn test_leading_dot_in_extension_is_ignored() {
        let builder =
            JobRequestBuilder::new("/out", "/done", ".csv").with_clock(Arc::new(FixedClock(1)));
        let file = WatchedFile::new("/in/a.csv").unwrap();
        assert_eq!(
            builder.build(&file).unwrap().output_path,
            PathBuf::from("/out/a-out-1.csv")
        );
    }
}
