//! Watch-folder service
//!
//! Wires the pieces together: one poller task feeds discovered files through
//! a bounded channel to a fixed number of worker tasks. Each worker builds the
//! job descriptor and runs the job to completion before taking the next file.

use crate::codec::RecordCodec;
use crate::config::SpoolConfig;
use crate::model::Person;
use crate::orchestrator::{JobExecution, JobOrchestrator, JobState};
use crate::pipeline::ChunkedPipeline;
use crate::poller::{ClaimSet, DirectoryPoller, FilePattern};
use crate::repository::JobRepository;
use crate::request::{JobRequestBuilder, WatchedFile};
use crate::transform::{Transformer, UppercaseTransformer};
use serde::{de::DeserializeOwned, Serialize};
use spool_common::{Result, SpoolError};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Poller plus worker pool around one orchestrator
pub struct SpoolService<R, T> {
    poller: DirectoryPoller,
    builder: JobRequestBuilder,
    orchestrator: Arc<JobOrchestrator<R, T>>,
    workers: usize,
    queue_capacity: usize,
}

impl SpoolService<Person, UppercaseTransformer> {
    /// The person-file service described by `config`
    pub fn from_config(config: &SpoolConfig, repository: Arc<dyn JobRepository>) -> Result<Self> {
        let codec = RecordCodec::new(Person::FIELD_NAMES).with_delimiter(config.delimiter_byte());
        let pipeline = ChunkedPipeline::new(config.chunk_size, Arc::new(UppercaseTransformer))?;
        let orchestrator = JobOrchestrator::new(codec, pipeline, repository);

        let poller = DirectoryPoller::new(&config.input_dir, FilePattern::new(&config.file_pattern)?)
            .with_interval(config.poll_interval())
            .with_max_per_poll(config.max_per_poll);
        let builder = JobRequestBuilder::new(
            &config.output_dir,
            &config.processed_dir,
            &config.file_extension,
        );

        Ok(Self::new(poller, builder, orchestrator)
            .with_workers(config.workers, config.queue_capacity))
    }
}

impl<R, T> SpoolService<R, T>
where
    R: Serialize + DeserializeOwned + Send + 'static,
    T: Transformer<R> + 'static,
{
    pub fn new(
        poller: DirectoryPoller,
        builder: JobRequestBuilder,
        orchestrator: JobOrchestrator<R, T>,
    ) -> Self {
        Self {
            poller,
            builder,
            orchestrator: Arc::new(orchestrator),
            workers: 1,
            queue_capacity: 1,
        }
    }

    pub fn with_workers(mut self, workers: usize, queue_capacity: usize) -> Self {
        self.workers = workers.max(1);
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    pub fn claims(&self) -> &ClaimSet {
        self.poller.claims()
    }

    /// Process one file immediately, bypassing the poller
    pub async fn run_file(&self, path: impl AsRef<Path>) -> Result<JobExecution> {
        let file = WatchedFile::new(path.as_ref())?;
        let descriptor = self.builder.build(&file)?;
        self.orchestrator.launch(descriptor).await
    }

    /// Run the poller and workers until `cancel` fires
    ///
    /// Jobs already running when cancellation is requested finish first.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let claims = self.poller.claims().clone();

        info!(
            workers = self.workers,
            queue_capacity = self.queue_capacity,
            "Starting spool service"
        );

        let poller = tokio::spawn(self.poller.run(tx, cancel.clone()));

        let workers: Vec<_> = (0..self.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    rx: Arc::clone(&rx),
                    builder: self.builder.clone(),
                    orchestrator: Arc::clone(&self.orchestrator),
                    claims: claims.clone(),
                };
                tokio::spawn(worker.run(cancel.clone()))
            })
            .collect();

        if let Err(e) = poller.await {
            error!(error = %e, "Directory poller task failed");
        }
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }

        info!("Spool service stopped");
        Ok(())
    }
}

struct Worker<R, T> {
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<WatchedFile>>>,
    builder: JobRequestBuilder,
    orchestrator: Arc<JobOrchestrator<R, T>>,
    claims: ClaimSet,
}

impl<R, T> Worker<R, T>
where
    R: Serialize + DeserializeOwned + Send + 'static,
    T: Transformer<R> + 'static,
{
    async fn run(self, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                file = async { self.rx.lock().await.recv().await } => file,
            };
            let Some(file) = next else {
                break;
            };

            self.process(file).await;
        }

        info!(worker = self.id, "Worker stopped");
    }

    /// Run one discovered file. The claim is released only once the file has
    /// been archived; on any failure it stays claimed and is not retried.
    async fn process(&self, file: WatchedFile) {
        let descriptor = match self.builder.build(&file) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "Skipping file");
                return;
            },
        };

        match self.orchestrator.launch(descriptor).await {
            Ok(execution) if execution.state() == JobState::Completed => {
                self.claims.release(&file.path);
            },
            Ok(_) => {},
            Err(e @ SpoolError::DuplicateJob(_)) => {
                warn!(path = %file.path.display(), error = %e, "Job not run");
            },
            Err(e) => {
                error!(path = %file.path.display(), error = %e, "Job could not be recorded");
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::repository::InMemoryJobRepository;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(root: &Path) -> SpoolConfig {
        SpoolConfig {
            input_dir: root.join("input"),
            output_dir: root.join("output"),
            processed_dir: root.join("processed"),
            poll_interval_ms: 10,
            ..SpoolConfig::default()
        }
    }

    fn outputs(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map(|entries| entries.map(|e| e.unwrap().path()).collect())
            .unwrap_or_default();
        files.sort();
        files
    }

    #[tokio::test]
    async fn test_run_file_completes_job() {
        let temp = TempDir::new().unwrap();
        let config = config(temp.path());
        std::fs::create_dir_all(&config.input_dir).unwrap();
        let input = config.input_dir.join("people.csv");
        std::fs::write(&input, "john,doe\n").unwrap();

        let service =
            SpoolService::from_config(&config, Arc::new(InMemoryJobRepository::new())).unwrap();
        let execution = service.run_file(&input).await.unwrap();

        assert_eq!(execution.state(), JobState::Completed);
        assert!(config.processed_dir.join("people.csv").exists());
        let written = std::fs::read_to_string(&execution.descriptor.output_path).unwrap();
        assert_eq!(written, "JOHN,DOE\n");
    }

    #[tokio::test]
    async fn test_run_file_rejects_wrong_extension() {
        let temp = TempDir::new().unwrap();
        let config = config(temp.path());
        let service =
            SpoolService::from_config(&config, Arc::new(InMemoryJobRepository::new())).unwrap();

        let err = service.run_file(temp.path().join("people.txt")).await.unwrap_err();
        assert!(matches!(err, SpoolError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_service_processes_dropped_files_until_cancelled() {
        let temp = TempDir::new().unwrap();
        let config = config(temp.path());
        std::fs::create_dir_all(&config.input_dir).unwrap();
        std::fs::write(config.input_dir.join("a.csv"), "ann,lee\n").unwrap();
        std::fs::write(config.input_dir.join("b.csv"), "bob,ray\n").unwrap();

        let service =
            SpoolService::from_config(&config, Arc::new(InMemoryJobRepository::new())).unwrap();
        let claims = service.claims().clone();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(service.run(cancel.clone()));

        let processed = config.processed_dir.clone();
        tokio::time::timeout(Duration::from_secs(10), async {
            while outputs(&processed).len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(outputs(&config.output_dir).len(), 2);
        assert!(outputs(&config.input_dir).is_empty());
        assert!(claims.is_empty());
    }
}
