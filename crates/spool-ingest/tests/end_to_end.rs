//! End-to-end tests over real directories

#![allow(clippy::unwrap_used, clippy::expect_used)]

use spool_common::SpoolError;
use spool_ingest::codec::RecordCodec;
use spool_ingest::config::SpoolConfig;
use spool_ingest::model::Person;
use spool_ingest::orchestrator::{JobOrchestrator, JobState, StepName};
use spool_ingest::pipeline::ChunkedPipeline;
use spool_ingest::poller::{DirectoryPoller, FilePattern};
use spool_ingest::repository::{FileJobRepository, InMemoryJobRepository, JobRepository};
use spool_ingest::request::{Clock, JobRequestBuilder, WatchedFile};
use spool_ingest::service::SpoolService;
use spool_ingest::transform::UppercaseTransformer;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct FixedClock(i64);

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.0
    }
}

struct Dirs {
    _temp: TempDir,
    input: PathBuf,
    output: PathBuf,
    processed: PathBuf,
}

impl Dirs {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("input");
        let output = temp.path().join("output");
        let processed = temp.path().join("processed");
        fs::create_dir_all(&input).unwrap();
        Self {
            _temp: temp,
            input,
            output,
            processed,
        }
    }

    fn drop_file(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.input.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn builder(&self, millis: i64) -> JobRequestBuilder {
        JobRequestBuilder::new(&self.output, &self.processed, "csv")
            .with_clock(Arc::new(FixedClock(millis)))
    }
}

fn orchestrator(
    chunk_size: usize,
    repository: Arc<dyn JobRepository>,
) -> JobOrchestrator<Person, UppercaseTransformer> {
    JobOrchestrator::new(
        RecordCodec::new(Person::FIELD_NAMES),
        ChunkedPipeline::new(chunk_size, Arc::new(UppercaseTransformer)).unwrap(),
        repository,
    )
}

fn list(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn test_people_file_is_uppercased_and_archived() {
    let dirs = Dirs::new();
    let input = dirs.drop_file("people.csv", "john,doe\njane,smith\n");

    let descriptor = dirs
        .builder(1700000000000)
        .build(&WatchedFile::new(&input).unwrap())
        .unwrap();
    let execution = orchestrator(10, Arc::new(InMemoryJobRepository::new()))
        .launch(descriptor)
        .await
        .unwrap();

    assert_eq!(execution.state(), JobState::Completed);
    assert_eq!(
        fs::read_to_string(dirs.output.join("people-out-1700000000000.csv")).unwrap(),
        "JOHN,DOE\nJANE,SMITH\n"
    );
    assert_eq!(list(&dirs.processed), vec!["people.csv"]);
    assert!(list(&dirs.input).is_empty());
}

#[tokio::test]
async fn test_malformed_line_keeps_committed_chunks_and_input() {
    let dirs = Dirs::new();
    let input = dirs.drop_file("people.csv", "ann,lee\nbob,ray\ncarl\ndora,fox\n");

    let descriptor = dirs
        .builder(9)
        .build(&WatchedFile::new(&input).unwrap())
        .unwrap();
    let output = descriptor.output_path.clone();
    let execution = orchestrator(1, Arc::new(InMemoryJobRepository::new()))
        .launch(descriptor)
        .await
        .unwrap();

    assert_eq!(execution.state(), JobState::Failed);
    assert!(matches!(
        execution.error,
        Some(SpoolError::MalformedRecord {
            line: 3,
            expected: 2,
            found: 1
        })
    ));
    let pipeline = execution.step(StepName::Pipeline).unwrap();
    assert_eq!(pipeline.stats.commit_count, 2);
    assert_eq!(pipeline.stats.rollback_count, 1);

    assert_eq!(fs::read_to_string(output).unwrap(), "ANN,LEE\nBOB,RAY\n");
    assert!(input.exists());
    assert!(list(&dirs.processed).is_empty());
}

#[tokio::test]
async fn test_empty_file_completes_with_empty_output() {
    let dirs = Dirs::new();
    let input = dirs.drop_file("empty.csv", "");

    let descriptor = dirs
        .builder(3)
        .build(&WatchedFile::new(&input).unwrap())
        .unwrap();
    let output = descriptor.output_path.clone();
    let execution = orchestrator(10, Arc::new(InMemoryJobRepository::new()))
        .launch(descriptor)
        .await
        .unwrap();

    assert_eq!(execution.state(), JobState::Completed);
    assert_eq!(execution.step(StepName::Pipeline).unwrap().stats.commit_count, 0);
    assert_eq!(fs::read_to_string(output).unwrap(), "");
    assert_eq!(list(&dirs.processed), vec!["empty.csv"]);
}

#[tokio::test]
async fn test_same_key_is_not_run_twice_across_restarts() {
    let dirs = Dirs::new();
    let history = dirs.processed.parent().unwrap().join("jobs.jsonl");
    let input = dirs.drop_file("people.csv", "john,doe\n");
    let descriptor = dirs
        .builder(77)
        .build(&WatchedFile::new(&input).unwrap())
        .unwrap();

    let repository = Arc::new(FileJobRepository::open(&history).await.unwrap());
    let first = orchestrator(10, repository)
        .launch(descriptor.clone())
        .await
        .unwrap();
    assert_eq!(first.state(), JobState::Completed);

    // Same name dropped again and stamped with the same instant.
    dirs.drop_file("people.csv", "jane,smith\n");
    let reopened = Arc::new(FileJobRepository::open(&history).await.unwrap());
    let err = orchestrator(10, reopened)
        .launch(descriptor)
        .await
        .unwrap_err();

    assert!(matches!(err, SpoolError::DuplicateJob(_)));
    assert_eq!(list(&dirs.output), vec!["people-out-77.csv"]);
    assert_eq!(list(&dirs.input), vec!["people.csv"]);
}

#[tokio::test]
async fn test_reprocessing_same_name_later_is_a_new_job() {
    let dirs = Dirs::new();
    let repository: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new());
    let orchestrator = orchestrator(10, repository);

    for millis in [100, 200] {
        let input = dirs.drop_file("people.csv", "john,doe\n");
        fs::remove_dir_all(&dirs.processed).ok();
        let descriptor = dirs
            .builder(millis)
            .build(&WatchedFile::new(&input).unwrap())
            .unwrap();
        let execution = orchestrator.launch(descriptor).await.unwrap();
        assert_eq!(execution.state(), JobState::Completed);
    }

    assert_eq!(
        list(&dirs.output),
        vec!["people-out-100.csv", "people-out-200.csv"]
    );
}

#[tokio::test]
async fn test_poller_feeds_service_end_to_end() {
    let dirs = Dirs::new();
    dirs.drop_file("b.csv", "bob,ray\n");
    dirs.drop_file("a.csv", "ann,lee\n");
    dirs.drop_file("notes.txt", "ignored\n");

    let config = SpoolConfig {
        input_dir: dirs.input.clone(),
        output_dir: dirs.output.clone(),
        processed_dir: dirs.processed.clone(),
        poll_interval_ms: 10,
        ..SpoolConfig::default()
    };
    let repository = Arc::new(InMemoryJobRepository::new());
    let service = SpoolService::from_config(&config, repository).unwrap();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(service.run(cancel.clone()));

    tokio::time::timeout(Duration::from_secs(10), async {
        while list(&dirs.processed).len() < 2 {
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

    assert_eq!(list(&dirs.processed), vec!["a.csv", "b.csv"]);
    assert_eq!(list(&dirs.input), vec!["notes.txt"]);
    assert_eq!(list(&dirs.output).len(), 2);
}

#[tokio::test]
async fn test_poller_skips_unreadable_directory_until_it_appears() {
    let temp = TempDir::new().unwrap();
    let watched = temp.path().join("later");
    let poller = DirectoryPoller::new(&watched, FilePattern::new("*.csv").unwrap());

    assert!(poller.scan().await.unwrap_err().is_recoverable());

    fs::create_dir(&watched).unwrap();
    fs::write(watched.join("people.csv"), "john,doe\n").unwrap();

    let files = poller.scan().await.unwrap();
    assert_eq!(files.len(), 1);
    assert!(poller.scan().await.unwrap().is_empty());
}
