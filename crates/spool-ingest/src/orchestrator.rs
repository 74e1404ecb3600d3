//! Job orchestration
//!
//! A job runs two steps in a fixed order: the chunked pipeline, then the
//! cleanup step that archives the input. Cleanup only starts after the
//! pipeline succeeded. Every job walks the state machine
//!
//! ```text
//! Queued -> Running(Pipeline) -> Running(Cleanup) -> Completed
//!                  |                    |
//!                  +------> Failed <----+
//! ```
//!
//! and never leaves `Completed` or `Failed`.

use crate::cleanup::CleanupStep;
use crate::codec::RecordCodec;
use crate::pipeline::{ChunkedPipeline, CsvFileSink, CsvFileSource, PipelineStats};
use crate::repository::JobRepository;
use crate::request::{JobDescriptor, JobKey};
use crate::transform::Transformer;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use spool_common::{Result, SpoolError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{error, info, info_span, warn, Instrument};

/// The two steps of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    /// Read, transform and write the records
    Pipeline,
    /// Archive the input into the processed directory
    Cleanup,
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepName::Pipeline => write!(f, "pipeline"),
            StepName::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Admitted, no step started yet
    Queued,
    /// Executing the given step
    Running(StepName),
    /// Both steps succeeded
    Completed,
    /// A step failed; the error is on the execution
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether `self -> next` is an edge of the job state machine
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running(StepName::Pipeline))
                | (
                    JobState::Running(StepName::Pipeline),
                    JobState::Running(StepName::Cleanup)
                )
                | (JobState::Running(StepName::Cleanup), JobState::Completed)
                | (JobState::Running(_), JobState::Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running(step) => write!(f, "running({step})"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// Outcome of one step of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub name: StepName,
    pub status: StepStatus,
    pub stats: PipelineStats,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// One job run, from launch to its terminal state
#[derive(Debug)]
pub struct JobExecution {
    pub descriptor: JobDescriptor,
    state: JobState,
    pub steps: Vec<StepExecution>,
    /// The step failure that ended the job, if any
    pub error: Option<SpoolError>,
    /// Output was written but the input could not be archived
    pub needs_reconciliation: bool,
    /// Location of the archived input once cleanup succeeded
    pub archived_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    /// Set when the job reaches a terminal state
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobExecution {
    pub fn new(descriptor: JobDescriptor) -> Self {
        Self {
            descriptor,
            state: JobState::Queued,
            steps: Vec::new(),
            error: None,
            needs_reconciliation: false,
            archived_path: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.descriptor.job_key
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn step(&self, name: StepName) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Move to `next`, refusing any edge outside the state machine
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SpoolError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Runs jobs: pipeline step, then cleanup step
pub struct JobOrchestrator<R, T> {
    codec: RecordCodec<R>,
    pipeline: ChunkedPipeline<R, T>,
    repository: Arc<dyn JobRepository>,
    active: Mutex<HashMap<JobKey, JobState>>,
}

impl<R, T> JobOrchestrator<R, T>
where
    R: Serialize + DeserializeOwned + Send + 'static,
    T: Transformer<R> + 'static,
{
    pub fn new(
        codec: RecordCodec<R>,
        pipeline: ChunkedPipeline<R, T>,
        repository: Arc<dyn JobRepository>,
    ) -> Self {
        Self {
            codec,
            pipeline,
            repository,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// State of a job that is currently being launched or run
    pub fn state_of(&self, key: &JobKey) -> Option<JobState> {
        self.active.lock().ok()?.get(key).copied()
    }

    /// Run one job to a terminal state
    ///
    /// A job whose key is already known to the repository, or is running
    /// right now, is rejected with [`SpoolError::DuplicateJob`] and nothing
    /// runs. Step failures do not produce `Err`: the returned execution is
    /// `Failed` and carries the error.
    pub async fn launch(&self, descriptor: JobDescriptor) -> Result<JobExecution> {
        let key = descriptor.job_key.clone();
        let span = info_span!("job", job_key = %key);

        self.admit(&key).await?;
        let mut execution = JobExecution::new(descriptor);

        let outcome = self.execute(&mut execution).instrument(span.clone()).await;
        self.release(&key);
        outcome?;

        span.in_scope(|| match execution.state() {
            JobState::Completed => {
                info!(
                    output = %execution.descriptor.output_path.display(),
                    "Job completed"
                );
            },
            state => {
                error!(
                    %state,
                    needs_reconciliation = execution.needs_reconciliation,
                    error = ?execution.error.as_ref().map(ToString::to_string),
                    "Job failed"
                );
            },
        });

        Ok(execution)
    }

    /// Claim `key` in the active table, then check the repository
    ///
    /// The claim comes first: a running job keeps its key claimed until it
    /// has been recorded, so a concurrent launch of the same key is either
    /// rejected by the claim or sees the recorded job.
    async fn admit(&self, key: &JobKey) -> Result<()> {
        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| SpoolError::Repository("active job table poisoned".to_string()))?;
            if active.contains_key(key) {
                warn!(job_key = %key, "Job already running, refusing to start it twice");
                return Err(SpoolError::DuplicateJob(key.to_string()));
            }
            active.insert(key.clone(), JobState::Queued);
        }

        match self.repository.exists(key).await {
            Ok(false) => Ok(()),
            Ok(true) => {
                self.release(key);
                warn!(job_key = %key, "Job already executed, refusing to run it again");
                Err(SpoolError::DuplicateJob(key.to_string()))
            },
            Err(e) => {
                self.release(key);
                Err(e)
            },
        }
    }

    fn release(&self, key: &JobKey) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(key);
        }
    }

    fn publish(&self, execution: &mut JobExecution, next: JobState) -> Result<()> {
        execution.transition(next)?;
        if let Ok(mut active) = self.active.lock() {
            active.insert(execution.key().clone(), next);
        }
        Ok(())
    }

    async fn execute(&self, execution: &mut JobExecution) -> Result<()> {
        self.publish(execution, JobState::Running(StepName::Pipeline))?;
        info!(
            input = %execution.descriptor.input_path.display(),
            output = %execution.descriptor.output_path.display(),
            "Starting pipeline step"
        );

        let started_at = Utc::now();
        let (stats, result) = self.run_pipeline(&execution.descriptor).await;
        let pipeline_ok = result.is_ok();
        execution.steps.push(StepExecution {
            name: StepName::Pipeline,
            status: step_status(pipeline_ok),
            stats,
            started_at,
            ended_at: Utc::now(),
        });

        if let Err(e) = result {
            execution.error = Some(e);
            self.publish(execution, JobState::Failed)?;
            return self.finish(execution).await;
        }

        info!(
            read = stats.read_count,
            written = stats.write_count,
            chunks = stats.commit_count,
            "Pipeline step completed"
        );

        self.publish(execution, JobState::Running(StepName::Cleanup))?;
        let started_at = Utc::now();
        let step = CleanupStep::new(
            execution.descriptor.input_path.clone(),
            execution.descriptor.processed_dir_path.clone(),
        );
        let result = tokio::task::spawn_blocking(move || step.execute())
            .await
            .unwrap_or_else(|e| Err(join_error("cleanup", e)));
        execution.steps.push(StepExecution {
            name: StepName::Cleanup,
            status: step_status(result.is_ok()),
            stats: PipelineStats::default(),
            started_at,
            ended_at: Utc::now(),
        });

        match result {
            Ok(archived) => {
                execution.archived_path = Some(archived);
                self.publish(execution, JobState::Completed)?;
            },
            Err(e) => {
                error!(
                    output = %execution.descriptor.output_path.display(),
                    input = %execution.descriptor.input_path.display(),
                    error = %e,
                    "Output written but input not archived; reconcile manually"
                );
                execution.needs_reconciliation = true;
                execution.error = Some(e);
                self.publish(execution, JobState::Failed)?;
            },
        }

        self.finish(execution).await
    }

    async fn finish(&self, execution: &JobExecution) -> Result<()> {
        self.repository
            .record(execution.key(), execution.state())
            .await
    }

    /// Run the pipeline step on the blocking pool
    async fn run_pipeline(&self, descriptor: &JobDescriptor) -> (PipelineStats, Result<()>) {
        let pipeline = self.pipeline.clone();
        let codec = self.codec.clone();
        let input = descriptor.input_path.clone();
        let output = descriptor.output_path.clone();

        tokio::task::spawn_blocking(move || {
            let mut stats = PipelineStats::default();
            let result = CsvFileSource::open(&input, codec.clone())
                .and_then(|source| Ok((source, CsvFileSink::create(&output, codec)?)))
                .and_then(|(mut source, mut sink)| {
                    pipeline.run_with_stats(&mut source, &mut sink, &mut stats)
                });
            (stats, result)
        })
        .await
        .unwrap_or_else(|e| (PipelineStats::default(), Err(join_error("pipeline", e))))
    }
}

fn step_status(ok: bool) -> StepStatus {
    if ok {
        StepStatus::Completed
    } else {
        StepStatus::Failed
    }
}

fn join_error(step: &str, err: tokio::task::JoinError) -> SpoolError {
    SpoolError::Io(std::io::Error::other(format!("{step} step aborted: {err}")))
}
