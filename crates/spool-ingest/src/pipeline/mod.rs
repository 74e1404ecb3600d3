//! Chunk-oriented read-transform-write step
//!
//! Records are read from a [`RecordSource`] in chunks of at most `chunk_size`,
//! transformed in source order, written to a [`RecordSink`] and committed
//! before the next chunk is read. A chunk is the unit of failure: when reading,
//! transforming or writing fails, the in-progress chunk is rolled back and the
//! step stops, while every chunk committed before it stays in the output.

pub mod file;

pub use file::{CsvFileSink, CsvFileSource};

use crate::transform::Transformer;
use serde::{Deserialize, Serialize};
use spool_common::{Result, SpoolError};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default number of records per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Pull-based source of records, read in order
pub trait RecordSource<R> {
    /// Next record, or `None` once the source is exhausted
    fn read(&mut self) -> Result<Option<R>>;
}

/// Destination for transformed chunks
pub trait RecordSink<R> {
    /// Stage a chunk. Nothing is visible until [`RecordSink::commit`].
    fn write(&mut self, chunk: &[R]) -> Result<()>;

    /// Make the staged chunk visible
    fn commit(&mut self) -> Result<()>;

    /// Discard whatever was staged since the last commit
    fn rollback(&mut self);
}

/// Counters for one pipeline run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Records decoded from the source
    pub read_count: usize,
    /// Records handed to the sink in committed chunks
    pub write_count: usize,
    pub commit_count: usize,
    /// Chunks discarded after a failure
    pub rollback_count: usize,
}

/// Chunked read-transform-write loop over a shared transformer
pub struct ChunkedPipeline<R, T> {
    chunk_size: usize,
    transformer: Arc<T>,
    _record: PhantomData<fn(R) -> R>,
}

impl<R, T> Clone for ChunkedPipeline<R, T> {
    fn clone(&self) -> Self {
        Self {
            chunk_size: self.chunk_size,
            transformer: Arc::clone(&self.transformer),
            _record: PhantomData,
        }
    }
}

impl<R, T> ChunkedPipeline<R, T>
where
    T: Transformer<R>,
{
    pub fn new(chunk_size: usize, transformer: Arc<T>) -> Result<Self> {
        if chunk_size == 0 {
            return Err(SpoolError::Config(
                "chunk size must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            chunk_size,
            transformer,
            _record: PhantomData,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Run the step to completion
    pub fn run<S, W>(&self, source: &mut S, sink: &mut W) -> Result<PipelineStats>
    where
        S: RecordSource<R> + ?Sized,
        W: RecordSink<R> + ?Sized,
    {
        let mut stats = PipelineStats::default();
        self.run_with_stats(source, sink, &mut stats)?;
        Ok(stats)
    }

    /// Run the step, accumulating counters into `stats`
    ///
    /// The counters stay meaningful when the step fails: they describe the
    /// chunks that were committed before the failure.
    pub fn run_with_stats<S, W>(
        &self,
        source: &mut S,
        sink: &mut W,
        stats: &mut PipelineStats,
    ) -> Result<()>
    where
        S: RecordSource<R> + ?Sized,
        W: RecordSink<R> + ?Sized,
    {
        loop {
            let chunk_number = stats.commit_count + 1;
            match self.process_chunk(source, sink, stats) {
                Ok(ChunkOutcome::Committed { exhausted: false }) => continue,
                Ok(ChunkOutcome::Committed { exhausted: true }) | Ok(ChunkOutcome::Empty) => {
                    return Ok(())
                },
                Err(e) => {
                    sink.rollback();
                    stats.rollback_count += 1;
                    warn!(chunk = chunk_number, error = %e, "Chunk rolled back");
                    return Err(e);
                },
            }
        }
    }

    fn process_chunk<S, W>(
        &self,
        source: &mut S,
        sink: &mut W,
        stats: &mut PipelineStats,
    ) -> Result<ChunkOutcome>
    where
        S: RecordSource<R> + ?Sized,
        W: RecordSink<R> + ?Sized,
    {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        let mut exhausted = false;

        while chunk.len() < self.chunk_size {
            match source.read()? {
                Some(record) => chunk.push(record),
                None => {
                    exhausted = true;
                    break;
                },
            }
        }

        if chunk.is_empty() {
            return Ok(ChunkOutcome::Empty);
        }
        stats.read_count += chunk.len();

        let transformed = chunk
            .iter()
            .map(|record| self.transformer.transform(record))
            .collect::<Result<Vec<R>>>()?;

        sink.write(&transformed)?;
        sink.commit()?;

        stats.write_count += transformed.len();
        stats.commit_count += 1;
        debug!(
            chunk = stats.commit_count,
            records = transformed.len(),
            "Chunk committed"
        );

        Ok(ChunkOutcome::Committed { exhausted })
    }
}

enum ChunkOutcome {
    Empty,
    Committed { exhausted: bool },
}
