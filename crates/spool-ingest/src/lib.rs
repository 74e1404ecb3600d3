//! Spool Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Polls a directory for delimited record files and runs one job per file:
//! records are read, transformed and written in committed chunks, then the
//! input is archived.
//!
//! # Components
//!
//! - **Poller**: [`poller::DirectoryPoller`] claims new files on a fixed interval
//! - **Requests**: [`request::JobRequestBuilder`] turns a file into a job descriptor
//! - **Orchestrator**: [`orchestrator::JobOrchestrator`] runs the pipeline and cleanup steps
//! - **Pipeline**: [`pipeline::ChunkedPipeline`] with the [`codec::RecordCodec`]
//! - **History**: [`repository::JobRepository`] detects already-executed jobs
//!
//! # Example
//!
//! ```no_run
//! use spool_ingest::config::SpoolConfig;
//! use spool_ingest::repository::InMemoryJobRepository;
//! use spool_ingest::service::SpoolService;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SpoolConfig::from_env()?;
//!     let service = SpoolService::from_config(&config, Arc::new(InMemoryJobRepository::new()))?;
//!     let execution = service.run_file("./test_files/input/people.csv").await?;
//!     println!("{}", execution.state());
//!     Ok(())
//! }
//! ```

pub mod cleanup;
pub mod codec;
pub mod config;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod poller;
pub mod repository;
pub mod request;
pub mod service;
pub mod transform;
