//! Spool Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities and error handling for the Spool workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the [`SpoolError`] taxonomy and [`Result`] alias
//! - **Logging**: tracing subscriber configuration shared by all binaries
//! - **Checksums**: file integrity verification used when archiving inputs
//!
//! # Example
//!
//! ```no_run
//! use spool_common::checksum::compute_file_checksum;
//! use spool_common::Result;
//!
//! fn fingerprint(path: &str) -> Result<()> {
//!     let checksum = compute_file_checksum(path)?;
//!     tracing::info!(%checksum, path, "Computed checksum");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, SpoolError};
