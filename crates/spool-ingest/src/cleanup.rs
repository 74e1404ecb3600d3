//! Archival of processed input files

use spool_common::checksum::compute_file_checksum;
use spool_common::{Result, SpoolError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Moves a job's input file into the processed directory, keeping its name
///
/// The move never replaces an existing archived file. It is done with a hard
/// link followed by removal of the original; where linking is not possible
/// (different file systems, no link support) the file is copied, the copy is
/// checked against the original's SHA-256 and the original is removed.
#[derive(Debug, Clone)]
pub struct CleanupStep {
    input_path: PathBuf,
    processed_dir: PathBuf,
}

impl CleanupStep {
    pub fn new(input_path: impl Into<PathBuf>, processed_dir: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            processed_dir: processed_dir.into(),
        }
    }

    /// Archive the input and return its new path
    pub fn execute(&self) -> Result<PathBuf> {
        let file_name = self
            .input_path
            .file_name()
            .ok_or_else(|| self.failure("input path has no file name"))?;

        if !self.input_path.is_file() {
            return Err(self.failure("input file no longer exists"));
        }

        fs::create_dir_all(&self.processed_dir).map_err(|e| {
            self.failure(format!(
                "cannot create processed directory {}: {e}",
                self.processed_dir.display()
            ))
        })?;

        let target = self.processed_dir.join(file_name);

        match fs::hard_link(&self.input_path, &target) {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(self.already_archived(&target));
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(self.failure("input file no longer exists"));
            },
            Err(e) => {
                debug!(error = %e, "Hard link failed, falling back to copy");
                self.copy_verified(&target)?;
            },
        }

        fs::remove_file(&self.input_path)
            .map_err(|e| self.failure(format!("archived but could not remove input: {e}")))?;

        info!(
            from = %self.input_path.display(),
            to = %target.display(),
            "Archived input file"
        );

        Ok(target)
    }

    fn copy_verified(&self, target: &Path) -> Result<()> {
        let mut destination = match OpenOptions::new().write(true).create_new(true).open(target) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(self.already_archived(target));
            },
            Err(e) => return Err(self.failure(format!("cannot create archive copy: {e}"))),
        };

        let copied = File::open(&self.input_path)
            .and_then(|mut source| io::copy(&mut source, &mut destination))
            .and_then(|_| destination.sync_all());

        let verified = copied.map_err(SpoolError::from).and_then(|()| {
            let expected = compute_file_checksum(&self.input_path)?;
            spool_common::checksum::verify_file_checksum(target, &expected)
        });

        if let Err(e) = verified {
            // Only the partial copy made above is removed.
            let _ = fs::remove_file(target);
            return Err(self.failure(format!("archive copy failed: {e}")));
        }

        Ok(())
    }

    fn already_archived(&self, target: &Path) -> SpoolError {
        self.failure(format!("{} already exists", target.display()))
    }

    fn failure(&self, reason: impl Into<String>) -> SpoolError {
        SpoolError::CleanupFailure {
            path: self.input_path.clone(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf, PathBuf) {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("input");
        fs::create_dir_all(&input).unwrap();
        let file = input.join("people.csv");
        fs::write(&file, "john,doe\njane,smith\n").unwrap();
        let processed = temp.path().join("processed");
        (temp, file, processed)
    }

    #[test]
    fn test_moves_file_keeping_name() {
        let (_temp, file, processed) = setup();

        let archived = CleanupStep::new(&file, &processed).execute().unwrap();

        assert_eq!(archived, processed.join("people.csv"));
        assert!(!file.exists());
        assert_eq!(
            fs::read_to_string(&archived).unwrap(),
            "john,doe\njane,smith\n"
        );
    }

    #[test]
    fn test_missing_input_fails() {
        let (_temp, file, processed) = setup();
        fs::remove_file(&file).unwrap();

        let err = CleanupStep::new(&file, &processed).execute().unwrap_err();
        assert!(matches!(err, SpoolError::CleanupFailure { .. }));
        assert!(err.needs_reconciliation());
    }

    #[test]
    fn test_never_overwrites_archived_file() {
        let (_temp, file, processed) = setup();
        fs::create_dir_all(&processed).unwrap();
        fs::write(processed.join("people.csv"), "older\n").unwrap();

        let err = CleanupStep::new(&file, &processed).execute().unwrap_err();

        assert!(matches!(err, SpoolError::CleanupFailure { .. }));
        assert!(file.exists());
        assert_eq!(
            fs::read_to_string(processed.join("people.csv")).unwrap(),
            "older\n"
        );
    }

    #[test]
    fn test_copy_fallback_verifies_and_refuses_overwrite() {
        let (_temp, file, processed) = setup();
        fs::create_dir_all(&processed).unwrap();
        let step = CleanupStep::new(&file, &processed);
        let target = processed.join("people.csv");

        step.copy_verified(&target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), fs::read(&file).unwrap());

        let err = step.copy_verified(&target).unwrap_err();
        assert!(matches!(err, SpoolError::CleanupFailure { .. }));
    }
}
