//! Delimited file source and sink

use super::{RecordSink, RecordSource};
use crate::codec::RecordCodec;
use serde::{de::DeserializeOwned, Serialize};
use spool_common::{Result, SpoolError};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Lines, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Streams records from a delimited file, one line per record
///
/// Every line, blank ones included, must carry exactly the codec's declared
/// number of fields.
pub struct CsvFileSource<R> {
    lines: Lines<BufReader<File>>,
    line_number: u64,
    codec: RecordCodec<R>,
}

impl<R> CsvFileSource<R>
where
    R: Serialize + DeserializeOwned,
{
    pub fn open(path: impl AsRef<Path>, codec: RecordCodec<R>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_number: 0,
            codec,
        })
    }
}

impl<R> RecordSource<R> for CsvFileSource<R>
where
    R: Serialize + DeserializeOwned,
{
    fn read(&mut self) -> Result<Option<R>> {
        let Some(line) = self.lines.next() else {
            return Ok(None);
        };
        self.line_number += 1;

        let line = line.map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData => SpoolError::Parse {
                line: self.line_number,
                message: "line is not valid UTF-8".to_string(),
            },
            _ => SpoolError::Io(e),
        })?;

        self.codec.decode_line(&line, self.line_number).map(Some)
    }
}

/// Output file operations the sink relies on
pub trait OutputFile: Write + Seek {
    /// Cut the file back to `len` bytes
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Flush written data to stable storage
    fn sync(&mut self) -> io::Result<()>;
}

impl OutputFile for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Appends committed chunks to a new file
///
/// The file is created exclusively, so an existing output is never
/// overwritten. Written chunks are buffered in memory and only reach the file
/// on commit. A commit that fails partway is cut back to the end of the last
/// committed chunk, so the file only ever holds whole chunks.
pub struct CsvFileSink<R, F = File> {
    path: PathBuf,
    file: F,
    codec: RecordCodec<R>,
    staged: Vec<u8>,
    /// Length of the file after the last successful commit
    committed_len: u64,
}

impl<R> CsvFileSink<R, File>
where
    R: Serialize + DeserializeOwned,
{
    pub fn create(path: impl Into<PathBuf>, codec: RecordCodec<R>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| SpoolError::WriteFailure {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| SpoolError::WriteFailure {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file,
            codec,
            staged: Vec::new(),
            committed_len: 0,
        })
    }
}

impl<R, F: OutputFile> CsvFileSink<R, F> {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)?;
        self.file.flush()?;
        self.file.sync()
    }

    fn discard_partial_write(&mut self) -> io::Result<()> {
        self.file.truncate(self.committed_len)?;
        self.file.seek(SeekFrom::Start(self.committed_len))?;
        Ok(())
    }
}

impl<R, F> RecordSink<R> for CsvFileSink<R, F>
where
    R: Serialize + DeserializeOwned,
    F: OutputFile,
{
    fn write(&mut self, chunk: &[R]) -> Result<()> {
        for record in chunk {
            self.codec.encode_into(record, &mut self.staged)?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);

        match self.append(&staged) {
            Ok(()) => {
                self.committed_len += staged.len() as u64;
                Ok(())
            },
            Err(source) => {
                if let Err(e) = self.discard_partial_write() {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Could not cut partial chunk from output"
                    );
                }
                Err(SpoolError::WriteFailure {
                    path: self.path.clone(),
                    source,
                })
            },
        }
    }

    fn rollback(&mut self) {
        self.staged.clear();
    }
}
