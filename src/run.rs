//! Run persistence and pull handles.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::io::prelude::*;

use tempfile;

use crate::record::Record;

/// A sorted block persisted to external storage, read back as a pull stream.
///
/// A run's records are non-decreasing by the sort key. The handle is created
/// when a block is flushed, drained by the merger and then closed, releasing
/// its backing storage.
pub trait Run: Sized + Send {
    /// Run I/O error type.
    type Error: Error + Send + Sync + 'static;

    /// Persists `records` (already sorted) as run number `index` inside `dir`
    /// and returns a readable handle positioned at the first record.
    fn persist(
        dir: &tempfile::TempDir,
        index: usize,
        records: Vec<Record>,
        buf_size: Option<usize>,
    ) -> Result<Self, Self::Error>;

    /// Run number assigned at persist time. Runs are numbered in source
    /// order; the merger uses the number as its deterministic tie-break.
    fn index(&self) -> usize;

    /// Returns the next unread record without consuming it, or [`None`]
    /// once the run is exhausted.
    fn peek(&mut self) -> Result<Option<&Record>, Self::Error>;

    /// Consumes and returns the next record.
    fn next_record(&mut self) -> Result<Option<Record>, Self::Error>;

    /// Releases the run's backing storage. The default implementation
    /// drops the handle.
    fn close(self) {}
}

/// Run persistence/read error.
#[derive(Debug)]
pub enum RunError {
    /// Run file creation or I/O error.
    IO(io::Error),
    /// Record serialization error.
    Encode(rmp_serde::encode::Error),
    /// Record deserialization error.
    Decode(rmp_serde::decode::Error),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::IO(err) => write!(f, "run I/O operation failed: {}", err),
            RunError::Encode(err) => write!(f, "record serialization error: {}", err),
            RunError::Decode(err) => write!(f, "record deserialization error: {}", err),
        }
    }
}

impl Error for RunError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match self {
            RunError::IO(err) => err,
            RunError::Encode(err) => err,
            RunError::Decode(err) => err,
        })
    }
}

impl From<io::Error> for RunError {
    fn from(err: io::Error) -> Self {
        RunError::IO(err)
    }
}

/// MessagePack-encoded run stored in an unnamed temporary file.
/// The file is removed by the OS once the handle is dropped.
pub struct RmpRun {
    index: usize,
    reader: io::Take<io::BufReader<fs::File>>,
    head: Option<Record>,
}

impl RmpRun {
    fn read_record(&mut self) -> Result<Option<Record>, RunError> {
        if self.reader.limit() == 0 {
            return Ok(None);
        }
        rmp_serde::decode::from_read(&mut self.reader)
            .map(Some)
            .map_err(RunError::Decode)
    }
}

impl Run for RmpRun {
    type Error = RunError;

    fn persist(
        dir: &tempfile::TempDir,
        index: usize,
        records: Vec<Record>,
        buf_size: Option<usize>,
    ) -> Result<Self, RunError> {
        let tmp_file = tempfile::tempfile_in(dir)?;

        let mut writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, tmp_file.try_clone()?),
            None => io::BufWriter::new(tmp_file.try_clone()?),
        };

        for record in &records {
            rmp_serde::encode::write(&mut writer, record).map_err(RunError::Encode)?;
        }
        writer.flush()?;

        let mut reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, tmp_file.try_clone()?),
            None => io::BufReader::new(tmp_file.try_clone()?),
        };

        reader.rewind()?;
        let file_len = tmp_file.metadata()?.len();

        Ok(RmpRun {
            index,
            reader: reader.take(file_len),
            head: None,
        })
    }

    fn index(&self) -> usize {
        self.index
    }

    fn peek(&mut self) -> Result<Option<&Record>, RunError> {
        if self.head.is_none() {
            self.head = self.read_record()?;
        }
        Ok(self.head.as_ref())
    }

    fn next_record(&mut self) -> Result<Option<Record>, RunError> {
        if let Some(head) = self.head.take() {
            return Ok(Some(head));
        }
        self.read_record()
    }
}
