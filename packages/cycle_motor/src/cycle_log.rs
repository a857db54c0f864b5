//! Durable storage of cycle results as a stream of packed records.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    BoxError, CycleResult, CycleResultsSegment, Error, Output, PACKED_RECORD_LEN, PackedSegment,
    Result,
};

/// An [`Output`] that appends every segment to a byte stream as packed records.
///
/// The stream is a plain concatenation of 9-byte records (see [`PackedSegment`]) in the order
/// segments arrive. Read it back with [`CycleLogReader`].
pub struct CycleLogOutput<W: Write + Send> {
    writer: Mutex<BufWriter<W>>,
    records: AtomicU64,
}

impl CycleLogOutput<File> {
    /// Creates or truncates the file at `path` and writes the log to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "creating cycle log");
        Ok(Self::new(File::create(path)?))
    }
}

impl<W: Write + Send> CycleLogOutput<W> {
    /// Writes the log to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(writer)),
            records: AtomicU64::new(0),
        }
    }

    /// The number of records written so far.
    #[must_use]
    pub fn records_written(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// Flushes buffered records and returns the underlying writer.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))
    }
}

impl<W: Write + Send> Output for CycleLogOutput<W> {
    fn on_cycle_result_segment(
        &self,
        segment: &CycleResultsSegment,
    ) -> std::result::Result<(), BoxError> {
        let packed = segment.to_packed();

        self.writer.lock().write_all(packed.as_bytes())?;

        let count = u64::try_from(packed.len()).unwrap_or(u64::MAX);
        self.records.fetch_add(count, Ordering::Relaxed);

        Ok(())
    }

    fn close(&self) -> std::result::Result<(), BoxError> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

impl<W: Write + Send> fmt::Debug for CycleLogOutput<W> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleLogOutput")
            .field("records", &self.records_written())
            .finish_non_exhaustive()
    }
}

/// Reads a stream written by [`CycleLogOutput`] back as segments.
#[derive(Debug)]
pub struct CycleLogReader<R: Read> {
    reader: BufReader<R>,
}

impl CycleLogReader<File> {
    /// Opens the log at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(File::open(path)?))
    }
}

impl<R: Read> CycleLogReader<R> {
    /// Reads the log from `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Reads up to `max_records` records as one packed segment.
    ///
    /// Returns `None` at the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the stream ends in the middle of a record.
    pub fn read_segment(&mut self, max_records: usize) -> Result<Option<CycleResultsSegment>> {
        let wanted = max_records.saturating_mul(PACKED_RECORD_LEN);
        let mut bytes = Vec::with_capacity(wanted);

        let read = (&mut self.reader)
            .take(u64::try_from(wanted).unwrap_or(u64::MAX))
            .read_to_end(&mut bytes)?;

        if read == 0 {
            return Ok(None);
        }

        PackedSegment::from_bytes(bytes).map(|packed| Some(packed.into()))
    }

    /// Reads all remaining records.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the stream ends in the middle of a record.
    pub fn read_all(mut self) -> Result<Vec<CycleResult>> {
        const BATCH_RECORDS: usize = 4096;

        let mut results = Vec::new();

        while let Some(segment) = self.read_segment(BATCH_RECORDS)? {
            results.extend(&segment);
        }

        Ok(results)
    }
}

impl<R: Read> From<R> for CycleLogReader<R> {
    fn from(reader: R) -> Self {
        Self::new(reader)
    }
}

/// Writes `results` to `writer` as packed records, without any buffering of its own.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_cycle_log(
    writer: &mut impl Write,
    results: impl IntoIterator<Item = CycleResult>,
) -> io::Result<()> {
    writer.write_all(PackedSegment::encode(results).as_bytes())
}
