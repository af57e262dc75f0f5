//! Filesystem connector
//!
//! Serves CSV files as an Igloo data source. [`CsvTranslator`] maps SELECTs
//! onto file paths and [`CsvConnector`] streams the file back in batches of
//! the requested fetch size.

pub mod translator;

pub use translator::CsvTranslator;

use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use csv::{Reader, ReaderBuilder, StringRecord};
use igloo_common::error::{Error, Result};
use igloo_connector::{Connector, Execution, ExecutionContext, NativeBatch, NativeQuery, NextBatch};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// A connector that reads CSV files.
#[derive(Debug, Clone)]
pub struct CsvConnector {
    has_header: bool,
    await_file: Option<Duration>,
}

impl Default for CsvConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvConnector {
    pub fn new() -> Self {
        Self { has_header: true, await_file: None }
    }

    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    /// Report "not ready" instead of failing while the file does not exist yet,
    /// suggesting `poll_interval` as the retry delay.
    pub fn await_file(mut self, poll_interval: Duration) -> Self {
        self.await_file = Some(poll_interval);
        self
    }
}

#[async_trait::async_trait]
impl Connector for CsvConnector {
    async fn execute(
        &self,
        query: &NativeQuery,
        context: &ExecutionContext,
    ) -> Result<Arc<dyn Execution>> {
        if context.fetch_size == 0 {
            return Err(Error::execution("fetch size must be positive"));
        }
        Ok(Arc::new(CsvExecution {
            path: PathBuf::from(&query.statement),
            projection: query.projection.clone(),
            limit: query.limit,
            fetch_size: context.fetch_size,
            has_header: self.has_header,
            await_file: self.await_file,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(ScanState::default()),
        }))
    }
}

#[derive(Default)]
struct ScanState {
    reader: Option<Reader<File>>,
    schema: Option<SchemaRef>,
    indices: Vec<usize>,
    emitted: usize,
    finished: bool,
    closed: bool,
}

/// A streaming scan of one CSV file.
pub struct CsvExecution {
    path: PathBuf,
    projection: Vec<String>,
    limit: Option<usize>,
    fetch_size: usize,
    has_header: bool,
    await_file: Option<Duration>,
    cancelled: AtomicBool,
    state: Mutex<ScanState>,
}

impl CsvExecution {
    fn csv_error(&self, e: csv::Error) -> Error {
        Error::execution(format!("failed to read {}: {}", self.path.display(), e))
    }

    fn open(&self, state: &mut ScanState) -> Result<()> {
        let file = File::open(&self.path)?;
        let mut reader = ReaderBuilder::new().has_headers(self.has_header).from_reader(file);

        // Without a header the first record only tells us the width; it is not consumed.
        let header = reader.headers().map_err(|e| self.csv_error(e))?.clone();
        let names: Vec<String> = if self.has_header {
            header.iter().map(str::to_string).collect()
        } else {
            (0..header.len()).map(|i| format!("column_{}", i)).collect()
        };

        let indices = if self.projection.is_empty() {
            (0..names.len()).collect()
        } else {
            self.projection
                .iter()
                .map(|column| {
                    names.iter().position(|n| n == column).ok_or_else(|| {
                        Error::execution(format!(
                            "column {} not found in {}",
                            column,
                            self.path.display()
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        let fields: Vec<Field> = indices
            .iter()
            .map(|&i| Field::new(names[i].clone(), DataType::Utf8, true))
            .collect();

        state.schema = Some(Arc::new(Schema::new(fields)));
        state.indices = indices;
        state.reader = Some(reader);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Execution for CsvExecution {
    async fn next(&self) -> Result<NextBatch> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(Error::execution(format!("scan of {} was cancelled", self.path.display())));
        }
        let mut guard = self.state.lock().map_err(|_| Error::execution("scan state poisoned"))?;
        let state = &mut *guard;
        if state.closed {
            return Err(Error::execution("execution already closed"));
        }
        if state.finished {
            return Ok(NextBatch::Done);
        }
        if state.reader.is_none() {
            if !self.path.exists() {
                if let Some(poll_interval) = self.await_file {
                    debug!(path = %self.path.display(), "waiting for file to appear");
                    return Ok(NextBatch::NotReady(Some(poll_interval)));
                }
            }
            self.open(state)?;
        }

        let want = match self.limit {
            Some(limit) => limit.saturating_sub(state.emitted).min(self.fetch_size),
            None => self.fetch_size,
        };
        let mut columns: Vec<Vec<String>> = vec![Vec::with_capacity(want); state.indices.len()];
        let mut record = StringRecord::new();
        let mut read = 0;
        if let Some(reader) = state.reader.as_mut() {
            while read < want {
                if !reader.read_record(&mut record).map_err(|e| self.csv_error(e))? {
                    state.finished = true;
                    break;
                }
                for (column, &i) in columns.iter_mut().zip(&state.indices) {
                    column.push(record.get(i).unwrap_or_default().to_string());
                }
                read += 1;
            }
        }
        state.emitted += read;
        if self.limit.is_some_and(|limit| state.emitted >= limit) {
            state.finished = true;
        }
        if read == 0 {
            state.finished = true;
            return Ok(NextBatch::Done);
        }

        let schema = state
            .schema
            .clone()
            .ok_or_else(|| Error::execution("scan opened without a schema"))?;
        let arrays: Vec<ArrayRef> = columns
            .into_iter()
            .map(|values| Arc::new(StringArray::from(values)) as ArrayRef)
            .collect();
        let rows = RecordBatch::try_new(schema, arrays)?;
        Ok(NextBatch::Batch(NativeBatch { rows, is_last: state.finished, warnings: Vec::new() }))
    }

    async fn cancel(&self) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::execution("scan state poisoned"))?;
        state.reader = None;
        state.closed = true;
        Ok(())
    }
}
