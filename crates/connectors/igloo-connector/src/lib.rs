//! Contracts between the Igloo dispatcher and data source plugins.
//!
//! A data source plugs in through a [`Translator`], which rewrites an
//! engine-neutral [`Command`] into a [`NativeQuery`], and a [`Connector`],
//! which opens an [`Execution`] for that query. The execution is the handle
//! the dispatcher polls for batches, cancels and closes.

pub mod command;

pub use command::{Command, NativeQuery};

use arrow::record_batch::RecordBatch;
use igloo_common::Result;
use std::sync::Arc;
use std::time::Duration;

/// Per-request execution context handed to translators and connectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub session_id: String,
    pub user: String,
    /// Preferred number of rows per batch.
    pub fetch_size: usize,
    pub transaction_id: Option<String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            user: String::new(),
            fetch_size: 1024,
            transaction_id: None,
        }
    }
}

/// Rows produced by a source, before the dispatcher numbers them.
#[derive(Debug, Clone)]
pub struct NativeBatch {
    pub rows: RecordBatch,
    /// Set when the source knows no rows follow this batch.
    pub is_last: bool,
    pub warnings: Vec<String>,
}

impl NativeBatch {
    pub fn new(rows: RecordBatch) -> Self {
        Self { rows, is_last: false, warnings: Vec::new() }
    }

    pub fn last(rows: RecordBatch) -> Self {
        Self { rows, is_last: true, warnings: Vec::new() }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Outcome of a single [`Execution::next`] call.
#[derive(Debug, Clone)]
pub enum NextBatch {
    Batch(NativeBatch),
    /// No data yet. The source may suggest how long to wait before asking again.
    NotReady(Option<Duration>),
    Done,
}

/// Rewrites engine-neutral commands for one kind of source.
///
/// Translation is a pure function of its inputs.
pub trait Translator: Send + Sync {
    fn translate(&self, command: &Command, context: &ExecutionContext) -> Result<NativeQuery>;
}

/// Opens executions against one external system.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn execute(
        &self,
        query: &NativeQuery,
        context: &ExecutionContext,
    ) -> Result<Arc<dyn Execution>>;
}

/// Handle to a running native execution.
///
/// `cancel` may be called concurrently with `next`. `close` is called exactly
/// once per opened execution, on every terminal path.
#[async_trait::async_trait]
pub trait Execution: Send + Sync {
    async fn next(&self) -> Result<NextBatch>;

    /// Best-effort native cancellation. Sources without one keep the default.
    async fn cancel(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()>;
}
