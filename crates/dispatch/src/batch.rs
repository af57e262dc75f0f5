use arrow::record_batch::RecordBatch;
use igloo_connector::NativeBatch;

/// A batch of rows as delivered to the engine.
#[derive(Debug, Clone)]
pub struct ResultBatch {
    /// Position of this batch within its request, starting at 0.
    pub sequence: u64,
    pub rows: RecordBatch,
    pub is_last: bool,
    pub warnings: Vec<String>,
}

impl ResultBatch {
    pub(crate) fn from_native(sequence: u64, native: NativeBatch) -> Self {
        Self { sequence, rows: native.rows, is_last: native.is_last, warnings: native.warnings }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.num_rows()
    }
}
