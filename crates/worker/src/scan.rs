//! Runs one SQL scan over the CSV files in the data directory.

use crate::config::WorkerSettings;
use crate::error::WorkerError;
use arrow::record_batch::RecordBatch;
use futures::StreamExt;
use igloo_connector::{Command, ExecutionContext};
use igloo_connector_filesystem::{CsvConnector, CsvTranslator};
use igloo_dispatch::{
    AtomicRequest, ChannelReceiver, ConnectorManager, Delivery, FlowControl, RequestCommand,
};
use std::sync::Arc;
use tracing::{debug, info};

pub fn scan_request(settings: &WorkerSettings, query_id: &str, sql: &str) -> Result<AtomicRequest, WorkerError> {
    let command = Command::parse(sql)?;
    let mut connector = CsvConnector::new();
    if settings.await_files {
        connector = connector.await_file(settings.poll_interval());
    }
    let context = ExecutionContext { fetch_size: settings.fetch_size, ..ExecutionContext::default() };

    Ok(AtomicRequest::new(query_id, 0, RequestCommand::Untranslated(command))
        .with_context(context)
        .with_translator(Arc::new(CsvTranslator::new(&settings.data_dir)))
        .with_connector(connector))
}

/// Submits the scan and collects its batches, asking for more rows whenever
/// the manager pauses between batches.
pub async fn run_scan(
    manager: &ConnectorManager,
    request: AtomicRequest,
) -> Result<Vec<RecordBatch>, WorkerError> {
    let (receiver, mut deliveries) = ChannelReceiver::new();
    let request_id = manager.execute_request(request, receiver).await?;
    info!(request_id = %request_id, "scan submitted");

    let paused = manager.settings().flow_control == FlowControl::Paused;
    let mut batches = Vec::new();
    while let Some((id, delivery)) = deliveries.next().await {
        if id != request_id {
            continue;
        }
        match delivery {
            Delivery::Batch(batch) => {
                debug!(request_id = %id, sequence = batch.sequence, rows = batch.num_rows(), "batch received");
                let is_last = batch.is_last;
                batches.push(batch.rows);
                if paused && !is_last {
                    manager.more_requested(&request_id).await;
                }
            }
            Delivery::Done => {
                info!(request_id = %id, batches = batches.len(), "scan finished");
                return Ok(batches);
            }
            Delivery::Cancelled => return Err(WorkerError::Cancelled(id.to_string())),
            Delivery::Error(e) => return Err(e.into()),
        }
    }
    Err(WorkerError::Disconnected(request_id.to_string()))
}
