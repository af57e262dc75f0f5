#![allow(dead_code)]

use arrow::array::Int32Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::StreamExt;
use igloo_common::{Error, RequestId, Result};
use igloo_connector::{
    Connector, Execution, ExecutionContext, NativeBatch, NativeQuery, NextBatch,
};
use igloo_dispatch::{
    AtomicRequest, ConnectorManager, Delivery, DeliveryStream, FlowControl, NotReadyPolicy,
    RequestCommand, Settings,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One scripted answer to `Execution::next`.
#[derive(Debug, Clone)]
pub enum Step {
    Batch { rows: Vec<i32>, last: bool },
    /// A non-final batch that takes `delay` to produce.
    SlowBatch { rows: Vec<i32>, delay: Duration },
    NotReady(Option<Duration>),
    Done,
    Fail(String),
    /// Blocks until the execution is cancelled natively, then fails.
    BlockUntilCancelled,
    Panic(String),
}

pub fn batch(rows: &[i32]) -> Step {
    Step::Batch { rows: rows.to_vec(), last: false }
}

pub fn last_batch(rows: &[i32]) -> Step {
    Step::Batch { rows: rows.to_vec(), last: true }
}

/// Counters shared between a test and the connector it handed to the manager.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub opens: AtomicUsize,
    pub next_calls: AtomicUsize,
    pub cancels: AtomicUsize,
    pub closes: AtomicUsize,
}

impl CallCounts {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn next_calls(&self) -> usize {
        self.next_calls.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct ScriptedConnector {
    steps: Vec<Step>,
    fail_open: Option<String>,
    panic_on_close: bool,
    calls: Arc<CallCounts>,
}

impl ScriptedConnector {
    pub fn new(steps: Vec<Step>) -> (Self, Arc<CallCounts>) {
        let calls = Arc::new(CallCounts::default());
        (Self { steps, fail_open: None, panic_on_close: false, calls: Arc::clone(&calls) }, calls)
    }

    pub fn panicking_close(steps: Vec<Step>) -> (Self, Arc<CallCounts>) {
        let (mut connector, calls) = Self::new(steps);
        connector.panic_on_close = true;
        (connector, calls)
    }

    pub fn failing_open(message: &str) -> (Self, Arc<CallCounts>) {
        let (mut connector, calls) = Self::new(Vec::new());
        connector.fail_open = Some(message.to_string());
        (connector, calls)
    }
}

#[async_trait::async_trait]
impl Connector for ScriptedConnector {
    async fn execute(
        &self,
        _query: &NativeQuery,
        _context: &ExecutionContext,
    ) -> Result<Arc<dyn Execution>> {
        self.calls.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_open {
            return Err(Error::execution(message.clone()));
        }
        Ok(Arc::new(ScriptedExecution {
            steps: Mutex::new(self.steps.iter().cloned().collect()),
            calls: Arc::clone(&self.calls),
            cancelled: CancellationToken::new(),
            panic_on_close: self.panic_on_close,
        }))
    }
}

struct ScriptedExecution {
    steps: Mutex<VecDeque<Step>>,
    calls: Arc<CallCounts>,
    cancelled: CancellationToken,
    panic_on_close: bool,
}

#[async_trait::async_trait]
impl Execution for ScriptedExecution {
    async fn next(&self) -> Result<NextBatch> {
        self.calls.next_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            None | Some(Step::Done) => Ok(NextBatch::Done),
            Some(Step::Batch { rows, last }) => {
                let rows = int_batch(&rows);
                Ok(NextBatch::Batch(if last { NativeBatch::last(rows) } else { NativeBatch::new(rows) }))
            }
            Some(Step::SlowBatch { rows, delay }) => {
                tokio::time::sleep(delay).await;
                Ok(NextBatch::Batch(NativeBatch::new(int_batch(&rows))))
            }
            Some(Step::NotReady(delay)) => Ok(NextBatch::NotReady(delay)),
            Some(Step::Fail(message)) => Err(Error::execution(message)),
            Some(Step::BlockUntilCancelled) => {
                self.cancelled.cancelled().await;
                Err(Error::execution("execution cancelled"))
            }
            Some(Step::Panic(message)) => panic!("{}", message),
        }
    }

    async fn cancel(&self) -> Result<()> {
        self.calls.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancelled.cancel();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_close {
            panic!("close blew up");
        }
        Ok(())
    }
}

pub fn int_batch(values: &[i32]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values.to_vec()))])
        .expect("valid test batch")
}

pub fn int_values(rows: &RecordBatch) -> Vec<i32> {
    rows.column(0)
        .as_any()
        .downcast_ref::<Int32Array>()
        .expect("Int32 column")
        .values()
        .to_vec()
}

/// An already translated request against `connector`.
pub fn scripted_request(query_id: &str, connector: ScriptedConnector) -> AtomicRequest {
    AtomicRequest::new(query_id, 0, RequestCommand::Translated(NativeQuery::new("scripted")))
        .with_connector(connector)
}

pub fn test_settings(flow_control: FlowControl, not_ready_policy: NotReadyPolicy) -> Settings {
    Settings {
        flow_control,
        not_ready_policy,
        shutdown_grace_secs: 2,
        ..Settings::default()
    }
}

pub async fn next_delivery(stream: &mut DeliveryStream) -> (RequestId, Delivery) {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for a delivery")
        .expect("delivery stream closed")
}

/// Reads deliveries until the first terminal one, which is included.
pub async fn collect_until_terminal(stream: &mut DeliveryStream) -> Vec<Delivery> {
    let mut deliveries = Vec::new();
    loop {
        let (_, delivery) = next_delivery(stream).await;
        let terminal = delivery.is_terminal();
        deliveries.push(delivery);
        if terminal {
            return deliveries;
        }
    }
}

/// Asserts that nothing arrives on `stream` for `window`.
pub async fn assert_quiet(stream: &mut DeliveryStream, window: Duration) {
    if let Ok(Some((id, delivery))) = tokio::time::timeout(window, stream.next()).await {
        panic!("unexpected delivery for {}: {:?}", id, delivery);
    }
}

pub async fn wait_until_evicted(manager: &ConnectorManager, request_id: &RequestId) {
    for _ in 0..200 {
        if manager.state(request_id).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request {} was never evicted", request_id);
}

pub async fn wait_for_state(
    manager: &ConnectorManager,
    request_id: &RequestId,
    expected: igloo_dispatch::WorkItemState,
) {
    for _ in 0..200 {
        if manager.state(request_id).await == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request {} never reached {:?}", request_id, expected);
}
