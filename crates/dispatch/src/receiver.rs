//! Result delivery from work items to the engine.

use crate::batch::ResultBatch;
use crate::error::DispatchError;
use futures::Stream;
use igloo_common::RequestId;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Sink for the results of atomic requests.
///
/// Work items call these methods from pool tasks, never from the caller's
/// task, so implementations must be safe to invoke from any thread and should
/// return promptly. For each request a receiver sees zero or more batches
/// followed by exactly one terminal call: `deliver_done`, `deliver_cancelled`
/// or `deliver_error`.
pub trait ResultsReceiver: Send + Sync {
    fn deliver_batch(&self, request_id: &RequestId, batch: ResultBatch);

    fn deliver_error(&self, request_id: &RequestId, error: DispatchError);

    fn deliver_done(&self, request_id: &RequestId);

    fn deliver_cancelled(&self, request_id: &RequestId) {
        self.deliver_done(request_id)
    }
}

#[derive(Debug)]
pub enum Delivery {
    Batch(ResultBatch),
    Error(DispatchError),
    Done,
    Cancelled,
}

impl Delivery {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Delivery::Batch(_))
    }
}

/// A [`ResultsReceiver`] that forwards every delivery into a channel.
///
/// One receiver may serve any number of requests; each delivery carries the
/// id of the request it belongs to.
#[derive(Debug, Clone)]
pub struct ChannelReceiver {
    tx: mpsc::UnboundedSender<(RequestId, Delivery)>,
}

impl ChannelReceiver {
    pub fn new() -> (Arc<Self>, DeliveryStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), DeliveryStream { inner: UnboundedReceiverStream::new(rx) })
    }

    fn send(&self, request_id: &RequestId, delivery: Delivery) {
        // A dropped stream means the engine stopped listening; the request still
        // runs to its terminal state so resources are released.
        let _ = self.tx.send((request_id.clone(), delivery));
    }
}

impl ResultsReceiver for ChannelReceiver {
    fn deliver_batch(&self, request_id: &RequestId, batch: ResultBatch) {
        self.send(request_id, Delivery::Batch(batch));
    }

    fn deliver_error(&self, request_id: &RequestId, error: DispatchError) {
        self.send(request_id, Delivery::Error(error));
    }

    fn deliver_done(&self, request_id: &RequestId) {
        self.send(request_id, Delivery::Done);
    }

    fn deliver_cancelled(&self, request_id: &RequestId) {
        self.send(request_id, Delivery::Cancelled);
    }
}

/// Consumer side of a [`ChannelReceiver`].
#[derive(Debug)]
pub struct DeliveryStream {
    inner: UnboundedReceiverStream<(RequestId, Delivery)>,
}

impl Stream for DeliveryStream {
    type Item = (RequestId, Delivery);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
