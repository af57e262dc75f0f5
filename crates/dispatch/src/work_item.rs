//! The lifecycle of one atomic request.
//!
//! A [`ConnectorWorkItem`] is driven in steps by pool tasks. The step lock
//! (`progress`) makes every step, and every delivery to the receiver, single
//! writer. The `state` lock is only held for instants so that the manager can
//! observe and claim idle items without waiting for a running step.
//!
//! Whoever moves the item into a terminal state owns the terminal delivery:
//! it closes the execution, tells the receiver and evicts the item, in that
//! order, while holding the step lock.

use crate::batch::ResultBatch;
use crate::config::{FlowControl, NotReadyPolicy, Settings};
use crate::error::DispatchError;
use crate::manager::{panic_message, Shared};
use crate::receiver::ResultsReceiver;
use crate::request::{AtomicRequest, RequestCommand};
use igloo_common::RequestId;
use igloo_connector::{
    Command, Connector, Execution, ExecutionContext, NativeQuery, NextBatch, Translator,
};
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemState {
    New,
    Translating,
    Executing,
    /// Paused after a batch until the consumer asks for more or closes.
    MoreAvailable,
    /// Waiting for the source to become ready.
    WaitingRetry,
    Complete,
    Error,
    Cancelled,
}

impl WorkItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkItemState::Complete | WorkItemState::Error | WorkItemState::Cancelled)
    }

    /// Idle items hold no worker and can be finished directly by the manager.
    pub fn is_idle(self) -> bool {
        matches!(self, WorkItemState::MoreAvailable | WorkItemState::WaitingRetry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelReason {
    Requested,
    IdleTimeout,
    Shutdown,
}

#[derive(Debug)]
enum Outcome {
    Complete,
    Cancelled,
    Failed(DispatchError),
}

impl Outcome {
    fn state(&self) -> WorkItemState {
        match self {
            Outcome::Complete => WorkItemState::Complete,
            Outcome::Cancelled => WorkItemState::Cancelled,
            Outcome::Failed(_) => WorkItemState::Error,
        }
    }
}

enum Step {
    Continue,
    Suspend,
    Finish(Outcome),
}

/// Mutable request state, only touched under the step lock.
struct Progress {
    command: Option<Command>,
    query: Option<NativeQuery>,
    batches: u64,
}

pub struct ConnectorWorkItem {
    id: RequestId,
    context: ExecutionContext,
    translator: Option<Arc<dyn Translator>>,
    connector: Box<dyn Connector>,
    receiver: Arc<dyn ResultsReceiver>,
    flow_control: FlowControl,
    not_ready_policy: NotReadyPolicy,
    default_retry_delay: Duration,
    state: Mutex<WorkItemState>,
    execution: Mutex<Option<Arc<dyn Execution>>>,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<CancelReason>>,
    last_activity: Mutex<Instant>,
    progress: tokio::sync::Mutex<Progress>,
}

impl ConnectorWorkItem {
    pub(crate) fn new(
        id: RequestId,
        request: AtomicRequest,
        receiver: Arc<dyn ResultsReceiver>,
        settings: &Settings,
    ) -> Result<Self, DispatchError> {
        let AtomicRequest { command, context, translator, connector, .. } = request;
        let connector = connector.ok_or_else(|| {
            DispatchError::InvalidRequest(format!("request {} has no target connector", id))
        })?;
        let progress = match command {
            RequestCommand::Untranslated(command) => {
                Progress { command: Some(command), query: None, batches: 0 }
            }
            RequestCommand::Translated(query) => {
                Progress { command: None, query: Some(query), batches: 0 }
            }
        };

        Ok(Self {
            id,
            context,
            translator,
            connector,
            receiver,
            flow_control: settings.flow_control,
            not_ready_policy: settings.not_ready_policy,
            default_retry_delay: settings.default_retry_delay(),
            state: Mutex::new(WorkItemState::New),
            execution: Mutex::new(None),
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            progress: tokio::sync::Mutex::new(progress),
        })
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn state(&self) -> WorkItemState {
        *self.state.lock()
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub(crate) fn is_cancelling(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Moves the item from `from` to `to`; fails if it is in any other state.
    pub(crate) fn transition(&self, from: WorkItemState, to: WorkItemState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        debug!(request_id = %self.id, from = ?from, to = ?to, "work item transition");
        *state = to;
        true
    }

    fn claim_terminal(&self, outcome: &Outcome) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = outcome.state();
        true
    }

    fn claim_idle_terminal(&self, outcome: &Outcome) -> bool {
        let mut state = self.state.lock();
        if !state.is_idle() {
            return false;
        }
        *state = outcome.state();
        true
    }

    fn cancel_outcome(&self) -> Outcome {
        match *self.cancel_reason.lock() {
            Some(CancelReason::Shutdown) => Outcome::Failed(DispatchError::ShuttingDown),
            _ => Outcome::Cancelled,
        }
    }

    /// Runs steps until the item suspends or reaches a terminal state.
    pub(crate) async fn run(&self, shared: &Arc<Shared>) {
        let mut progress = self.progress.lock().await;
        loop {
            if self.state().is_terminal() {
                return;
            }
            if self.cancel.is_cancelled() {
                let outcome = self.cancel_outcome();
                self.finish(outcome, shared).await;
                return;
            }
            self.touch();

            let step = match self.state() {
                WorkItemState::New => self.begin(&progress),
                WorkItemState::Translating => self.translate(&mut progress),
                WorkItemState::Executing => self.execute(&mut progress, shared).await,
                // Parked or claimed by the manager since this run was queued.
                _ => Step::Suspend,
            };
            match step {
                Step::Continue => continue,
                Step::Suspend => return,
                Step::Finish(outcome) => {
                    self.finish(outcome, shared).await;
                    return;
                }
            }
        }
    }

    fn begin(&self, progress: &Progress) -> Step {
        let next = if progress.command.is_some() {
            WorkItemState::Translating
        } else {
            WorkItemState::Executing
        };
        self.transition(WorkItemState::New, next);
        Step::Continue
    }

    fn translate(&self, progress: &mut Progress) -> Step {
        let (Some(command), Some(translator)) = (progress.command.as_ref(), self.translator.as_ref())
        else {
            return Step::Finish(Outcome::Failed(DispatchError::InvalidRequest(format!(
                "request {} has no translator for its command",
                self.id
            ))));
        };

        match translator.translate(command, &self.context) {
            Ok(query) => {
                debug!(request_id = %self.id, statement = %query.statement, "command translated");
                progress.query = Some(query);
                progress.command = None;
                self.transition(WorkItemState::Translating, WorkItemState::Executing);
                Step::Continue
            }
            Err(source) => Step::Finish(Outcome::Failed(DispatchError::Translation {
                request_id: self.id.clone(),
                source,
            })),
        }
    }

    async fn open(&self, progress: &Progress) -> igloo_common::Result<Arc<dyn Execution>> {
        let existing = self.execution.lock().clone();
        if let Some(execution) = existing {
            return Ok(execution);
        }
        let query = progress.query.as_ref().ok_or_else(|| {
            igloo_common::Error::execution("request reached execution without a native query")
        })?;
        let execution = self.connector.execute(query, &self.context).await?;
        *self.execution.lock() = Some(Arc::clone(&execution));
        debug!(request_id = %self.id, "connector execution opened");
        Ok(execution)
    }

    fn execution_failed(&self, source: igloo_common::Error) -> Step {
        // Failures caused by our own cancel are reported as the cancellation.
        if self.cancel.is_cancelled() {
            return Step::Continue;
        }
        Step::Finish(Outcome::Failed(DispatchError::Execution { request_id: self.id.clone(), source }))
    }

    async fn execute(&self, progress: &mut Progress, shared: &Arc<Shared>) -> Step {
        let execution = match self.open(progress).await {
            Ok(execution) => execution,
            Err(source) => return self.execution_failed(source),
        };
        if self.cancel.is_cancelled() {
            return Step::Continue;
        }

        let next = execution.next().await;
        self.touch();
        let next = match next {
            Ok(next) => next,
            Err(source) => return self.execution_failed(source),
        };

        match next {
            NextBatch::Batch(native) => {
                let batch = ResultBatch::from_native(progress.batches, native);
                progress.batches += 1;
                if batch.is_last {
                    self.receiver.deliver_batch(&self.id, batch);
                    return Step::Finish(Outcome::Complete);
                }
                match self.flow_control {
                    FlowControl::FreeRunning => {
                        self.receiver.deliver_batch(&self.id, batch);
                        Step::Continue
                    }
                    FlowControl::Paused => {
                        // Pause before delivering so a consumer reacting to the
                        // batch finds the item resumable.
                        self.transition(WorkItemState::Executing, WorkItemState::MoreAvailable);
                        self.receiver.deliver_batch(&self.id, batch);
                        self.settle(WorkItemState::MoreAvailable)
                    }
                }
            }
            NextBatch::Done => Step::Finish(Outcome::Complete),
            NextBatch::NotReady(suggested) => {
                let delay = suggested.unwrap_or(self.default_retry_delay);
                self.wait_for_source(delay, shared).await
            }
        }
    }

    async fn wait_for_source(&self, delay: Duration, shared: &Arc<Shared>) -> Step {
        if !self.transition(WorkItemState::Executing, WorkItemState::WaitingRetry) {
            return Step::Continue;
        }
        match self.not_ready_policy {
            NotReadyPolicy::BlockingWait => {
                debug!(request_id = %self.id, delay_ms = delay.as_millis() as u64, "source not ready, waiting");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.transition(WorkItemState::WaitingRetry, WorkItemState::Executing);
                    }
                    _ = self.cancel.cancelled() => {}
                }
                Step::Continue
            }
            NotReadyPolicy::ScheduledRetry => {
                if let Step::Continue = self.settle(WorkItemState::WaitingRetry) {
                    return Step::Continue;
                }
                if shared.schedule_task(&self.id, delay) {
                    Step::Suspend
                } else {
                    Step::Finish(Outcome::Failed(DispatchError::ShuttingDown))
                }
            }
        }
    }

    /// Called right after parking in an idle state. A cancel that landed
    /// before the park missed its idle claim, so it is picked up here.
    fn settle(&self, parked: WorkItemState) -> Step {
        if self.cancel.is_cancelled() && self.transition(parked, WorkItemState::Executing) {
            return Step::Continue;
        }
        Step::Suspend
    }

    /// Claims the terminal state for `outcome` and delivers it, unless the
    /// manager already finished the item.
    async fn finish(&self, outcome: Outcome, shared: &Arc<Shared>) {
        if self.claim_terminal(&outcome) {
            self.conclude(outcome, shared).await;
        }
    }

    /// Caller must hold the step lock and have claimed the terminal state.
    async fn conclude(&self, outcome: Outcome, shared: &Arc<Shared>) {
        let execution = self.execution.lock().take();
        if let Some(execution) = execution {
            match AssertUnwindSafe(execution.close()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(request_id = %self.id, error = %e, "failed to close connector execution");
                }
                Err(panic) => {
                    error!(
                        request_id = %self.id,
                        panic = %panic_message(panic.as_ref()),
                        "connector panicked while closing execution"
                    );
                }
            }
        }

        match outcome {
            Outcome::Complete => {
                info!(request_id = %self.id, "request complete");
                self.receiver.deliver_done(&self.id);
            }
            Outcome::Cancelled => {
                info!(request_id = %self.id, "request cancelled");
                self.receiver.deliver_cancelled(&self.id);
            }
            Outcome::Failed(error) => {
                warn!(request_id = %self.id, error = %error, "request failed");
                self.receiver.deliver_error(&self.id, error);
            }
        }
        shared.evict(&self.id).await;
    }

    /// Fails the item from outside a step, e.g. after a step panicked.
    pub(crate) async fn abort(&self, error: DispatchError, shared: &Arc<Shared>) {
        let _progress = self.progress.lock().await;
        self.finish(Outcome::Failed(error), shared).await;
    }

    /// Cancels the item. Idle items finish immediately; running items stop at
    /// their next safe point and their execution is asked to cancel natively.
    pub(crate) async fn cancel(&self, reason: CancelReason, shared: &Arc<Shared>) {
        {
            let mut current = self.cancel_reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.cancel.cancel();

        let outcome = self.cancel_outcome();
        if self.claim_idle_terminal(&outcome) {
            let _progress = self.progress.lock().await;
            self.conclude(outcome, shared).await;
            return;
        }

        let execution = self.execution.lock().clone();
        if let Some(execution) = execution {
            debug!(request_id = %self.id, reason = ?reason, "forwarding cancel to connector");
            if let Err(e) = execution.cancel().await {
                warn!(request_id = %self.id, error = %e, "native cancel failed");
            }
        }
    }

    /// Ends a request the consumer is done with. A paused request completes;
    /// anything still in flight is cancelled.
    pub(crate) async fn close(&self, shared: &Arc<Shared>) {
        if self.transition(WorkItemState::MoreAvailable, WorkItemState::Complete) {
            let _progress = self.progress.lock().await;
            self.conclude(Outcome::Complete, shared).await;
        } else if !self.state().is_terminal() {
            self.cancel(CancelReason::Requested, shared).await;
        }
    }

    /// The consumer wants more rows: hand the item back to the manager.
    pub(crate) async fn more_requested(&self, shared: &Arc<Shared>) -> bool {
        self.touch();
        shared.reenqueue_request(&self.id).await
    }
}
