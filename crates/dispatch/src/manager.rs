use crate::config::{AdmissionPolicy, Settings};
use crate::error::DispatchError;
use crate::receiver::ResultsReceiver;
use crate::request::AtomicRequest;
use crate::scheduler::Scheduler;
use crate::work_item::{CancelReason, ConnectorWorkItem, WorkItemState};
use futures::FutureExt;
use igloo_common::RequestId;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State shared between the manager handle, its background tasks and the
/// work items it runs.
pub(crate) struct Shared {
    settings: Settings,
    registry: Mutex<HashMap<RequestId, Arc<ConnectorWorkItem>>>,
    live: watch::Sender<usize>,
    pool: Arc<Semaphore>,
    scheduler: Scheduler,
    next_execution: AtomicU64,
    accepting: AtomicBool,
    shutdown: CancellationToken,
}

impl Shared {
    async fn lookup(&self, request_id: &RequestId) -> Option<Arc<ConnectorWorkItem>> {
        self.registry.lock().await.get(request_id).cloned()
    }

    async fn snapshot(&self) -> Vec<Arc<ConnectorWorkItem>> {
        self.registry.lock().await.values().cloned().collect()
    }

    /// Arms the retry timer for a work item waiting on its source.
    pub(crate) fn schedule_task(&self, request_id: &RequestId, delay: Duration) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        debug!(request_id = %request_id, delay_ms = delay.as_millis() as u64, "retry scheduled");
        self.scheduler.schedule(request_id.clone(), delay)
    }

    async fn fire_retry(self: &Arc<Self>, request_id: &RequestId) {
        let Some(item) = self.lookup(request_id).await else {
            debug!(request_id = %request_id, "retry fired for an evicted request");
            return;
        };
        if item.transition(WorkItemState::WaitingRetry, WorkItemState::Executing) {
            self.enqueue(item, None);
        } else {
            debug!(request_id = %request_id, state = ?item.state(), "stale retry ignored");
        }
    }

    /// Puts a paused work item back on the pool. Returns whether it was paused.
    pub(crate) async fn reenqueue_request(self: &Arc<Self>, request_id: &RequestId) -> bool {
        let Some(item) = self.lookup(request_id).await else {
            return false;
        };
        if !item.transition(WorkItemState::MoreAvailable, WorkItemState::Executing) {
            return false;
        }
        self.enqueue(item, None);
        true
    }

    /// Runs one slice of a work item on a pool task. Items without a permit
    /// wait for one, unless they are cancelled first.
    fn enqueue(self: &Arc<Self>, item: Arc<ConnectorWorkItem>, permit: Option<OwnedSemaphorePermit>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = match permit {
                Some(permit) => Some(permit),
                None => tokio::select! {
                    permit = Arc::clone(&shared.pool).acquire_owned() => permit.ok(),
                    _ = item.cancelled() => None,
                },
            };

            let outcome = AssertUnwindSafe(item.run(&shared)).catch_unwind().await;
            if let Err(panic) = outcome {
                let message = panic_message(panic.as_ref());
                error!(request_id = %item.id(), panic = %message, "work item panicked");
                let source = igloo_common::Error::execution(format!("worker panicked: {message}"));
                item.abort(DispatchError::Execution { request_id: item.id().clone(), source }, &shared)
                    .await;
            }
        });
    }

    /// Stops admission and cancels every live item with `reason`.
    async fn cancel_all(self: &Arc<Self>, reason: CancelReason) -> usize {
        let items = {
            let registry = self.registry.lock().await;
            self.accepting.store(false, Ordering::SeqCst);
            registry.values().cloned().collect::<Vec<_>>()
        };
        for item in &items {
            item.cancel(reason, self).await;
        }
        items.len()
    }

    /// Drops a terminal work item from the registry and disarms its timer.
    pub(crate) async fn evict(&self, request_id: &RequestId) {
        self.scheduler.cancel(request_id);
        let mut registry = self.registry.lock().await;
        if registry.remove(request_id).is_some() {
            self.live.send_replace(registry.len());
            debug!(request_id = %request_id, live = registry.len(), "request evicted");
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn pump_retries(shared: Weak<Shared>, mut fired: mpsc::UnboundedReceiver<RequestId>) {
    while let Some(request_id) = fired.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.fire_retry(&request_id).await;
    }
}

async fn reap_idle(shared: Weak<Shared>, idle_timeout: Duration, every: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        for item in shared.snapshot().await {
            if item.state().is_idle() && !item.is_cancelling() && item.idle_for() >= idle_timeout {
                info!(request_id = %item.id(), idle_secs = item.idle_for().as_secs(), "cancelling idle request");
                item.cancel(CancelReason::IdleTimeout, &shared).await;
            }
        }
    }
    debug!("idle reaper stopped");
}

/// Dispatches atomic requests to their connectors on a bounded worker pool.
///
/// Dropping the manager without calling [`shutdown`](Self::shutdown) fails
/// every live request with `ShuttingDown` in the background, without waiting
/// for them to drain.
pub struct ConnectorManager {
    shared: Arc<Shared>,
}

impl ConnectorManager {
    /// Must be called from within a tokio runtime.
    pub fn new(settings: Settings) -> Result<Self, DispatchError> {
        settings.validate()?;

        let shutdown = CancellationToken::new();
        let (scheduler, fired) = Scheduler::spawn(shutdown.clone());
        let (live, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            pool: Arc::new(Semaphore::new(settings.max_concurrent_requests)),
            settings,
            registry: Mutex::new(HashMap::new()),
            live,
            scheduler,
            next_execution: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(pump_retries(Arc::downgrade(&shared), fired));
        if let Some(idle_timeout) = shared.settings.request_idle_timeout() {
            tokio::spawn(reap_idle(
                Arc::downgrade(&shared),
                idle_timeout,
                shared.settings.idle_check_interval(),
                shutdown,
            ));
        }

        info!(
            max_concurrent_requests = shared.settings.max_concurrent_requests,
            admission = ?shared.settings.admission_policy,
            flow_control = ?shared.settings.flow_control,
            not_ready = ?shared.settings.not_ready_policy,
            "connector manager started"
        );
        Ok(Self { shared })
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Registers `request` and starts it on the pool. Results for the returned
    /// id are pushed to `receiver`.
    pub async fn execute_request(
        &self,
        request: AtomicRequest,
        receiver: Arc<dyn ResultsReceiver>,
    ) -> Result<RequestId, DispatchError> {
        let shared = &self.shared;
        if !shared.accepting.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }
        request.validate()?;

        let permit = match shared.settings.admission_policy {
            AdmissionPolicy::Reject => match Arc::clone(&shared.pool).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(query_id = %request.query_id, "request rejected, pool is full");
                    return Err(DispatchError::Overloaded {
                        limit: shared.settings.max_concurrent_requests,
                    });
                }
            },
            AdmissionPolicy::Queue => None,
        };

        let execution = shared.next_execution.fetch_add(1, Ordering::Relaxed);
        let request_id = RequestId::new(request.query_id.clone(), request.node_id, execution);
        let item = Arc::new(ConnectorWorkItem::new(request_id.clone(), request, receiver, &shared.settings)?);

        {
            let mut registry = shared.registry.lock().await;
            // Shutdown flips `accepting` under this lock before it snapshots.
            if !shared.accepting.load(Ordering::SeqCst) {
                return Err(DispatchError::ShuttingDown);
            }
            registry.insert(request_id.clone(), Arc::clone(&item));
            shared.live.send_replace(registry.len());
        }

        info!(request_id = %request_id, "request accepted");
        shared.enqueue(item, permit);
        Ok(request_id)
    }

    /// Asks a paused request for its next batch. Returns `false` if the
    /// request is unknown or not paused.
    pub async fn more_requested(&self, request_id: &RequestId) -> bool {
        match self.shared.lookup(request_id).await {
            Some(item) => item.more_requested(&self.shared).await,
            None => false,
        }
    }

    /// Returns `false` if the request is unknown or already evicted.
    pub async fn cancel_request(&self, request_id: &RequestId) -> bool {
        let Some(item) = self.shared.lookup(request_id).await else {
            debug!(request_id = %request_id, "cancel for unknown request");
            return false;
        };
        info!(request_id = %request_id, "cancel requested");
        item.cancel(CancelReason::Requested, &self.shared).await;
        true
    }

    pub async fn close_request(&self, request_id: &RequestId) {
        if let Some(item) = self.shared.lookup(request_id).await {
            item.close(&self.shared).await;
        }
    }

    /// Stops admission and fails every live request with `ShuttingDown`, then
    /// waits up to the configured grace period for them to drain.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let cancelled = shared.cancel_all(CancelReason::Shutdown).await;
        info!(live = cancelled, "connector manager shutting down");

        let mut live = shared.live.subscribe();
        let grace = shared.settings.shutdown_grace();
        let drained = tokio::time::timeout(grace, live.wait_for(|count| *count == 0))
            .await
            .is_ok();
        if !drained {
            let leftovers = self.live_requests().await;
            error!(leftovers = leftovers.len(), "requests still live after shutdown grace period");
        }
        shared.shutdown.cancel();
    }

    pub async fn live_requests(&self) -> Vec<RequestId> {
        self.shared.registry.lock().await.keys().cloned().collect()
    }

    /// `None` once the request has been evicted.
    pub async fn state(&self, request_id: &RequestId) -> Option<WorkItemState> {
        self.shared.lookup(request_id).await.map(|item| item.state())
    }
}

impl Drop for ConnectorManager {
    fn drop(&mut self) {
        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let cancelled = shared.cancel_all(CancelReason::Shutdown).await;
                    if cancelled > 0 {
                        info!(live = cancelled, "connector manager dropped, live requests cancelled");
                    }
                    shared.shutdown.cancel();
                });
            }
            Err(_) => {
                warn!("connector manager dropped outside a runtime, live requests are abandoned");
                shared.accepting.store(false, Ordering::SeqCst);
                shared.shutdown.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_messages_are_extracted() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let other: Box<dyn Any + Send> = Box::new(7_u32);

        assert_eq!(panic_message(literal.as_ref()), "boom");
        assert_eq!(panic_message(owned.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }

    #[tokio::test]
    async fn test_rejects_invalid_settings() {
        let settings = Settings { max_concurrent_requests: 0, ..Settings::default() };
        assert!(matches!(ConnectorManager::new(settings), Err(DispatchError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_unknown_requests_are_no_ops() {
        let manager = ConnectorManager::new(Settings::default()).unwrap();
        let id = RequestId::new("missing", 0, 99);

        assert!(!manager.cancel_request(&id).await);
        assert!(!manager.more_requested(&id).await);
        manager.close_request(&id).await;
        assert_eq!(manager.state(&id).await, None);
        assert!(manager.live_requests().await.is_empty());
    }
}
