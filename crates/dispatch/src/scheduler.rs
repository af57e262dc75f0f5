//! Delayed re-enqueue of work items.
//!
//! The scheduler owns a [`DelayQueue`] on its own task. It never touches a
//! work item: when a timer fires it only emits the request id, and the
//! manager decides whether to put the item back on the pool.

use futures::StreamExt;
use igloo_common::RequestId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::debug;

enum TimerCommand {
    Schedule { request_id: RequestId, delay: Duration },
    Cancel { request_id: RequestId },
}

/// Handle to the timer task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Scheduler {
    commands: mpsc::UnboundedSender<TimerCommand>,
}

impl std::fmt::Debug for TimerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerCommand::Schedule { request_id, delay } => {
                write!(f, "Schedule({}, {:?})", request_id, delay)
            }
            TimerCommand::Cancel { request_id } => write!(f, "Cancel({})", request_id),
        }
    }
}

impl Scheduler {
    /// Spawns the timer task. Fired ids are sent on the returned channel; the
    /// task stops when `shutdown` is cancelled or every handle is dropped.
    pub fn spawn(shutdown: CancellationToken) -> (Self, mpsc::UnboundedReceiver<RequestId>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_timers(command_rx, fired_tx, shutdown));
        (Self { commands }, fired_rx)
    }

    /// Arms (or re-arms) the timer for `request_id`. Returns `false` once the
    /// timer task has stopped.
    pub fn schedule(&self, request_id: RequestId, delay: Duration) -> bool {
        self.commands.send(TimerCommand::Schedule { request_id, delay }).is_ok()
    }

    pub fn cancel(&self, request_id: &RequestId) {
        let _ = self.commands.send(TimerCommand::Cancel { request_id: request_id.clone() });
    }
}

async fn run_timers(
    mut commands: mpsc::UnboundedReceiver<TimerCommand>,
    fired: mpsc::UnboundedSender<RequestId>,
    shutdown: CancellationToken,
) {
    let mut queue: DelayQueue<RequestId> = DelayQueue::new();
    let mut keys: HashMap<RequestId, delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(TimerCommand::Schedule { request_id, delay }) => {
                    if let Some(key) = keys.remove(&request_id) {
                        queue.remove(&key);
                    }
                    let key = queue.insert(request_id.clone(), delay);
                    keys.insert(request_id, key);
                }
                Some(TimerCommand::Cancel { request_id }) => {
                    if let Some(key) = keys.remove(&request_id) {
                        queue.remove(&key);
                        debug!(request_id = %request_id, "retry timer disarmed");
                    }
                }
                None => break,
            },
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let request_id = expired.into_inner();
                keys.remove(&request_id);
                if fired.send(request_id).is_err() {
                    break;
                }
            }
        }
    }
    debug!(pending = keys.len(), "retry scheduler stopped");
}
