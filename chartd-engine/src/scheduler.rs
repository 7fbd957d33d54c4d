//! Delayed sends.
//!
//! A send with a non-zero delay is reported `ToSchedule` by the router. The
//! session hands it to its scheduler, which sleeps and then dispatches it
//! again with the delay cleared. Pending sends can be cancelled by send id
//! and are all aborted when the scheduler is disposed.

use crate::io::{ExternalCommunication, OutgoingEvent};
use crate::queue::EventQueue;
use chartd_core::{Event, EventName, SendId, SessionId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

struct Pending {
    send_id: Option<SendId>,
    cancel: CancellationToken,
}

pub struct DelayScheduler {
    session_id: SessionId,
    pending: Arc<DashMap<u64, Pending>>,
    next: AtomicU64,
    token: CancellationToken,
    tasks: TaskTracker,
}

impl DelayScheduler {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            pending: Arc::new(DashMap::new()),
            next: AtomicU64::new(0),
            token: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Dispatches `event` through `comm` once its delay has elapsed. Delivery
    /// failures are reported to `queue` as `error.communication`.
    pub fn schedule(
        &self,
        mut event: OutgoingEvent,
        comm: Arc<dyn ExternalCommunication>,
        queue: EventQueue,
    ) {
        if self.token.is_cancelled() {
            tracing::debug!(session_id = %self.session_id, "scheduler disposed, dropping delayed send");
            return;
        }

        let delay = std::mem::replace(&mut event.delay, Duration::ZERO);
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        let cancel = self.token.child_token();
        self.pending.insert(
            seq,
            Pending {
                send_id: event.send_id.clone(),
                cancel: cancel.clone(),
            },
        );

        let pending = self.pending.clone();
        let session_id = self.session_id.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(session_id = %session_id, event = %event.name, "delayed send cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    pending.remove(&seq);
                    if let Err(e) = comm.send_event(event.clone()).await {
                        tracing::warn!(
                            session_id = %session_id,
                            event = %event.name,
                            "delayed send failed: {}",
                            e
                        );
                        let mut error = Event::platform(EventName::error_communication())
                            .with_data(e.to_value());
                        error.send_id = event.send_id.clone();
                        if queue.send(error).is_err() {
                            tracing::debug!(session_id = %session_id, "queue closed, error event dropped");
                        }
                    }
                }
            }
        });
    }

    /// Cancels every pending send with `send_id`. Returns whether any was
    /// still pending.
    pub fn cancel(&self, send_id: &SendId) -> bool {
        let matching: Vec<u64> = self
            .pending
            .iter()
            .filter(|p| p.send_id.as_ref() == Some(send_id))
            .map(|p| *p.key())
            .collect();
        let mut found = false;
        for seq in matching {
            if let Some((_, p)) = self.pending.remove(&seq) {
                p.cancel.cancel();
                found = true;
            }
        }
        found
    }

    /// Number of sends waiting for their delay.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Aborts all pending sends. Later `schedule` calls are ignored.
    pub fn dispose(&self) {
        self.token.cancel();
        self.pending.clear();
        self.tasks.close();
    }

    /// Waits for the scheduler's tasks after [`dispose`](Self::dispose).
    pub async fn wait(&self) {
        self.tasks.wait().await;
    }
}

impl Drop for DelayScheduler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
