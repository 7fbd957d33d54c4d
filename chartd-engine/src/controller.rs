//! Session controller.
//!
//! A [`StateMachineController`] owns everything that outlives a single
//! interpreter run: the inbound queue, the delay scheduler, the session's
//! storage and the stop/suspend/destroy tokens. It runs the interpreter on a
//! task and publishes the session status and final outcome through `watch`
//! channels, so any number of callers can wait for either.

use crate::error::EngineError;
use crate::interpreter::{Interpreter, RunContext};
use crate::io::{DetachedCommunication, ExternalCommunication};
use crate::options::InterpreterOptions;
use crate::queue::EventQueue;
use crate::scheduler::DelayScheduler;
use crate::service::Service;
use async_trait::async_trait;
use chartd_core::{Chart, Event, SendId, SessionId, Value};
use chartd_storage::Storage;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Created,
    Running,
    /// Stopped with its state kept in storage.
    Suspended,
    Completed,
    Destroyed,
    Faulted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Suspended => "suspended",
            SessionStatus::Completed => "completed",
            SessionStatus::Destroyed => "destroyed",
            SessionStatus::Faulted => "faulted",
        }
    }
}

type Outcome = Option<Result<Value, Arc<EngineError>>>;

pub struct StateMachineController {
    session_id: SessionId,
    chart: Arc<Chart>,
    options: InterpreterOptions,
    queue: EventQueue,
    scheduler: Arc<DelayScheduler>,
    comm: Arc<dyn ExternalCommunication>,
    status: Arc<watch::Sender<SessionStatus>>,
    outcome: watch::Sender<Outcome>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StateMachineController {
    pub fn new(session_id: SessionId, chart: Arc<Chart>, mut options: InterpreterOptions) -> Self {
        options.suspend_token = options.suspend_token.child_token();
        options.destroy_token = options.destroy_token.child_token();

        let queue = EventQueue::new();
        let comm = options.external_communication.clone().unwrap_or_else(|| {
            Arc::new(DetachedCommunication::new(session_id.clone(), queue.clone()))
                as Arc<dyn ExternalCommunication>
        });
        let (status, _) = watch::channel(SessionStatus::Created);
        let (outcome, _) = watch::channel(None);

        Self {
            scheduler: Arc::new(DelayScheduler::new(session_id.clone())),
            session_id,
            chart,
            options,
            queue,
            comm,
            status: Arc::new(status),
            outcome,
            task: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn chart(&self) -> &Arc<Chart> {
        &self.chart
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Starts the session and waits until it is running, or has failed to
    /// start.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        {
            let mut task = self.task.lock();
            if task.is_some() {
                return Err(EngineError::invalid_state(format!(
                    "session {} already started",
                    self.session_id
                )));
            }
            let this = self.clone();
            *task = Some(tokio::spawn(async move {
                let run = AssertUnwindSafe(this.clone().run_loop()).catch_unwind();
                if let Err(panic) = run.await {
                    this.abort_after_panic(panic);
                }
            }));
        }

        let mut status = self.status.subscribe();
        // The sender lives as long as `self`.
        let _ = status.wait_for(|s| *s != SessionStatus::Created).await;
        drop(status);

        match &*self.outcome.borrow() {
            Some(Err(e)) if self.status() != SessionStatus::Running => Err(e.duplicate()),
            _ => Ok(()),
        }
    }

    /// Queues an external event.
    pub fn send(&self, event: Event) -> Result<(), EngineError> {
        self.queue.send(event)
    }

    /// Closes the inbound queue. A session waiting for an external event
    /// then faults with `QueueClosed`.
    pub fn close_queue(&self) {
        self.queue.close();
    }

    /// Cancels a pending delayed send.
    pub fn cancel_event(&self, send_id: &SendId) -> bool {
        self.scheduler.cancel(send_id)
    }

    /// Asks the session to save its state and stop.
    pub fn suspend(&self) {
        self.options.suspend_token.cancel();
        self.finish_if_never_started(EngineError::Suspended);
    }

    /// Stops the session and discards its state.
    pub fn destroy(&self) {
        self.options.destroy_token.cancel();
        self.finish_if_never_started(EngineError::Cancelled);
    }

    /// Waits for the session's final outcome.
    pub async fn result(&self) -> Result<Value, EngineError> {
        let mut outcome = self.outcome.subscribe();
        let finished = outcome.wait_for(Option::is_some).await;
        match finished.as_deref() {
            Ok(Some(Ok(value))) => Ok(value.clone()),
            Ok(Some(Err(e))) => Err(e.duplicate()),
            _ => Err(EngineError::invalid_state("session outcome unavailable")),
        }
    }

    /// Waits for the session task to end.
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(session_id = %self.session_id, "session task failed: {}", e);
            }
        }
    }

    fn finish_if_never_started(&self, error: EngineError) {
        if self.task.lock().is_none() {
            self.finish(Err(error));
        }
    }

    async fn run_loop(self: Arc<Self>) {
        let storage = match self.open_storage() {
            Ok(storage) => storage,
            Err(e) => {
                self.finish(Err(e));
                return;
            }
        };

        let outcome = loop {
            let run = Interpreter::new(RunContext {
                session_id: self.session_id.clone(),
                chart: self.chart.clone(),
                options: self.options.clone(),
                queue: self.queue.clone(),
                comm: self.comm.clone(),
                scheduler: self.scheduler.clone(),
                storage: storage.clone(),
                status: self.status.clone(),
            });
            let result = match run {
                Ok(interpreter) => interpreter.run().await,
                Err(e) => Err(e),
            };
            match result {
                Err(EngineError::Suspended) if !self.options.suspend_token.is_cancelled() => {
                    self.status.send_replace(SessionStatus::Suspended);
                    if let Err(e) = self.wait_for_resume().await {
                        break Err(e);
                    }
                    tracing::debug!(session_id = %self.session_id, "resuming after idle suspend");
                }
                other => break other,
            }
        };

        self.scheduler.dispose();
        self.finish(outcome);
    }

    // The run loop never returned, so nothing else will publish an outcome.
    fn abort_after_panic(&self, panic: Box<dyn Any + Send>) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        self.scheduler.dispose();
        self.finish(Err(EngineError::Faulted {
            code: "SESSION_PANICKED",
            reason,
        }));
    }

    // A self-suspended session wakes up when an event arrives. Events queued
    // before a suspend request wake it too, so the interpreter saves them.
    async fn wait_for_resume(&self) -> Result<(), EngineError> {
        tokio::select! {
            biased;
            _ = self.options.destroy_token.cancelled() => Err(EngineError::Cancelled),
            _ = self.options.stop_token.cancelled() => Err(EngineError::Halted),
            _ = self.options.suspend_token.cancelled() => {
                if self.queue.is_empty() { Err(EngineError::Suspended) } else { Ok(()) }
            }
            readable = self.queue.wait_readable() => {
                if readable { Ok(()) } else { Err(EngineError::QueueClosed) }
            }
        }
    }

    fn open_storage(&self) -> Result<Option<Arc<dyn Storage>>, EngineError> {
        if !self.options.is_persistent() {
            return Ok(None);
        }
        let storage = self
            .options
            .storage_provider
            .open(self.chart.checksum(), self.session_id.as_str())?;
        Ok(Some(storage))
    }

    fn remove_storage(&self) {
        if !self.options.is_persistent() {
            return;
        }
        if let Err(e) = self
            .options
            .storage_provider
            .remove(self.chart.checksum(), self.session_id.as_str())
        {
            tracing::warn!(session_id = %self.session_id, "failed to remove session storage: {}", e);
        }
    }

    fn finish(&self, outcome: Result<Value, EngineError>) {
        if self.is_finished() {
            return;
        }
        self.queue.close();

        let status = match &outcome {
            Ok(_) => SessionStatus::Completed,
            Err(EngineError::Suspended | EngineError::Halted) => SessionStatus::Suspended,
            Err(EngineError::Cancelled) => SessionStatus::Destroyed,
            Err(_) => SessionStatus::Faulted,
        };
        if !matches!(status, SessionStatus::Suspended) {
            self.remove_storage();
        }
        match &outcome {
            Ok(_) => tracing::info!(session_id = %self.session_id, "session completed"),
            Err(e) if e.is_cancellation() => {
                tracing::info!(session_id = %self.session_id, status = status.as_str(), "session stopped")
            }
            Err(e) => tracing::error!(
                session_id = %self.session_id,
                code = e.error_code(),
                "session faulted: {}",
                e
            ),
        }

        self.outcome.send_replace(Some(outcome.map_err(Arc::new)));
        self.status.send_replace(status);
    }
}

#[async_trait]
impl Service for StateMachineController {
    async fn send(&self, event: Event) -> Result<(), EngineError> {
        StateMachineController::send(self, event)
    }

    async fn destroy(&self) -> Result<(), EngineError> {
        StateMachineController::destroy(self);
        Ok(())
    }

    async fn result(&self) -> Result<Value, EngineError> {
        StateMachineController::result(self).await
    }

    fn session_id(&self) -> Option<&SessionId> {
        Some(&self.session_id)
    }
}

impl std::fmt::Debug for StateMachineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineController")
            .field("session_id", &self.session_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
