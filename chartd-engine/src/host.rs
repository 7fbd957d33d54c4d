//! Session host and event router.
//!
//! The [`Host`] keeps three registries:
//!
//! - running sessions by session id,
//! - invoked services by `(parent session, invoke id)`,
//! - the parent link of every session started by an invoke.
//!
//! Sessions reach the host through a [`SessionLink`], their
//! [`ExternalCommunication`]. Every send is routed here: `#_internal` and
//! delayed sends go back to the sender, `#_parent`, `#_scxml_<session>` and
//! `#_<invoke>` are resolved through the registries and delivered with the
//! origin stamped on the event.
//!
//! Invoke completion is raced against cancellation: whichever side removes
//! the service entry first owns it, so a parent sees at most one
//! `done.invoke`/`error.invoke` per invocation and every service is disposed
//! exactly once.

use crate::config::{Config, PersistenceLevel};
use crate::controller::StateMachineController;
use crate::error::EngineError;
use crate::io::{
    classify, invoke_target, ExternalCommunication, InvokeRequest, OutgoingEvent, SendStatus,
    Target, SCXML_ALIAS, SCXML_EVENT_PROCESSOR, SCXML_INVOKE_TYPE,
};
use crate::options::InterpreterOptions;
use crate::service::Service;
use async_trait::async_trait;
use chartd_core::{Chart, Event, EventName, InvokeId, InvokeUniqueId, SendId, SessionId, Value};
use chartd_storage::FileStorageProvider;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Where a session's chart comes from.
#[derive(Debug, Clone)]
pub enum ChartSource {
    Chart(Arc<Chart>),
    /// Loaded through the host's resource loader.
    Uri(String),
    /// Chart JSON.
    Text(String),
}

/// Starts services of the invoke types it accepts.
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    fn can_handle(&self, invoke_type: &str) -> bool;

    async fn start_service(
        &self,
        host: &Host,
        parent: &SessionId,
        request: &InvokeRequest,
    ) -> Result<Arc<dyn Service>, EngineError>;
}

/// Host-wide settings.
#[derive(Clone, Default)]
pub struct HostOptions {
    /// Template for every session the host creates.
    pub interpreter: InterpreterOptions,
    /// Maximum number of registered sessions (0 = unlimited).
    pub max_sessions: usize,
    /// Extra invoke types. Chart sessions are always available.
    pub service_factories: Vec<Arc<dyn ServiceFactory>>,
}

impl HostOptions {
    pub fn from_config(config: &Config) -> Result<Self, EngineError> {
        let mut interpreter = InterpreterOptions {
            configuration: config.host.configuration.clone(),
            suspend_idle: config.host.suspend_idle(),
            ..InterpreterOptions::default()
        };
        if config.storage.persistence != PersistenceLevel::None {
            let provider = FileStorageProvider::new(
                config.storage.sessions_dir(),
                config.storage.fsync_policy,
            )?;
            interpreter = interpreter.with_persistence(config.storage.persistence, Arc::new(provider));
        }
        Ok(Self {
            interpreter,
            max_sessions: config.host.max_sessions,
            service_factories: Vec::new(),
        })
    }
}

struct ServiceEntry {
    unique_id: InvokeUniqueId,
    slot: ServiceSlot,
}

enum ServiceSlot {
    Starting,
    Running(Arc<dyn Service>),
    /// Finished and no longer addressable. The key stays until the parent
    /// releases it, so a late cancel is not mistaken for a live service.
    Completed,
}

impl ServiceEntry {
    fn running(&self) -> Option<Arc<dyn Service>> {
        match &self.slot {
            ServiceSlot::Running(service) => Some(service.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct ParentLink {
    session_id: SessionId,
    invoke_id: InvokeId,
    unique_id: InvokeUniqueId,
}

type ServiceKey = (SessionId, InvokeId);

struct HostInner {
    options: HostOptions,
    factories: Vec<Arc<dyn ServiceFactory>>,
    state_machines: DashMap<SessionId, Arc<StateMachineController>>,
    services: DashMap<ServiceKey, ServiceEntry>,
    parents: DashMap<SessionId, ParentLink>,
    stop_token: CancellationToken,
    tasks: TaskTracker,
}

#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    pub fn new(options: HostOptions) -> Self {
        let mut factories = options.service_factories.clone();
        factories.push(Arc::new(ScxmlServiceFactory));
        Self {
            inner: Arc::new(HostInner {
                options,
                factories,
                state_machines: DashMap::new(),
                services: DashMap::new(),
                parents: DashMap::new(),
                stop_token: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    fn downgrade(&self) -> Weak<HostInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn session_count(&self) -> usize {
        self.inner.state_machines.len()
    }

    /// Registered invoke entries, completed ones included.
    pub fn service_count(&self) -> usize {
        self.inner.services.len()
    }

    /// Whether `invoke_id` is registered for `parent`, running or completed.
    pub fn has_service(&self, parent: &SessionId, invoke_id: &InvokeId) -> bool {
        self.inner
            .services
            .contains_key(&(parent.clone(), invoke_id.clone()))
    }

    pub fn get_state_machine(&self, session_id: &SessionId) -> Option<Arc<StateMachineController>> {
        self.inner
            .state_machines
            .get(session_id)
            .map(|c| c.value().clone())
    }

    // ---- sessions --------------------------------------------------------

    /// Creates and registers a session without starting it.
    pub async fn create_and_add_state_machine(
        &self,
        source: ChartSource,
        session_id: Option<SessionId>,
        arguments: Value,
    ) -> Result<Arc<StateMachineController>, EngineError> {
        let chart = self.load_chart(source).await?;
        let session_id = session_id.unwrap_or_else(SessionId::generate);

        let limit = self.inner.options.max_sessions;
        if limit > 0 && self.inner.state_machines.len() >= limit {
            return Err(EngineError::TooManySessions { limit });
        }

        let mut options = self.inner.options.interpreter.clone();
        options.arguments = arguments;
        options.external_communication = Some(Arc::new(SessionLink {
            host: self.downgrade(),
            session_id: session_id.clone(),
        }));
        options.stop_token = self.inner.stop_token.clone();
        options.suspend_token = CancellationToken::new();
        options.destroy_token = CancellationToken::new();

        match self.inner.state_machines.entry(session_id.clone()) {
            Entry::Occupied(_) => Err(EngineError::DuplicateSession {
                session_id: session_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                let controller = Arc::new(StateMachineController::new(session_id.clone(), chart, options));
                slot.insert(controller.clone());
                tracing::debug!(session_id = %session_id, "session created");
                Ok(controller)
            }
        }
    }

    async fn load_chart(&self, source: ChartSource) -> Result<Arc<Chart>, EngineError> {
        match source {
            ChartSource::Chart(chart) => Ok(chart),
            ChartSource::Text(text) => Ok(Arc::new(Chart::from_json_str(&text)?)),
            ChartSource::Uri(uri) => {
                let text = self.inner.options.interpreter.resource_loader.load(&uri).await?;
                Ok(Arc::new(Chart::from_json_str(&text)?))
            }
        }
    }

    /// Starts a registered session. It is unregistered once it finishes.
    pub async fn start_state_machine(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let controller = self.get_state_machine(session_id).ok_or_else(|| EngineError::UnknownSession {
            session_id: session_id.to_string(),
        })?;

        if let Err(e) = controller.start().await {
            self.unregister(&controller);
            return Err(e);
        }

        let host = self.downgrade();
        self.inner.tasks.spawn(async move {
            let outcome = controller.result().await;
            if let Err(e) = &outcome {
                tracing::debug!(session_id = %controller.session_id(), "session ended: {}", e);
            }
            if let Some(inner) = host.upgrade() {
                Host { inner }.unregister(&controller);
            }
        });
        Ok(())
    }

    fn unregister(&self, controller: &Arc<StateMachineController>) {
        let id = controller.session_id();
        let removed = self
            .inner
            .state_machines
            .remove_if(id, |_, c| Arc::ptr_eq(c, controller));
        if removed.is_some() {
            self.release_completed_services(id);
        }
    }

    // Completions the session never got to release.
    fn release_completed_services(&self, parent: &SessionId) {
        self.inner
            .services
            .retain(|(owner, _), entry| owner != parent || !matches!(entry.slot, ServiceSlot::Completed));
    }

    /// Destroys a session and forgets it.
    pub async fn destroy_state_machine(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let (_, controller) = self
            .inner
            .state_machines
            .remove(session_id)
            .ok_or_else(|| EngineError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        self.inner.parents.remove(session_id);
        controller.destroy();
        controller.join().await;
        self.release_completed_services(session_id);
        tracing::debug!(session_id = %session_id, "session destroyed");
        Ok(())
    }

    /// Creates a session, runs it to completion and returns its result.
    pub async fn execute_state_machine(
        &self,
        source: ChartSource,
        session_id: Option<SessionId>,
        arguments: Value,
    ) -> Result<Value, EngineError> {
        let controller = self
            .create_and_add_state_machine(source, session_id, arguments)
            .await?;
        let session_id = controller.session_id().clone();
        let result = match self.start_state_machine(&session_id).await {
            Ok(()) => controller.result().await,
            Err(e) => Err(e),
        };
        match self.destroy_state_machine(&session_id).await {
            Ok(()) | Err(EngineError::UnknownSession { .. }) => {}
            Err(e) => tracing::warn!(session_id = %session_id, "cleanup failed: {}", e),
        }
        result
    }

    /// Suspends every session and waits for all of them to stop.
    pub async fn stop_host(&self) {
        let controllers: Vec<Arc<StateMachineController>> = self
            .inner
            .state_machines
            .iter()
            .map(|c| c.value().clone())
            .collect();
        tracing::info!(sessions = controllers.len(), "stopping host");
        for controller in &controllers {
            controller.suspend();
        }
        for controller in &controllers {
            if let Err(e) = controller.result().await {
                if !e.is_cancellation() {
                    tracing::warn!(session_id = %controller.session_id(), "session failed while stopping: {}", e);
                }
            }
            self.unregister(controller);
        }
    }

    /// Halts all sessions and waits for the host's background tasks.
    pub async fn shutdown(&self) {
        self.inner.stop_token.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        tracing::info!("host shut down");
    }

    // ---- routing ---------------------------------------------------------

    /// Routes a send from `origin`.
    pub async fn dispatch_event(
        &self,
        origin: &SessionId,
        event: OutgoingEvent,
    ) -> Result<SendStatus, EngineError> {
        if let Some(status) = classify(&event)? {
            return Ok(status);
        }

        let mut delivered = event.to_event(origin);
        let target = match event.target.as_deref() {
            None => session_target_service(self, origin)?,
            Some(target) => {
                if Target::parse(target) == Target::Parent {
                    let link = self.parent_link(origin)?;
                    delivered = delivered.with_invoke(link.invoke_id, Some(link.unique_id));
                }
                self.get_service(origin, target)?
            }
        };
        target.send(delivered).await?;
        Ok(SendStatus::Sent)
    }

    /// Resolves a target address relative to `origin`.
    pub fn get_service(&self, origin: &SessionId, target: &str) -> Result<Arc<dyn Service>, EngineError> {
        match Target::parse(target) {
            Target::Parent => {
                let link = self.parent_link(origin)?;
                self.get_state_machine(&link.session_id)
                    .map(|c| c as Arc<dyn Service>)
                    .ok_or_else(|| EngineError::unknown_target(target))
            }
            Target::Session(id) => self
                .get_state_machine(&id)
                .map(|c| c as Arc<dyn Service>)
                .ok_or_else(|| EngineError::unknown_target(target)),
            Target::Invoke(invoke_id) => self
                .inner
                .services
                .get(&(origin.clone(), invoke_id))
                .and_then(|e| e.running())
                .ok_or_else(|| EngineError::unknown_target(target)),
            Target::Internal | Target::Other(_) => Err(EngineError::unknown_target(target)),
        }
    }

    fn parent_link(&self, session_id: &SessionId) -> Result<ParentLink, EngineError> {
        self.inner
            .parents
            .get(session_id)
            .map(|l| l.value().clone())
            .ok_or_else(|| EngineError::unknown_target(crate::io::PARENT_TARGET))
    }

    pub(crate) fn link_parent(&self, child: &SessionId, parent: &SessionId, request: &InvokeRequest) {
        self.inner.parents.insert(
            child.clone(),
            ParentLink {
                session_id: parent.clone(),
                invoke_id: request.invoke_id.clone(),
                unique_id: request.unique_id.clone(),
            },
        );
    }

    /// Cancels a delayed send of `session_id`.
    pub fn cancel_event(&self, session_id: &SessionId, send_id: &SendId) -> Result<bool, EngineError> {
        let controller = self.get_state_machine(session_id).ok_or_else(|| EngineError::UnknownSession {
            session_id: session_id.to_string(),
        })?;
        Ok(controller.cancel_event(send_id))
    }

    // ---- invokes ---------------------------------------------------------

    /// Registers a service slot. Fails if the invoke id is taken.
    pub fn add_service(
        &self,
        parent: &SessionId,
        invoke_id: &InvokeId,
        unique_id: &InvokeUniqueId,
    ) -> Result<(), EngineError> {
        match self.inner.services.entry((parent.clone(), invoke_id.clone())) {
            Entry::Occupied(_) => Err(EngineError::invalid_state(format!(
                "invoke '{}' is already active in session {}",
                invoke_id, parent
            ))),
            Entry::Vacant(slot) => {
                slot.insert(ServiceEntry {
                    unique_id: unique_id.clone(),
                    slot: ServiceSlot::Starting,
                });
                Ok(())
            }
        }
    }

    /// Deletes a service entry in any state. Returns the service only if it
    /// was still running; a starting service is disposed by its starter and
    /// a completed one by its completion.
    pub fn try_remove_service(&self, parent: &SessionId, invoke_id: &InvokeId) -> Option<Arc<dyn Service>> {
        self.inner
            .services
            .remove(&(parent.clone(), invoke_id.clone()))
            .and_then(|(_, entry)| entry.running())
    }

    /// Claims the completion of one running invocation, marking its entry
    /// completed while keeping the invoke id registered. Only the first
    /// caller for a given `unique_id` gets the service; a removed invocation
    /// never completes.
    pub fn try_complete_service(
        &self,
        parent: &SessionId,
        invoke_id: &InvokeId,
        unique_id: &InvokeUniqueId,
    ) -> Option<Arc<dyn Service>> {
        let mut entry = self
            .inner
            .services
            .get_mut(&(parent.clone(), invoke_id.clone()))?;
        if &entry.unique_id != unique_id {
            return None;
        }
        match std::mem::replace(&mut entry.slot, ServiceSlot::Completed) {
            ServiceSlot::Running(service) => Some(service),
            other => {
                entry.slot = other;
                None
            }
        }
    }

    /// Starts the service described by `request` on behalf of `parent`.
    pub async fn start_invoke(&self, parent: &SessionId, request: InvokeRequest) -> Result<(), EngineError> {
        let factory = self
            .inner
            .factories
            .iter()
            .find(|f| f.can_handle(&request.invoke_type))
            .cloned()
            .ok_or_else(|| EngineError::UnknownInvokeType {
                invoke_type: request.invoke_type.clone(),
            })?;

        let invoke_id = request.invoke_id.clone();
        let unique_id = request.unique_id.clone();
        self.add_service(parent, &invoke_id, &unique_id)?;

        let service = match factory.start_service(self, parent, &request).await {
            Ok(service) => service,
            Err(e) => {
                self.inner
                    .services
                    .remove_if(&(parent.clone(), invoke_id.clone()), |_, e| e.unique_id == unique_id);
                return Err(e);
            }
        };

        let installed = match self.inner.services.get_mut(&(parent.clone(), invoke_id.clone())) {
            Some(mut entry) if entry.unique_id == unique_id && matches!(entry.slot, ServiceSlot::Starting) => {
                entry.slot = ServiceSlot::Running(service.clone());
                true
            }
            _ => false,
        };
        if !installed {
            tracing::debug!(invoke_id = %invoke_id, "invoke cancelled while starting");
            if let Err(e) = service.destroy().await {
                tracing::debug!(invoke_id = %invoke_id, "destroy failed: {}", e);
            }
            service.dispose().await;
            return Ok(());
        }
        tracing::debug!(parent = %parent, invoke_id = %invoke_id, "invoke started");

        let host = self.clone();
        let parent = parent.clone();
        self.inner.tasks.spawn(async move {
            let outcome = service.result().await;
            let Some(service) = host.try_complete_service(&parent, &invoke_id, &unique_id) else {
                return;
            };
            let name = match &outcome {
                Ok(_) => EventName::done_invoke(&invoke_id),
                Err(e) if e.is_cancellation() => {
                    service.dispose().await;
                    return;
                }
                Err(_) => EventName::error_invoke(&invoke_id),
            };
            let data = match outcome {
                Ok(value) => value,
                Err(e) => e.to_value(),
            };
            let mut event = Event::external(name)
                .with_data(data)
                .with_invoke(invoke_id.clone(), Some(unique_id.clone()));
            event.origin = Some(invoke_target(&invoke_id));
            event.origin_type = Some(SCXML_EVENT_PROCESSOR.to_string());

            match host.get_state_machine(&parent) {
                Some(controller) => {
                    if let Err(e) = controller.send(event) {
                        tracing::debug!(parent = %parent, invoke_id = %invoke_id, "completion not delivered: {}", e);
                    }
                }
                None => tracing::debug!(parent = %parent, invoke_id = %invoke_id, "parent gone"),
            }
            service.dispose().await;
        });
        Ok(())
    }

    /// Stops an invoked service, or releases the entry of one that has
    /// completed. No completion event is sent for a stopped service.
    pub async fn cancel_invoke(&self, parent: &SessionId, invoke_id: &InvokeId) -> Result<(), EngineError> {
        if let Some(service) = self.try_remove_service(parent, invoke_id) {
            if let Err(e) = service.destroy().await {
                tracing::debug!(invoke_id = %invoke_id, "destroy failed: {}", e);
            }
            service.dispose().await;
            tracing::debug!(parent = %parent, invoke_id = %invoke_id, "invoke cancelled");
        }
        Ok(())
    }

    /// Delivers an event to an invoked service.
    pub async fn forward_event(
        &self,
        parent: &SessionId,
        invoke_id: &InvokeId,
        event: Event,
    ) -> Result<(), EngineError> {
        let service = self
            .inner
            .services
            .get(&(parent.clone(), invoke_id.clone()))
            .and_then(|e| e.running())
            .ok_or_else(|| EngineError::unknown_target(invoke_target(invoke_id)))?;
        service.send(event).await
    }
}

fn session_target_service(host: &Host, session_id: &SessionId) -> Result<Arc<dyn Service>, EngineError> {
    host.get_state_machine(session_id)
        .map(|c| c as Arc<dyn Service>)
        .ok_or_else(|| EngineError::UnknownSession {
            session_id: session_id.to_string(),
        })
}

/// A session's connection to its host.
pub struct SessionLink {
    host: Weak<HostInner>,
    session_id: SessionId,
}

impl SessionLink {
    fn host(&self) -> Result<Host, EngineError> {
        self.host
            .upgrade()
            .map(|inner| Host { inner })
            .ok_or_else(|| EngineError::invalid_state("host is gone"))
    }
}

#[async_trait]
impl ExternalCommunication for SessionLink {
    async fn send_event(&self, event: OutgoingEvent) -> Result<SendStatus, EngineError> {
        self.host()?.dispatch_event(&self.session_id, event).await
    }

    async fn start_invoke(&self, request: InvokeRequest) -> Result<(), EngineError> {
        self.host()?.start_invoke(&self.session_id, request).await
    }

    async fn cancel_invoke(&self, invoke_id: &InvokeId) -> Result<(), EngineError> {
        self.host()?.cancel_invoke(&self.session_id, invoke_id).await
    }

    async fn forward_event(&self, invoke_id: &InvokeId, event: Event) -> Result<(), EngineError> {
        self.host()?
            .forward_event(&self.session_id, invoke_id, event)
            .await
    }
}

/// Starts chart sessions for `invoke` elements.
pub struct ScxmlServiceFactory;

#[async_trait]
impl ServiceFactory for ScxmlServiceFactory {
    fn can_handle(&self, invoke_type: &str) -> bool {
        invoke_type == SCXML_INVOKE_TYPE
            || invoke_type == SCXML_ALIAS
            || invoke_type == SCXML_INVOKE_TYPE.trim_end_matches('/')
    }

    async fn start_service(
        &self,
        host: &Host,
        parent: &SessionId,
        request: &InvokeRequest,
    ) -> Result<Arc<dyn Service>, EngineError> {
        let source = match (&request.content, &request.source) {
            (Some(Value::String(text)), _) => ChartSource::Text(text.clone()),
            (Some(content), _) => ChartSource::Chart(Arc::new(Chart::from_json(&content.to_json())?)),
            (None, Some(src)) => ChartSource::Uri(src.clone()),
            (None, None) => {
                return Err(EngineError::invalid_argument(
                    "chart invoke needs content or src",
                ))
            }
        };

        let controller = host
            .create_and_add_state_machine(source, None, request.params.clone())
            .await?;
        let child = controller.session_id().clone();
        host.link_parent(&child, parent, request);
        if let Err(e) = host.start_state_machine(&child).await {
            host.inner.parents.remove(&child);
            return Err(e);
        }
        tracing::debug!(parent = %parent, child = %child, invoke_id = %request.invoke_id, "child session started");

        Ok(Arc::new(ChartService {
            controller,
            host: host.downgrade(),
        }))
    }
}

/// An invoked chart session.
struct ChartService {
    controller: Arc<StateMachineController>,
    host: Weak<HostInner>,
}

#[async_trait]
impl Service for ChartService {
    async fn send(&self, event: Event) -> Result<(), EngineError> {
        self.controller.send(event)
    }

    async fn destroy(&self) -> Result<(), EngineError> {
        self.controller.destroy();
        Ok(())
    }

    async fn result(&self) -> Result<Value, EngineError> {
        self.controller.result().await
    }

    async fn dispose(&self) {
        let Some(inner) = self.host.upgrade() else {
            return;
        };
        let host = Host { inner };
        let child = self.controller.session_id();
        host.inner.parents.remove(child);
        match host.destroy_state_machine(child).await {
            Ok(()) | Err(EngineError::UnknownSession { .. }) => {}
            Err(e) => tracing::warn!(session_id = %child, "failed to dispose child session: {}", e),
        }
    }

    fn session_id(&self) -> Option<&SessionId> {
        Some(self.controller.session_id())
    }
}
