//! Run-to-completion interpreter.
//!
//! One [`Interpreter`] executes one run of a session: from a fresh start or
//! from restored storage up to completion, a fault, or a stop/suspend/destroy
//! signal. States are addressed by document id, so every ordered set of
//! states below is a `BTreeSet<u32>` iterated in document order (entry) or
//! reverse document order (exit).
//!
//! The algorithm is the usual statechart microstep/macrostep loop:
//!
//! 1. take eventless transitions until none are enabled, then internal
//!    events until the internal queue is empty;
//! 2. start the invokes of states entered during the macrostep;
//! 3. checkpoint and wait for the next external event.

use crate::controller::SessionStatus;
use crate::custom_action::{create_executor, CustomActionContext};
use crate::datamodel::{create_handler, DataModelHandler, Scope};
use crate::error::EngineError;
use crate::io::{
    session_target, ExternalCommunication, InvokeRequest, OutgoingEvent, SendStatus,
    SCXML_ALIAS, SCXML_EVENT_PROCESSOR, SCXML_INVOKE_TYPE,
};
use crate::options::InterpreterOptions;
use crate::queue::EventQueue;
use crate::scheduler::DelayScheduler;
use crate::store::{SessionState, SessionStore};
use chartd_core::chart::{
    Binding, Content, DataDefinition, DoneDataDefinition, HistoryKind, Invoke, Param,
    TransitionType, ROOT,
};
use chartd_core::{
    Action, Chart, CoreError, Event, EventName, InvokeId, InvokeUniqueId, Map, OrderedSet,
    SendId, SessionId, StateKind, Transition, Value,
};
use chartd_storage::Storage;
use futures::future::{BoxFuture, FutureExt};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;

const KEY_INVOKE_ID: &str = "id";
const KEY_INVOKE_UNIQUE: &str = "unique";
const KEY_INVOKE_STATE: &str = "state";

/// Everything one run needs from its controller.
pub(crate) struct RunContext {
    pub session_id: SessionId,
    pub chart: Arc<Chart>,
    pub options: InterpreterOptions,
    pub queue: EventQueue,
    pub comm: Arc<dyn ExternalCommunication>,
    pub scheduler: Arc<DelayScheduler>,
    pub storage: Option<Arc<dyn Storage>>,
    pub status: Arc<watch::Sender<SessionStatus>>,
}

#[derive(Debug, Clone)]
struct ActiveInvoke {
    id: InvokeId,
    unique_id: InvokeUniqueId,
    state: u32,
}

/// States to enter, computed before any of them is entered.
#[derive(Default)]
struct EntrySet<'c> {
    states: BTreeSet<u32>,
    default_entry: BTreeSet<u32>,
    history_content: HashMap<u32, &'c [Action]>,
}

enum Wake {
    Destroy,
    Stop,
    Suspend,
    Readable(bool),
    Idle,
}

pub(crate) struct Interpreter {
    session_id: SessionId,
    chart: Arc<Chart>,
    options: InterpreterOptions,
    handler: Arc<dyn DataModelHandler>,
    queue: EventQueue,
    comm: Arc<dyn ExternalCommunication>,
    scheduler: Arc<DelayScheduler>,
    status: Arc<watch::Sender<SessionStatus>>,
    storage: Option<Arc<dyn Storage>>,
    store: Option<SessionStore>,

    data: Map,
    invokes: Map,
    configuration: OrderedSet,
    history: HashMap<u32, OrderedSet>,
    internal: VecDeque<Event>,
    states_to_invoke: BTreeSet<u32>,
    active_invokes: HashMap<u32, ActiveInvoke>,
    initialized: HashSet<u32>,
    running: bool,
    result: Value,
}

impl Interpreter {
    pub fn new(ctx: RunContext) -> Result<Self, EngineError> {
        let handler = create_handler(
            &ctx.options.data_model_factories,
            &ctx.chart.datamodel,
            &ctx.options.configuration,
        )?;
        let history = ctx
            .chart
            .nodes()
            .iter()
            .filter(|n| n.is_history())
            .map(|n| (n.doc, OrderedSet::new()))
            .collect();

        Ok(Self {
            session_id: ctx.session_id,
            chart: ctx.chart,
            options: ctx.options,
            handler,
            queue: ctx.queue,
            comm: ctx.comm,
            scheduler: ctx.scheduler,
            status: ctx.status,
            storage: ctx.storage,
            store: None,
            data: Map::new(),
            invokes: Map::new(),
            configuration: OrderedSet::new(),
            history,
            internal: VecDeque::new(),
            states_to_invoke: BTreeSet::new(),
            active_invokes: HashMap::new(),
            initialized: HashSet::new(),
            running: true,
            result: Value::Undefined,
        })
    }

    /// Runs the session until it completes or is interrupted.
    pub async fn run(mut self) -> Result<Value, EngineError> {
        let resumed = self.attach_storage()?;
        if resumed {
            self.resume()?;
        } else {
            self.start().await?;
        }
        self.status.send_replace(SessionStatus::Running);

        match self.main_loop().await {
            Ok(()) => {
                self.exit_interpreter().await?;
                self.checkpoint()?;
                tracing::debug!(session_id = %self.session_id, "session completed");
                Ok(std::mem::take(&mut self.result))
            }
            Err(EngineError::Suspended) => {
                tracing::debug!(session_id = %self.session_id, "session suspended");
                Err(EngineError::Suspended)
            }
            Err(e) => {
                self.cancel_all_invokes().await;
                Err(e)
            }
        }
    }

    fn attach_storage(&mut self) -> Result<bool, EngineError> {
        let Some(storage) = self.storage.clone() else {
            return Ok(false);
        };
        let (store, resumed) = SessionStore::attach(
            storage,
            SessionState {
                data: &self.data,
                invokes: &self.invokes,
                configuration: &self.configuration,
                history: &self.history,
            },
        )?;
        self.store = Some(store);
        Ok(resumed && !self.configuration.is_empty())
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        self.bind_system_variables()?;

        let chart = self.chart.clone();
        self.init_data(&chart.data, true);
        self.initialized.insert(ROOT);
        if chart.binding == Binding::Early {
            for node in chart.nodes() {
                self.init_data(&node.data, false);
                self.initialized.insert(node.doc);
            }
        }

        if let Some(script) = &chart.script {
            let result = self.handler.execute_script(script, &self.scope());
            if let Err(e) = result {
                self.raise_error(e.into());
            }
        }

        let Some(initial) = chart.node(ROOT).initial.as_ref() else {
            return Err(EngineError::invalid_state("chart has no initial transition"));
        };
        self.enter_states(&chart, &[initial]).await
    }

    fn resume(&mut self) -> Result<(), EngineError> {
        self.bind_system_variables()?;

        for (key, entry) in self.invokes.entries() {
            let Ok(doc) = key.parse::<u32>() else { continue };
            let Some(record) = entry.value.as_map() else { continue };
            let (Some(id), Some(unique), Some(state)) = (
                record.get(KEY_INVOKE_ID).as_str().map(InvokeId::from),
                record.get(KEY_INVOKE_UNIQUE).as_str().map(InvokeUniqueId::from),
                record.get(KEY_INVOKE_STATE).as_f64(),
            ) else {
                continue;
            };
            self.active_invokes.insert(
                doc,
                ActiveInvoke {
                    id,
                    unique_id: unique,
                    state: state as u32,
                },
            );
        }

        self.initialized.insert(ROOT);
        for doc in self.configuration.to_vec() {
            self.initialized.insert(doc);
            self.initialized.extend(self.chart.ancestors(doc, None));
        }

        if let Some(store) = &self.store {
            let pending = store.take_pending_events()?;
            if !pending.is_empty() {
                tracing::debug!(
                    session_id = %self.session_id,
                    count = pending.len(),
                    "restored pending events"
                );
            }
            self.queue.requeue_front(pending);
        }
        tracing::debug!(
            session_id = %self.session_id,
            states = ?self.configuration.to_vec(),
            "session resumed"
        );
        Ok(())
    }

    fn bind_system_variables(&mut self) -> Result<(), EngineError> {
        let location = Map::from_pairs([(
            "location".to_string(),
            Value::from(session_target(&self.session_id)),
        )]);
        let location = Value::Map(location.deep_clone(true));
        let processors = Map::from_pairs([
            (SCXML_EVENT_PROCESSOR.to_string(), location.clone()),
            (SCXML_ALIAS.to_string(), location),
        ]);

        self.data
            .define("_sessionid", Value::from(self.session_id.as_str()), true)?;
        let name = self.chart.name.as_deref().map(Value::from).unwrap_or(Value::Null);
        self.data.define("_name", name, true)?;
        self.data
            .define("_ioprocessors", Value::Map(processors.deep_clone(true)), true)?;
        Ok(())
    }

    fn init_data(&mut self, defs: &[DataDefinition], top_level: bool) {
        let arguments = if top_level {
            self.options.arguments.as_map().cloned()
        } else {
            None
        };
        for def in defs {
            let value = match arguments.as_ref().filter(|a| a.contains_key(&def.id)) {
                Some(args) => Ok(args.get(&def.id).deep_clone(false)),
                None => self.data_value(def),
            };
            let value = match value {
                Ok(v) => v,
                Err(e) => {
                    self.raise_error(e);
                    Value::Undefined
                }
            };
            if let Err(e) = self.data.set(&def.id, value) {
                self.raise_error(e.into());
            }
        }
    }

    fn data_value(&self, def: &DataDefinition) -> Result<Value, EngineError> {
        if let Some(expr) = &def.expr {
            self.eval(expr)
        } else if let Some(json) = &def.value {
            Ok(Value::from_json(json))
        } else {
            Ok(Value::Undefined)
        }
    }

    // ---- main loop -------------------------------------------------------

    async fn main_loop(&mut self) -> Result<(), EngineError> {
        let chart = self.chart.clone();
        while self.running {
            while self.running {
                let mut event = None;
                let mut enabled = self.select_transitions(&chart, None);
                if enabled.is_empty() {
                    let Some(internal) = self.internal.pop_front() else {
                        break;
                    };
                    self.set_event(&internal)?;
                    enabled = self.select_transitions(&chart, Some(&internal));
                    event = Some(internal);
                }
                if !enabled.is_empty() {
                    self.microstep(&chart, &enabled, event.as_ref()).await?;
                }
            }
            if !self.running {
                break;
            }

            let to_invoke = std::mem::take(&mut self.states_to_invoke);
            for state in to_invoke {
                for invoke in &chart.node(state).invoke {
                    self.invoke(invoke).await?;
                }
            }
            if !self.internal.is_empty() {
                continue;
            }

            self.checkpoint()?;
            let event = self.next_external_event().await?;
            self.set_event(&event)?;
            self.handle_invoke_event(&chart, &event).await?;
            let enabled = self.select_transitions(&chart, Some(&event));
            if !enabled.is_empty() {
                self.microstep(&chart, &enabled, Some(&event)).await?;
            }
        }
        Ok(())
    }

    async fn next_external_event(&mut self) -> Result<Event, EngineError> {
        let queue = self.queue.clone();
        let stop = self.options.stop_token.clone();
        let suspend = self.options.suspend_token.clone();
        let destroy = self.options.destroy_token.clone();
        let idle = self.options.suspend_idle.filter(|_| self.store.is_some());

        loop {
            let idle_timer = async {
                match idle {
                    Some(period) => tokio::time::sleep(period).await,
                    None => std::future::pending().await,
                }
            };
            let wake = tokio::select! {
                biased;
                _ = destroy.cancelled() => Wake::Destroy,
                _ = stop.cancelled() => Wake::Stop,
                _ = suspend.cancelled() => Wake::Suspend,
                readable = queue.wait_readable() => Wake::Readable(readable),
                _ = idle_timer => Wake::Idle,
            };

            match wake {
                Wake::Destroy => return Err(EngineError::Cancelled),
                Wake::Stop => return Err(EngineError::Halted),
                Wake::Suspend => {
                    if let Some(store) = &self.store {
                        store.store_pending_events(&queue.drain())?;
                        store.checkpoint()?;
                    }
                    return Err(EngineError::Suspended);
                }
                Wake::Readable(false) => return Err(EngineError::QueueClosed),
                Wake::Readable(true) => {
                    if let Some(event) = queue.try_recv() {
                        return Ok(event);
                    }
                }
                Wake::Idle => {
                    tracing::debug!(session_id = %self.session_id, "idle, suspending");
                    return Err(EngineError::Suspended);
                }
            }
        }
    }

    fn set_event(&mut self, event: &Event) -> Result<(), EngineError> {
        self.data.define("_event", event.to_value(), true)?;
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), EngineError> {
        if let Some(store) = &self.store {
            store.checkpoint()?;
        }
        Ok(())
    }

    // ---- transition selection --------------------------------------------

    fn select_transitions<'c>(
        &mut self,
        chart: &'c Chart,
        event: Option<&Event>,
    ) -> Vec<&'c Transition> {
        let mut atomic: Vec<u32> = self
            .configuration
            .to_vec()
            .into_iter()
            .filter(|s| chart.node(*s).is_atomic())
            .collect();
        atomic.sort_unstable();

        let mut enabled: Vec<&'c Transition> = Vec::new();
        for state in atomic {
            'search: for source in std::iter::once(state).chain(chart.ancestors(state, None)) {
                for t in &chart.node(source).transitions {
                    let matches = match event {
                        None => t.is_eventless(),
                        Some(e) => t.events.iter().any(|d| d.matches(&e.name)),
                    };
                    if matches && self.condition(t.cond.as_deref()) {
                        if !enabled.iter().any(|x| x.doc == t.doc) {
                            enabled.push(t);
                        }
                        break 'search;
                    }
                }
            }
        }
        self.remove_conflicting(chart, enabled)
    }

    fn condition(&mut self, cond: Option<&str>) -> bool {
        let Some(cond) = cond else { return true };
        let result = self.handler.evaluate_bool(cond, &self.scope());
        match result {
            Ok(b) => b,
            Err(e) => {
                self.raise_error(e.into());
                false
            }
        }
    }

    fn remove_conflicting<'c>(
        &self,
        chart: &'c Chart,
        enabled: Vec<&'c Transition>,
    ) -> Vec<&'c Transition> {
        let mut filtered: Vec<&'c Transition> = Vec::new();
        for t1 in enabled {
            let exit1 = self.exit_set(chart, &[t1]);
            let mut preempted = false;
            let mut to_remove = Vec::new();
            for (i, t2) in filtered.iter().enumerate() {
                let exit2 = self.exit_set(chart, &[*t2]);
                if exit1.intersection(&exit2).next().is_some() {
                    if chart.is_descendant(t1.source, t2.source) {
                        to_remove.push(i);
                    } else {
                        preempted = true;
                        break;
                    }
                }
            }
            if !preempted {
                for i in to_remove.into_iter().rev() {
                    filtered.remove(i);
                }
                filtered.push(t1);
            }
        }
        filtered
    }

    fn exit_set(&self, chart: &Chart, transitions: &[&Transition]) -> BTreeSet<u32> {
        let mut states = BTreeSet::new();
        for t in transitions {
            if t.is_targetless() {
                continue;
            }
            if let Some(domain) = self.transition_domain(chart, t) {
                states.extend(
                    self.configuration
                        .to_vec()
                        .into_iter()
                        .filter(|s| chart.is_descendant(*s, domain)),
                );
            }
        }
        states
    }

    fn transition_domain(&self, chart: &Chart, t: &Transition) -> Option<u32> {
        let targets = self.effective_targets(chart, t);
        if targets.is_empty() {
            return None;
        }
        let source = chart.node(t.source);
        if t.kind == TransitionType::Internal
            && source.is_compound()
            && targets.iter().all(|s| chart.is_descendant(*s, t.source))
        {
            return Some(t.source);
        }
        Some(find_lcca(chart, t.source, &targets))
    }

    fn effective_targets(&self, chart: &Chart, t: &Transition) -> BTreeSet<u32> {
        let mut targets = BTreeSet::new();
        for &s in &t.targets {
            let node = chart.node(s);
            if node.is_history() {
                match self.history.get(&s).filter(|h| !h.is_empty()) {
                    Some(recorded) => targets.extend(recorded.to_vec()),
                    None => {
                        if let Some(default) = node.transitions.first() {
                            targets.extend(self.effective_targets(chart, default));
                        }
                    }
                }
            } else {
                targets.insert(s);
            }
        }
        targets
    }

    // ---- microstep -------------------------------------------------------

    async fn microstep(
        &mut self,
        chart: &Chart,
        enabled: &[&Transition],
        event: Option<&Event>,
    ) -> Result<(), EngineError> {
        self.exit_states(chart, enabled).await?;
        let event_name = event.map(|e| e.name.to_string());
        for t in enabled {
            self.options.logger.transition(
                &self.session_id,
                &chart.node(t.source).id,
                event_name.as_deref(),
            );
            self.run_actions(&t.actions).await?;
        }
        self.enter_states(chart, enabled).await
    }

    async fn exit_states(&mut self, chart: &Chart, enabled: &[&Transition]) -> Result<(), EngineError> {
        let to_exit = self.exit_set(chart, enabled);
        for s in &to_exit {
            self.states_to_invoke.remove(s);
        }

        for &s in to_exit.iter().rev() {
            for &h in &chart.node(s).children {
                let StateKind::History(kind) = chart.node(h).kind else {
                    continue;
                };
                let recorded: Vec<u32> = self
                    .configuration
                    .to_vec()
                    .into_iter()
                    .filter(|x| match kind {
                        HistoryKind::Deep => {
                            chart.node(*x).is_atomic() && chart.is_descendant(*x, s)
                        }
                        HistoryKind::Shallow => chart.node(*x).parent == Some(s),
                    })
                    .collect();
                if let Some(set) = self.history.get(&h) {
                    set.clear()?;
                    for x in recorded {
                        set.add(x)?;
                    }
                }
            }
        }

        for &s in to_exit.iter().rev() {
            self.run_actions(&chart.node(s).on_exit).await?;
            self.cancel_invokes_of(s).await;
            self.configuration.delete(s)?;
        }
        Ok(())
    }

    async fn enter_states(&mut self, chart: &Chart, enabled: &[&Transition]) -> Result<(), EngineError> {
        let mut entry = EntrySet::default();
        self.compute_entry_set(chart, enabled, &mut entry);

        for &s in &entry.states {
            let node = chart.node(s);
            self.configuration.add(s)?;
            self.states_to_invoke.insert(s);

            if chart.binding == Binding::Late && self.initialized.insert(s) {
                self.init_data(&node.data, false);
            }
            self.run_actions(&node.on_entry).await?;
            if entry.default_entry.contains(&s) {
                if let Some(initial) = &node.initial {
                    self.run_actions(&initial.actions).await?;
                }
            }
            if let Some(actions) = entry.history_content.get(&s) {
                self.run_actions(actions).await?;
            }

            if node.kind != StateKind::Final {
                continue;
            }
            let parent = node.parent.unwrap_or(ROOT);
            if parent == ROOT {
                self.running = false;
                self.result = self.done_data(node.done_data.as_ref());
                continue;
            }
            let data = self.done_data(node.done_data.as_ref());
            self.internal.push_back(
                Event::internal(EventName::done_state(&chart.node(parent).id)).with_data(data),
            );
            if let Some(grandparent) = chart.node(parent).parent {
                if chart.node(grandparent).kind == StateKind::Parallel
                    && chart
                        .child_states(grandparent)
                        .all(|c| self.is_in_final_state(chart, c))
                {
                    self.internal.push_back(Event::internal(EventName::done_state(
                        &chart.node(grandparent).id,
                    )));
                }
            }
        }
        Ok(())
    }

    fn compute_entry_set<'c>(
        &self,
        chart: &'c Chart,
        enabled: &[&'c Transition],
        entry: &mut EntrySet<'c>,
    ) {
        for t in enabled {
            for &s in &t.targets {
                self.add_descendants(chart, s, entry);
            }
            if let Some(domain) = self.transition_domain(chart, t) {
                for s in self.effective_targets(chart, t) {
                    self.add_ancestors(chart, s, domain, entry);
                }
            }
        }
    }

    fn add_descendants<'c>(&self, chart: &'c Chart, s: u32, entry: &mut EntrySet<'c>) {
        let node = chart.node(s);
        if node.is_history() {
            let parent = node.parent.unwrap_or(ROOT);
            let recorded = self
                .history
                .get(&s)
                .map(OrderedSet::to_vec)
                .filter(|r| !r.is_empty());
            let targets = match recorded {
                Some(recorded) => recorded,
                None => {
                    let Some(default) = node.transitions.first() else {
                        return;
                    };
                    entry.history_content.insert(parent, &default.actions);
                    default.targets.clone()
                }
            };
            for &x in &targets {
                self.add_descendants(chart, x, entry);
            }
            for &x in &targets {
                self.add_ancestors(chart, x, parent, entry);
            }
            return;
        }

        entry.states.insert(s);
        match node.kind {
            StateKind::Compound => {
                entry.default_entry.insert(s);
                if let Some(initial) = &node.initial {
                    for &x in &initial.targets {
                        self.add_descendants(chart, x, entry);
                    }
                    for &x in &initial.targets {
                        self.add_ancestors(chart, x, s, entry);
                    }
                }
            }
            StateKind::Parallel => {
                for child in chart.child_states(s) {
                    if !entry.states.iter().any(|x| chart.is_descendant(*x, child)) {
                        self.add_descendants(chart, child, entry);
                    }
                }
            }
            _ => {}
        }
    }

    fn add_ancestors<'c>(&self, chart: &'c Chart, s: u32, upto: u32, entry: &mut EntrySet<'c>) {
        for anc in chart.ancestors(s, Some(upto)) {
            if anc == ROOT {
                continue;
            }
            entry.states.insert(anc);
            if chart.node(anc).kind == StateKind::Parallel {
                for child in chart.child_states(anc) {
                    if !entry.states.iter().any(|x| chart.is_descendant(*x, child)) {
                        self.add_descendants(chart, child, entry);
                    }
                }
            }
        }
    }

    fn is_in_final_state(&self, chart: &Chart, s: u32) -> bool {
        match chart.node(s).kind {
            StateKind::Compound => chart.child_states(s).any(|c| {
                chart.node(c).kind == StateKind::Final && self.configuration.contains(c)
            }),
            StateKind::Parallel => chart
                .child_states(s)
                .all(|c| self.is_in_final_state(chart, c)),
            _ => false,
        }
    }

    fn done_data(&mut self, done_data: Option<&DoneDataDefinition>) -> Value {
        let Some(done_data) = done_data else {
            return Value::Undefined;
        };
        let result = match &done_data.content {
            Some(content) => self.content_value(content),
            None => self.params_value(&done_data.params, &[]),
        };
        result.unwrap_or_else(|e| {
            self.raise_error(e);
            Value::Undefined
        })
    }

    async fn exit_interpreter(&mut self) -> Result<(), EngineError> {
        let chart = self.chart.clone();
        let mut states = self.configuration.to_vec();
        states.sort_unstable_by(|a, b| b.cmp(a));
        for s in states {
            self.run_actions(&chart.node(s).on_exit).await?;
            self.cancel_invokes_of(s).await;
            self.configuration.delete(s)?;
        }
        Ok(())
    }

    // ---- executable content ----------------------------------------------

    /// Runs a block. A recoverable failure stops the block and is reported
    /// as an error event; anything else ends the session.
    async fn run_actions(&mut self, actions: &[Action]) -> Result<(), EngineError> {
        match self.execute_block(actions).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_recoverable() => {
                self.raise_error(e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn execute_block<'a>(&'a mut self, actions: &'a [Action]) -> BoxFuture<'a, Result<(), EngineError>> {
        async move {
            for action in actions {
                self.execute_action(action).await?;
            }
            Ok(())
        }
        .boxed()
    }

    async fn execute_action(&mut self, action: &Action) -> Result<(), EngineError> {
        match action {
            Action::Raise { event } => {
                let name = EventName::parse(event)?;
                self.internal.push_back(Event::internal(name));
            }
            Action::Send { .. } => self.send(action).await?,
            Action::Log { label, expr } => {
                let value = match expr {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Undefined,
                };
                self.options
                    .logger
                    .log(&self.session_id, label.as_deref(), &value);
            }
            Action::Assign {
                location,
                expr,
                value,
            } => {
                let value = match (expr, value) {
                    (Some(expr), _) => self.eval(expr)?,
                    (None, Some(json)) => Value::from_json(json),
                    (None, None) => Value::Undefined,
                };
                self.assign(location, value)?;
            }
            Action::If {
                cond,
                actions,
                else_if,
                else_actions,
            } => {
                if self.eval_bool(cond)? {
                    return self.execute_block(actions).await;
                }
                for branch in else_if {
                    if self.eval_bool(&branch.cond)? {
                        return self.execute_block(&branch.actions).await;
                    }
                }
                self.execute_block(else_actions).await?;
            }
            Action::Foreach {
                array,
                item,
                index,
                actions,
            } => {
                let collection = self.eval(array)?;
                let items = match &collection {
                    Value::List(list) => list.values(),
                    Value::Map(map) => map.entries().into_iter().map(|(_, e)| e.value).collect(),
                    other => {
                        return Err(CoreError::Evaluation {
                            reason: format!("'{}' is not iterable: {}", array, other.kind().as_str()),
                        }
                        .into())
                    }
                };
                for (i, value) in items.into_iter().enumerate() {
                    self.assign(item, value)?;
                    if let Some(index) = index {
                        self.assign(index, Value::from(i as f64))?;
                    }
                    self.execute_block(actions).await?;
                }
            }
            Action::Cancel {
                send_id,
                send_id_expr,
            } => {
                let id = match (send_id, send_id_expr) {
                    (Some(id), _) => id.clone(),
                    (None, Some(expr)) => self.eval(expr)?.to_string(),
                    (None, None) => {
                        return Err(EngineError::invalid_argument("cancel requires a send id"))
                    }
                };
                if !self.scheduler.cancel(&SendId::new(id.as_str())) {
                    tracing::debug!(session_id = %self.session_id, send_id = %id, "nothing to cancel");
                }
            }
            Action::Script { source } => {
                self.handler.execute_script(source, &self.scope())?;
            }
            Action::Custom {
                namespace,
                name,
                attributes,
            } => {
                let executor = create_executor(
                    &self.options.custom_action_factories,
                    namespace,
                    name,
                    attributes,
                )?;
                let (raised, logs) = {
                    let mut ctx = CustomActionContext::new(self.scope(), self.handler.as_ref());
                    executor.execute(&mut ctx)?;
                    ctx.into_effects()
                };
                self.internal.extend(raised);
                for (label, value) in logs {
                    self.options
                        .logger
                        .log(&self.session_id, label.as_deref(), &value);
                }
            }
        }
        Ok(())
    }

    async fn send(&mut self, action: &Action) -> Result<(), EngineError> {
        let Action::Send {
            event,
            event_expr,
            target,
            target_expr,
            type_,
            id,
            id_location,
            delay,
            delay_expr,
            namelist,
            params,
            content,
        } = action
        else {
            return Ok(());
        };

        let name = match (event, event_expr) {
            (Some(name), _) => name.clone(),
            (None, Some(expr)) => self.eval(expr)?.to_string(),
            (None, None) => return Err(EngineError::invalid_argument("send requires an event")),
        };
        let target = match (target, target_expr) {
            (Some(target), _) => Some(target.clone()),
            (None, Some(expr)) => Some(self.eval(expr)?.to_string()),
            (None, None) => None,
        };
        let delay = match (delay, delay_expr) {
            (Some(delay), _) => Some(crate::io::parse_delay(delay)?),
            (None, Some(expr)) => Some(crate::io::parse_delay(&self.eval(expr)?.to_string())?),
            (None, None) => None,
        };
        let send_id = match id {
            Some(id) => SendId::new(id.as_str()),
            None => {
                let generated = SendId::generate();
                if let Some(location) = id_location {
                    self.assign(location, Value::from(generated.as_str()))?;
                }
                generated
            }
        };
        let data = match content {
            Some(content) => self.content_value(content)?,
            None => self.params_value(params, namelist)?,
        };

        let mut outgoing = OutgoingEvent::new(EventName::parse(&name)?)
            .with_send_id(send_id)
            .with_data(data);
        outgoing.target = target;
        outgoing.processor = type_.clone();
        if let Some(delay) = delay {
            outgoing.delay = delay;
        }

        match self.comm.send_event(outgoing.clone()).await? {
            SendStatus::Sent => {}
            SendStatus::ToInternalQueue => {
                self.internal.push_back(outgoing.to_event(&self.session_id));
            }
            SendStatus::ToSchedule => {
                self.scheduler
                    .schedule(outgoing, self.comm.clone(), self.queue.clone());
            }
        }
        Ok(())
    }

    fn content_value(&self, content: &Content) -> Result<Value, EngineError> {
        match (&content.expr, &content.value) {
            (Some(expr), _) => self.eval(expr),
            (None, Some(json)) => Ok(Value::from_json(json)),
            (None, None) => Ok(Value::Undefined),
        }
    }

    /// Builds the data map of `namelist` and `params`; undefined when both
    /// are empty.
    fn params_value(&self, params: &[Param], namelist: &[String]) -> Result<Value, EngineError> {
        if params.is_empty() && namelist.is_empty() {
            return Ok(Value::Undefined);
        }
        let map = Map::new();
        for name in namelist {
            map.set(name, self.eval(name)?)?;
        }
        for param in params {
            let value = match (&param.expr, &param.location) {
                (Some(expr), _) => self.eval(expr)?,
                (None, Some(location)) => self.eval(location)?,
                (None, None) => {
                    return Err(EngineError::invalid_argument(format!(
                        "param '{}' needs an expr or a location",
                        param.name
                    )))
                }
            };
            map.set(&param.name, value)?;
        }
        Ok(Value::Map(map))
    }

    fn scope(&self) -> Scope<'_> {
        Scope::new(&self.data, &self.chart, &self.configuration)
    }

    fn eval(&self, expr: &str) -> Result<Value, EngineError> {
        Ok(self.handler.evaluate_value(expr, &self.scope())?)
    }

    fn eval_bool(&self, expr: &str) -> Result<bool, EngineError> {
        Ok(self.handler.evaluate_bool(expr, &self.scope())?)
    }

    fn assign(&self, location: &str, value: Value) -> Result<(), EngineError> {
        Ok(self.handler.assign(location, value, &self.scope())?)
    }

    fn raise_error(&mut self, error: EngineError) {
        self.options.logger.execution_error(&self.session_id, &error);
        let name = if error.is_communication() {
            EventName::error_communication()
        } else {
            EventName::error_execution()
        };
        self.internal
            .push_back(Event::platform(name).with_data(error.to_value()));
    }

    // ---- invokes ---------------------------------------------------------

    // Whatever keeps a service from starting is reported to the chart.
    async fn invoke(&mut self, invoke: &Invoke) -> Result<(), EngineError> {
        match self.start_invoke(invoke).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancellation() || matches!(e, EngineError::Storage(_)) => Err(e),
            Err(e) => {
                self.raise_error(e);
                Ok(())
            }
        }
    }

    async fn start_invoke(&mut self, invoke: &Invoke) -> Result<(), EngineError> {
        let def = &invoke.definition;
        let invoke_id = match &def.id {
            Some(id) => InvokeId::new(id.as_str()),
            None => InvokeId::for_state(&self.chart.node(invoke.state).id),
        };
        if let Some(location) = &def.id_location {
            self.assign(location, Value::from(invoke_id.as_str()))?;
        }
        let invoke_type = match (&def.type_, &def.type_expr) {
            (Some(t), _) => t.clone(),
            (None, Some(expr)) => self.eval(expr)?.to_string(),
            (None, None) => SCXML_INVOKE_TYPE.to_string(),
        };
        let source = match (&def.src, &def.src_expr) {
            (Some(src), _) => Some(src.clone()),
            (None, Some(expr)) => Some(self.eval(expr)?.to_string()),
            (None, None) => None,
        };
        let content = def
            .content
            .as_ref()
            .map(|c| self.content_value(c))
            .transpose()?;
        let params = self.params_value(&def.params, &def.namelist)?.as_constant();

        let request = InvokeRequest {
            invoke_id: invoke_id.clone(),
            unique_id: InvokeUniqueId::generate(),
            invoke_type,
            source,
            content,
            params,
        };
        let unique_id = request.unique_id.clone();
        self.comm.start_invoke(request).await?;

        let record = Map::from_pairs([
            (KEY_INVOKE_ID.to_string(), Value::from(invoke_id.as_str())),
            (KEY_INVOKE_UNIQUE.to_string(), Value::from(unique_id.as_str())),
            (KEY_INVOKE_STATE.to_string(), Value::from(invoke.state as f64)),
        ]);
        self.invokes
            .set(&invoke.doc.to_string(), Value::Map(record.deep_clone(true)))?;
        self.active_invokes.insert(
            invoke.doc,
            ActiveInvoke {
                id: invoke_id,
                unique_id,
                state: invoke.state,
            },
        );
        Ok(())
    }

    fn forget_invoke(&mut self, doc: u32) -> Option<ActiveInvoke> {
        let removed = self.active_invokes.remove(&doc);
        if removed.is_some() {
            if let Err(e) = self.invokes.remove(&doc.to_string()) {
                tracing::warn!(session_id = %self.session_id, "failed to drop invoke record: {}", e);
            }
        }
        removed
    }

    async fn cancel_invokes_of(&mut self, state: u32) {
        let docs: Vec<u32> = self
            .active_invokes
            .iter()
            .filter(|(_, inv)| inv.state == state)
            .map(|(doc, _)| *doc)
            .collect();
        for doc in docs {
            if let Some(invoke) = self.forget_invoke(doc) {
                if let Err(e) = self.comm.cancel_invoke(&invoke.id).await {
                    tracing::debug!(
                        session_id = %self.session_id,
                        invoke_id = %invoke.id,
                        "cancel invoke failed: {}",
                        e
                    );
                }
            }
        }
    }

    async fn cancel_all_invokes(&mut self) {
        let states: BTreeSet<u32> = self.active_invokes.values().map(|i| i.state).collect();
        for state in states {
            self.cancel_invokes_of(state).await;
        }
    }

    /// Runs `finalize` for events coming from an invoked service and
    /// forwards events to services started with `autoforward`.
    async fn handle_invoke_event(&mut self, chart: &Chart, event: &Event) -> Result<(), EngineError> {
        if let Some(invoke_id) = &event.invoke_id {
            let mut matching: Vec<(u32, ActiveInvoke)> = self
                .active_invokes
                .iter()
                .filter(|(_, inv)| {
                    &inv.id == invoke_id
                        && event
                            .invoke_unique_id
                            .as_ref()
                            .map_or(true, |u| *u == inv.unique_id)
                })
                .map(|(doc, inv)| (*doc, inv.clone()))
                .collect();
            matching.sort_unstable_by_key(|(doc, _)| *doc);

            let done = event.name.starts_with(EventName::DONE_INVOKE)
                || event.name.starts_with(EventName::ERROR_INVOKE);
            for (doc, invoke) in matching {
                if let Some(def) = find_invoke(chart, invoke.state, doc) {
                    self.run_actions(&def.definition.finalize).await?;
                }
                if done {
                    if let Some(invoke) = self.forget_invoke(doc) {
                        // Releases the completed entry held by the host.
                        if let Err(e) = self.comm.cancel_invoke(&invoke.id).await {
                            tracing::debug!(
                                session_id = %self.session_id,
                                invoke_id = %invoke.id,
                                "release invoke failed: {}",
                                e
                            );
                        }
                    }
                }
            }
        }

        let mut forward: Vec<(u32, InvokeId)> = self
            .active_invokes
            .iter()
            .filter(|(doc, inv)| {
                event.invoke_id.as_ref() != Some(&inv.id)
                    && find_invoke(chart, inv.state, **doc).is_some_and(|i| i.definition.autoforward)
            })
            .map(|(doc, inv)| (*doc, inv.id.clone()))
            .collect();
        forward.sort_unstable_by_key(|(doc, _)| *doc);
        for (_, invoke_id) in forward {
            if let Err(e) = self.comm.forward_event(&invoke_id, event.clone()).await {
                if e.is_recoverable() {
                    self.raise_error(e);
                } else {
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

fn find_invoke(chart: &Chart, state: u32, doc: u32) -> Option<&Invoke> {
    chart.node(state).invoke.iter().find(|i| i.doc == doc)
}

/// Innermost compound ancestor of `head` containing every state of `tail`.
fn find_lcca(chart: &Chart, head: u32, tail: &BTreeSet<u32>) -> u32 {
    chart
        .ancestors(head, None)
        .into_iter()
        .filter(|a| chart.node(*a).is_compound())
        .find(|a| tail.iter().all(|s| chart.is_descendant(*s, *a)))
        .unwrap_or(ROOT)
}
