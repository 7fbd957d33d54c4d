//! State chart definitions.
//!
//! Charts use a JSON DSL:
//!
//! ```json
//! {
//!   "name": "door",
//!   "initial": "closed",
//!   "data": [{"id": "opened", "expr": "0"}],
//!   "states": [
//!     {"id": "closed", "transitions": [{"event": "open", "target": "open"}]},
//!     {"id": "open",
//!      "on_entry": [{"action": "assign", "location": "opened", "expr": "opened + 1"}],
//!      "transitions": [{"event": "close", "target": "closed"},
//!                      {"event": "break.*", "target": "broken"}]},
//!     {"id": "broken", "type": "final"}
//!   ]
//! }
//! ```
//!
//! [`Chart::compile`] validates a definition and indexes it in document
//! order: every state gets a `u32` document id, ancestors before
//! descendants, siblings in declaration order.

use crate::error::CoreError;
use crate::event::EventDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Data model type used when a chart does not name one.
pub const DEFAULT_DATAMODEL: &str = "runtime";

fn default_datamodel() -> String {
    DEFAULT_DATAMODEL.to_string()
}

fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct StringOrSeq;

    impl<'de> Visitor<'de> for StringOrSeq {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(v.split_whitespace().map(str::to_string).collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut items = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                items.push(s);
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(StringOrSeq)
}

/// When `data` declarations are evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    /// All data is initialized when the session starts.
    #[default]
    Early,
    /// A state's data is initialized the first time it is entered.
    Late,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    #[default]
    State,
    Parallel,
    Final,
    History,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    #[default]
    Shallow,
    Deep,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    #[default]
    External,
    Internal,
}

/// Inline content: an expression or a literal JSON value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// A named parameter of `send`, `invoke` or `done_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElseIf {
    pub cond: String,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Executable content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Raise {
        event: String,
    },
    Send {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_expr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_expr: Option<String>,
        #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
        type_: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id_location: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_expr: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        namelist: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        params: Vec<Param>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Content>,
    },
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
    },
    Assign {
        location: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expr: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },
    If {
        cond: String,
        #[serde(default)]
        actions: Vec<Action>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        else_if: Vec<ElseIf>,
        #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
        else_actions: Vec<Action>,
    },
    Foreach {
        array: String,
        item: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<String>,
        #[serde(default)]
        actions: Vec<Action>,
    },
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        send_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        send_id_expr: Option<String>,
    },
    Script {
        source: String,
    },
    Custom {
        namespace: String,
        name: String,
        #[serde(default)]
        attributes: serde_json::Map<String, serde_json::Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DoneDataDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokeDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_location: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namelist: Vec<String>,
    #[serde(default)]
    pub autoforward: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalize: Vec<Action>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionDefinition {
    #[serde(default, deserialize_with = "string_or_seq")]
    pub event: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub target: Vec<String>,
    #[serde(default, rename = "type")]
    pub kind: TransitionType,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDefinition {
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: StateType,
    #[serde(default)]
    pub history: HistoryKind,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub initial: Vec<String>,
    #[serde(default)]
    pub states: Vec<StateDefinition>,
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
    #[serde(default)]
    pub on_entry: Vec<Action>,
    #[serde(default)]
    pub on_exit: Vec<Action>,
    #[serde(default)]
    pub invoke: Vec<InvokeDefinition>,
    #[serde(default)]
    pub data: Vec<DataDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_data: Option<DoneDataDefinition>,
}

/// Raw chart definition as loaded from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_datamodel")]
    pub datamodel: String,
    #[serde(default)]
    pub binding: Binding,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub initial: Vec<String>,
    pub states: Vec<StateDefinition>,
    #[serde(default)]
    pub data: Vec<DataDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

impl ChartDefinition {
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        Ok(serde_json::from_value(json.clone())?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Kind of a compiled state node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    /// The implicit document root.
    Root,
    Atomic,
    Compound,
    Parallel,
    Final,
    History(HistoryKind),
}

/// A compiled transition.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Document order across the whole chart.
    pub doc: u32,
    pub source: u32,
    pub events: Vec<EventDescriptor>,
    pub cond: Option<String>,
    pub targets: Vec<u32>,
    pub kind: TransitionType,
    pub actions: Vec<Action>,
}

impl Transition {
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_targetless(&self) -> bool {
        self.targets.is_empty()
    }
}

/// A compiled invoke.
#[derive(Debug, Clone)]
pub struct Invoke {
    /// Document order across the whole chart.
    pub doc: u32,
    pub state: u32,
    pub definition: InvokeDefinition,
}

/// A compiled state node.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub id: String,
    pub doc: u32,
    pub kind: StateKind,
    pub parent: Option<u32>,
    pub children: Vec<u32>,
    /// Initial transition of compound states and the root.
    pub initial: Option<Transition>,
    pub transitions: Vec<Transition>,
    pub on_entry: Vec<Action>,
    pub on_exit: Vec<Action>,
    pub invoke: Vec<Invoke>,
    pub data: Vec<DataDefinition>,
    pub done_data: Option<DoneDataDefinition>,
}

impl StateNode {
    pub fn is_atomic(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final)
    }

    pub fn is_compound(&self) -> bool {
        matches!(self.kind, StateKind::Compound | StateKind::Root)
    }

    pub fn is_history(&self) -> bool {
        matches!(self.kind, StateKind::History(_))
    }
}

/// Validated chart indexed in document order. Node 0 is the root.
#[derive(Debug, Clone)]
pub struct Chart {
    pub name: Option<String>,
    pub datamodel: String,
    pub binding: Binding,
    pub data: Vec<DataDefinition>,
    pub script: Option<String>,
    nodes: Vec<StateNode>,
    ids: HashMap<String, u32>,
    checksum: String,
    raw: ChartDefinition,
}

pub const ROOT: u32 = 0;

impl Chart {
    pub fn from_json(json: &serde_json::Value) -> Result<Self, CoreError> {
        Self::compile(ChartDefinition::from_json(json)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, CoreError> {
        Self::compile(ChartDefinition::from_json_str(text)?)
    }

    /// Validates and indexes a definition.
    pub fn compile(raw: ChartDefinition) -> Result<Self, CoreError> {
        if raw.states.is_empty() {
            return Err(invalid("chart has no states"));
        }

        let json_bytes = serde_json::to_vec(&raw)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        let mut builder = Builder::default();
        builder.nodes.push(StateNode {
            id: raw.name.clone().unwrap_or_default(),
            doc: ROOT,
            kind: StateKind::Root,
            parent: None,
            children: Vec::new(),
            initial: None,
            transitions: Vec::new(),
            on_entry: Vec::new(),
            on_exit: Vec::new(),
            invoke: Vec::new(),
            data: Vec::new(),
            done_data: None,
        });
        for state in &raw.states {
            let child = builder.add_state(state, ROOT)?;
            builder.nodes[ROOT as usize].children.push(child);
        }
        builder.resolve(ROOT, &raw.initial, &[])?;
        for (source, definition) in builder.pending.clone() {
            builder.resolve_transitions(source, &definition)?;
        }
        builder.number_transitions();

        Ok(Self {
            name: raw.name.clone(),
            datamodel: raw.datamodel.clone(),
            binding: raw.binding,
            data: raw.data.clone(),
            script: raw.script.clone(),
            nodes: builder.nodes,
            ids: builder.ids,
            checksum,
            raw,
        })
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn raw(&self) -> &ChartDefinition {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn node(&self, doc: u32) -> &StateNode {
        &self.nodes[doc as usize]
    }

    pub fn nodes(&self) -> &[StateNode] {
        &self.nodes
    }

    pub fn lookup(&self, id: &str) -> Option<u32> {
        self.ids.get(id).copied()
    }

    /// Whether `doc` is a strict descendant of `ancestor`.
    pub fn is_descendant(&self, doc: u32, ancestor: u32) -> bool {
        let mut current = self.node(doc).parent;
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.node(p).parent;
        }
        false
    }

    /// Proper ancestors of `doc`, innermost first, stopping before `upto`.
    pub fn ancestors(&self, doc: u32, upto: Option<u32>) -> Vec<u32> {
        let mut result = Vec::new();
        let mut current = self.node(doc).parent;
        while let Some(p) = current {
            if Some(p) == upto {
                break;
            }
            result.push(p);
            current = self.node(p).parent;
        }
        result
    }

    /// Children that are real states (history pseudo-states excluded).
    pub fn child_states(&self, doc: u32) -> impl Iterator<Item = u32> + '_ {
        self.node(doc)
            .children
            .iter()
            .copied()
            .filter(move |c| !self.node(*c).is_history())
    }

    /// All transitions in document order.
    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.nodes.iter().flat_map(|n| n.transitions.iter())
    }
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidDefinition {
        reason: reason.into(),
    }
}

#[derive(Default)]
struct Builder {
    nodes: Vec<StateNode>,
    ids: HashMap<String, u32>,
    pending: Vec<(u32, StateDefinition)>,
    next_invoke: u32,
}

impl Builder {
    fn add_state(&mut self, def: &StateDefinition, parent: u32) -> Result<u32, CoreError> {
        if def.id.is_empty() || def.id.chars().any(char::is_whitespace) {
            return Err(invalid(format!("invalid state id '{}'", def.id)));
        }
        let doc = self.nodes.len() as u32;
        if self.ids.insert(def.id.clone(), doc).is_some() {
            return Err(invalid(format!("duplicate state id '{}'", def.id)));
        }

        let kind = match def.kind {
            StateType::State if def.states.is_empty() => StateKind::Atomic,
            StateType::State => StateKind::Compound,
            StateType::Parallel => StateKind::Parallel,
            StateType::Final => StateKind::Final,
            StateType::History => StateKind::History(def.history),
        };

        match kind {
            StateKind::Final if !def.states.is_empty() || !def.transitions.is_empty() => {
                return Err(invalid(format!(
                    "final state '{}' cannot have children or transitions",
                    def.id
                )));
            }
            StateKind::History(_) => {
                if !def.states.is_empty() {
                    return Err(invalid(format!(
                        "history state '{}' cannot have children",
                        def.id
                    )));
                }
                if self.nodes[parent as usize].kind == StateKind::Root {
                    return Err(invalid(format!(
                        "history state '{}' must be inside a compound or parallel state",
                        def.id
                    )));
                }
            }
            StateKind::Parallel if def.states.is_empty() => {
                return Err(invalid(format!("parallel state '{}' has no children", def.id)));
            }
            _ => {}
        }

        let invoke = def
            .invoke
            .iter()
            .map(|definition| {
                let invoke = Invoke {
                    doc: self.next_invoke,
                    state: doc,
                    definition: definition.clone(),
                };
                self.next_invoke += 1;
                invoke
            })
            .collect();

        self.nodes.push(StateNode {
            id: def.id.clone(),
            doc,
            kind,
            parent: Some(parent),
            children: Vec::new(),
            initial: None,
            transitions: Vec::new(),
            on_entry: def.on_entry.clone(),
            on_exit: def.on_exit.clone(),
            invoke,
            data: def.data.clone(),
            done_data: def.done_data.clone(),
        });

        for child in &def.states {
            let child_doc = self.add_state(child, doc)?;
            self.nodes[doc as usize].children.push(child_doc);
        }

        self.pending.push((doc, def.clone()));
        Ok(doc)
    }

    fn lookup(&self, id: &str) -> Result<u32, CoreError> {
        self.ids
            .get(id)
            .copied()
            .ok_or_else(|| invalid(format!("unknown state '{}'", id)))
    }

    fn is_descendant(&self, doc: u32, ancestor: u32) -> bool {
        let mut current = self.nodes[doc as usize].parent;
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.nodes[p as usize].parent;
        }
        false
    }

    // Builds the initial transition of a compound state or the root.
    fn resolve(&mut self, doc: u32, initial: &[String], actions: &[Action]) -> Result<(), CoreError> {
        let node = &self.nodes[doc as usize];
        if !node.is_compound() {
            if !initial.is_empty() {
                return Err(invalid(format!(
                    "state '{}' declares an initial state but is not compound",
                    node.id
                )));
            }
            return Ok(());
        }

        let targets = if initial.is_empty() {
            let first = node
                .children
                .iter()
                .copied()
                .find(|c| !self.nodes[*c as usize].is_history())
                .ok_or_else(|| invalid(format!("state '{}' has no child states", node.id)))?;
            vec![first]
        } else {
            let mut targets = Vec::new();
            for id in initial {
                let target = self.lookup(id)?;
                if !self.is_descendant(target, doc) {
                    return Err(invalid(format!(
                        "initial state '{}' is not a descendant of '{}'",
                        id, self.nodes[doc as usize].id
                    )));
                }
                targets.push(target);
            }
            targets
        };

        self.nodes[doc as usize].initial = Some(Transition {
            doc: 0,
            source: doc,
            events: Vec::new(),
            cond: None,
            targets,
            kind: TransitionType::External,
            actions: actions.to_vec(),
        });
        Ok(())
    }

    fn resolve_transitions(&mut self, doc: u32, def: &StateDefinition) -> Result<(), CoreError> {
        self.resolve(doc, &def.initial, &[])?;

        let mut transitions = Vec::with_capacity(def.transitions.len());
        for t in &def.transitions {
            let mut events = Vec::new();
            for e in &t.event {
                events.push(EventDescriptor::parse(e).map_err(|e| {
                    invalid(format!("state '{}': {}", def.id, e))
                })?);
            }
            let mut targets = Vec::new();
            for id in &t.target {
                targets.push(self.lookup(id)?);
            }
            transitions.push(Transition {
                doc: 0,
                source: doc,
                events,
                cond: t.cond.clone(),
                targets,
                kind: t.kind,
                actions: t.actions.clone(),
            });
        }

        if let StateKind::History(_) = self.nodes[doc as usize].kind {
            let parent = self.nodes[doc as usize].parent.unwrap_or(ROOT);
            match transitions.first() {
                Some(default) if default.targets.iter().all(|t| self.is_descendant(*t, parent)) => {}
                Some(_) => {
                    return Err(invalid(format!(
                        "default transition of history '{}' leaves its parent",
                        def.id
                    )))
                }
                None => {
                    return Err(invalid(format!(
                        "history state '{}' needs a default transition",
                        def.id
                    )))
                }
            }
        }

        self.nodes[doc as usize].transitions = transitions;
        Ok(())
    }

    fn number_transitions(&mut self) {
        let mut next = 0;
        for node in &mut self.nodes {
            if let Some(initial) = &mut node.initial {
                initial.doc = u32::MAX;
            }
            for t in &mut node.transitions {
                t.doc = next;
                next += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn door() -> serde_json::Value {
        json!({
            "name": "door",
            "initial": "closed",
            "states": [
                {"id": "closed", "transitions": [{"event": "open", "target": "opened"}]},
                {"id": "opened", "type": "parallel", "states": [
                    {"id": "light", "states": [{"id": "on"}, {"id": "off"}], "initial": "off"},
                    {"id": "fan"}
                ], "transitions": [{"event": "close break.*", "target": "closed"}]},
                {"id": "done", "type": "final"}
            ]
        })
    }

    #[test]
    fn test_compile_document_order() {
        let chart = Chart::from_json(&door()).unwrap();
        let ids: Vec<&str> = chart.nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["door", "closed", "opened", "light", "on", "off", "fan", "done"]
        );
        assert_eq!(chart.node(chart.lookup("opened").unwrap()).kind, StateKind::Parallel);
        assert_eq!(chart.node(chart.lookup("light").unwrap()).kind, StateKind::Compound);
        assert_eq!(chart.node(chart.lookup("fan").unwrap()).kind, StateKind::Atomic);
        assert_eq!(chart.datamodel, DEFAULT_DATAMODEL);
    }

    #[test]
    fn test_initial_resolution() {
        let chart = Chart::from_json(&door()).unwrap();
        let root_initial = chart.node(ROOT).initial.as_ref().unwrap();
        assert_eq!(root_initial.targets, vec![chart.lookup("closed").unwrap()]);

        let light = chart.node(chart.lookup("light").unwrap());
        assert_eq!(
            light.initial.as_ref().unwrap().targets,
            vec![chart.lookup("off").unwrap()]
        );
    }

    #[test]
    fn test_transitions_numbered_in_document_order() {
        let chart = Chart::from_json(&door()).unwrap();
        let docs: Vec<u32> = chart.transitions().map(|t| t.doc).collect();
        assert_eq!(docs, vec![0, 1]);
        let opened = chart.node(chart.lookup("opened").unwrap());
        assert_eq!(opened.transitions[0].events.len(), 2);
    }

    #[test]
    fn test_ancestry() {
        let chart = Chart::from_json(&door()).unwrap();
        let on = chart.lookup("on").unwrap();
        let opened = chart.lookup("opened").unwrap();
        assert!(chart.is_descendant(on, opened));
        assert!(chart.is_descendant(on, ROOT));
        assert!(!chart.is_descendant(opened, on));
        assert_eq!(
            chart.ancestors(on, Some(ROOT)),
            vec![chart.lookup("light").unwrap(), opened]
        );
    }

    #[test]
    fn test_checksum_is_stable() {
        let a = Chart::from_json(&door()).unwrap();
        let b = Chart::from_json(&door()).unwrap();
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 8);
    }

    #[test]
    fn test_rejects_unknown_target() {
        let result = Chart::from_json(&json!({
            "states": [{"id": "a", "transitions": [{"event": "x", "target": "nowhere"}]}]
        }));
        assert!(matches!(result, Err(CoreError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let result = Chart::from_json(&json!({
            "states": [{"id": "a"}, {"id": "b", "states": [{"id": "a"}]}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_bad_initial() {
        let result = Chart::from_json(&json!({
            "states": [{"id": "a", "initial": "b", "states": [{"id": "c"}]}, {"id": "b"}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_history_needs_default() {
        let result = Chart::from_json(&json!({
            "states": [{"id": "a", "states": [{"id": "h", "type": "history"}, {"id": "b"}]}]
        }));
        assert!(result.is_err());

        let chart = Chart::from_json(&json!({
            "states": [{"id": "a", "states": [
                {"id": "h", "type": "history", "history": "deep", "transitions": [{"target": "b"}]},
                {"id": "b"}
            ]}]
        }))
        .unwrap();
        let a = chart.node(chart.lookup("a").unwrap());
        assert_eq!(
            a.initial.as_ref().unwrap().targets,
            vec![chart.lookup("b").unwrap()]
        );
        assert_eq!(
            chart.node(chart.lookup("h").unwrap()).kind,
            StateKind::History(HistoryKind::Deep)
        );
    }

    #[test]
    fn test_actions_deserialize() {
        let chart = Chart::from_json(&json!({
            "states": [{"id": "a", "on_entry": [
                {"action": "raise", "event": "go"},
                {"action": "send", "event": "tick", "delay": "1s", "target": "#_internal"},
                {"action": "if", "cond": "x > 1", "actions": [{"action": "log", "expr": "x"}],
                 "else": [{"action": "assign", "location": "x", "expr": "0"}]}
            ]}]
        }))
        .unwrap();
        let a = chart.node(chart.lookup("a").unwrap());
        assert_eq!(a.on_entry.len(), 3);
        assert!(matches!(&a.on_entry[2], Action::If { else_actions, .. } if else_actions.len() == 1));
    }
}
