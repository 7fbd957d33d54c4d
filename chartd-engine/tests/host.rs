//! Routing, invokes and suspension through the host.

use async_trait::async_trait;
use chartd_core::{Chart, Event, EventName, SessionId, Value};
use chartd_engine::{
    ChartSource, EngineError, Host, HostOptions, InterpreterOptions, InvokeRequest,
    PersistenceLevel, Service, ServiceFactory,
};
use chartd_storage::MemoryStorageProvider;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn chart(json: serde_json::Value) -> ChartSource {
    ChartSource::Chart(Arc::new(Chart::from_json(&json).unwrap()))
}

fn event(name: &str) -> Event {
    Event::external(EventName::parse(name).unwrap())
}

async fn execute(host: &Host, json: serde_json::Value) -> Value {
    tokio::time::timeout(
        Duration::from_secs(5),
        host.execute_state_machine(chart(json), None, Value::Undefined),
    )
    .await
    .expect("session did not complete")
    .unwrap()
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_invoked_chart_talks_to_parent() {
    let child = json!({
        "data": [{"id": "greeting", "value": "none"}],
        "states": [
            {"id": "c",
             "on_entry": [{"action": "send", "event": "hello", "target": "#_parent",
                           "namelist": ["greeting"]}],
             "transitions": [{"event": "bye", "target": "cend"}]},
            {"id": "cend", "type": "final", "done_data": {"content": {"value": "bye"}}}
        ]
    });
    let parent = json!({
        "data": [{"id": "got", "value": ""}],
        "states": [
            {"id": "p", "initial": "wait",
             "invoke": [{"id": "child",
                         "params": [{"name": "greeting", "expr": "'hi'"}],
                         "content": {"value": child}}],
             "states": [
                {"id": "wait", "transitions": [
                    {"event": "hello", "target": "talking", "actions": [
                        {"action": "assign", "location": "got", "expr": "_event.data.greeting"},
                        {"action": "send", "event": "bye", "target": "#_child"}
                    ]}
                ]},
                {"id": "talking"}
             ],
             "transitions": [
                {"event": "done.invoke.child", "target": "end", "actions": [
                    {"action": "assign", "location": "got", "expr": "got + '/' + _event.data"}
                ]}
             ]},
            {"id": "end", "type": "final", "done_data": {"content": {"expr": "got"}}}
        ]
    });

    let host = Host::new(HostOptions::default());
    assert_eq!(execute(&host, parent).await, Value::from("hi/bye"));
    eventually("cleanup", || host.session_count() == 0 && host.service_count() == 0).await;
}

#[tokio::test]
async fn test_autoforward_reaches_child() {
    let parent = json!({
        "states": [
            {"id": "a",
             "invoke": [{"id": "child", "autoforward": true, "content": {"value": {
                "states": [
                    {"id": "c", "transitions": [{"event": "ping", "target": "cend"}]},
                    {"id": "cend", "type": "final", "done_data": {"content": {"expr": "_event.name"}}}
                ]
             }}}],
             "transitions": [{"event": "done.invoke.child", "target": "end"}]},
            {"id": "end", "type": "final", "done_data": {"content": {"expr": "_event.data"}}}
        ]
    });

    let host = Host::new(HostOptions::default());
    let controller = host
        .create_and_add_state_machine(chart(parent), None, Value::Undefined)
        .await
        .unwrap();
    host.start_state_machine(controller.session_id()).await.unwrap();
    controller.send(event("ping")).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), controller.result())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Value::from("ping"));
}

struct FailingService {
    disposed: Arc<AtomicUsize>,
}

#[async_trait]
impl Service for FailingService {
    async fn send(&self, _event: Event) -> Result<(), EngineError> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn result(&self) -> Result<Value, EngineError> {
        Err(EngineError::Resource {
            uri: "test:fail".to_string(),
            reason: "boom".to_string(),
        })
    }

    async fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

struct FailingFactory {
    disposed: Arc<AtomicUsize>,
}

#[async_trait]
impl ServiceFactory for FailingFactory {
    fn can_handle(&self, invoke_type: &str) -> bool {
        invoke_type == "test:fail"
    }

    async fn start_service(
        &self,
        _host: &Host,
        _parent: &SessionId,
        _request: &InvokeRequest,
    ) -> Result<Arc<dyn Service>, EngineError> {
        Ok(Arc::new(FailingService {
            disposed: self.disposed.clone(),
        }))
    }
}

#[tokio::test]
async fn test_failing_service_reports_error_invoke_once() {
    let disposed = Arc::new(AtomicUsize::new(0));
    let host = Host::new(HostOptions {
        service_factories: vec![Arc::new(FailingFactory {
            disposed: disposed.clone(),
        })],
        ..HostOptions::default()
    });
    let parent = json!({
        "states": [
            {"id": "a",
             "invoke": [{"id": "svc", "type": "test:fail"}],
             "transitions": [{"event": "error.invoke.svc", "target": "end"}]},
            {"id": "end", "type": "final", "done_data": {"params": [
                {"name": "name", "expr": "_event.name"},
                {"name": "code", "expr": "_event.data.code"},
                {"name": "invokeid", "expr": "_event.invokeid"}
            ]}}
        ]
    });

    let result = execute(&host, parent).await;
    assert_eq!(
        result.to_json(),
        json!({"name": "error.invoke.svc", "code": "RESOURCE_ERROR", "invokeid": "svc"})
    );
    eventually("dispose", || disposed.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    assert_eq!(host.service_count(), 0);
}

// Stays in the invoking state and counts completion events until a delayed
// `finish`, so a second delivery would show up in the result.
fn counting_parent(invoke: serde_json::Value, counted: &str) -> serde_json::Value {
    json!({
        "data": [{"id": "count", "expr": "0"}],
        "states": [
            {"id": "a",
             "on_entry": [{"action": "send", "event": "finish", "delay": "300ms"}],
             "invoke": [invoke],
             "transitions": [
                {"event": counted, "actions": [
                    {"action": "assign", "location": "count", "expr": "count + 1"}
                ]},
                {"event": "finish", "target": "end"}
             ]},
            {"id": "end", "type": "final", "done_data": {"content": {"expr": "count"}}}
        ]
    })
}

#[tokio::test]
async fn test_exactly_one_done_invoke_reaches_parent() {
    let host = Host::new(HostOptions::default());
    let parent = counting_parent(
        json!({"id": "child", "content": {"value": {
            "states": [{"id": "c", "type": "final"}]
        }}}),
        "done.invoke.child",
    );
    assert_eq!(execute(&host, parent).await, Value::from(1.0));
    eventually("cleanup", || host.session_count() == 0 && host.service_count() == 0).await;
}

#[tokio::test]
async fn test_exactly_one_error_invoke_reaches_parent() {
    let disposed = Arc::new(AtomicUsize::new(0));
    let host = Host::new(HostOptions {
        service_factories: vec![Arc::new(FailingFactory {
            disposed: disposed.clone(),
        })],
        ..HostOptions::default()
    });
    let parent = counting_parent(json!({"id": "svc", "type": "test:fail"}), "error.invoke.svc");
    assert_eq!(execute(&host, parent).await, Value::from(1.0));
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    assert_eq!(host.service_count(), 0);
}

#[tokio::test]
async fn test_child_that_cannot_start_raises_error() {
    let parent = json!({
        "states": [
            {"id": "a",
             "invoke": [{"id": "child", "content": {"value": {
                "datamodel": "ecmascript",
                "states": [{"id": "c"}]
             }}}],
             "transitions": [
                {"event": "error.execution", "target": "end"},
                {"event": "done.invoke.child", "target": "wrong"}
             ]},
            {"id": "end", "type": "final", "done_data": {"content": {"expr": "_event.data.code"}}},
            {"id": "wrong", "type": "final"}
        ]
    });

    let host = Host::new(HostOptions::default());
    assert_eq!(execute(&host, parent).await, Value::from("UNKNOWN_DATA_MODEL"));
    eventually("cleanup", || host.session_count() == 0 && host.service_count() == 0).await;
}

#[tokio::test]
async fn test_send_between_sessions() {
    let host = Host::new(HostOptions::default());
    let receiver = host
        .create_and_add_state_machine(
            chart(json!({
                "states": [
                    {"id": "w", "transitions": [{"event": "ping", "target": "end"}]},
                    {"id": "end", "type": "final", "done_data": {"content": {"expr": "_event.origin"}}}
                ]
            })),
            Some(SessionId::new("b")),
            Value::Undefined,
        )
        .await
        .unwrap();
    host.start_state_machine(&SessionId::new("b")).await.unwrap();

    let sender = host
        .create_and_add_state_machine(
            chart(json!({
                "states": [
                    {"id": "s",
                     "on_entry": [{"action": "send", "event": "ping", "target": "#_scxml_b"}],
                     "transitions": [{"target": "end"}]},
                    {"id": "end", "type": "final"}
                ]
            })),
            Some(SessionId::new("a")),
            Value::Undefined,
        )
        .await
        .unwrap();
    host.start_state_machine(&SessionId::new("a")).await.unwrap();
    sender.result().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), receiver.result())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Value::from("#_scxml_a"));
}

#[tokio::test]
async fn test_unknown_target_is_communication_error() {
    let host = Host::new(HostOptions::default());
    let result = execute(
        &host,
        json!({
            "states": [
                {"id": "s",
                 "on_entry": [{"action": "send", "event": "x", "target": "#_scxml_nobody"}],
                 "transitions": [{"event": "error.communication", "target": "end"}]},
                {"id": "end", "type": "final", "done_data": {"content": {"expr": "_event.data.code"}}}
            ]
        }),
    )
    .await;
    assert_eq!(result, Value::from("UNKNOWN_TARGET"));
}

#[tokio::test]
async fn test_parent_target_without_parent() {
    let host = Host::new(HostOptions::default());
    let result = execute(
        &host,
        json!({
            "states": [
                {"id": "s",
                 "on_entry": [{"action": "send", "event": "x", "target": "#_parent"}],
                 "transitions": [{"event": "error.communication", "target": "end"}]},
                {"id": "end", "type": "final", "done_data": {"content": {"value": "no parent"}}}
            ]
        }),
    )
    .await;
    assert_eq!(result, Value::from("no parent"));
}

#[tokio::test]
async fn test_stop_host_and_resume() {
    let provider = Arc::new(MemoryStorageProvider::new());
    let options = HostOptions {
        interpreter: InterpreterOptions::default()
            .with_persistence(PersistenceLevel::StableState, provider.clone()),
        ..HostOptions::default()
    };
    let counter = json!({
        "data": [{"id": "count", "expr": "0"}],
        "states": [
            {"id": "counting", "transitions": [
                {"event": "inc", "actions": [
                    {"action": "assign", "location": "count", "expr": "count + 1"}
                ]},
                {"event": "finish", "target": "end"}
            ]},
            {"id": "end", "type": "final", "done_data": {"content": {"expr": "count"}}}
        ]
    });
    let id = SessionId::new("counter");

    let host = Host::new(options.clone());
    let controller = host
        .create_and_add_state_machine(chart(counter.clone()), Some(id.clone()), Value::Undefined)
        .await
        .unwrap();
    host.start_state_machine(&id).await.unwrap();
    controller.send(event("inc")).unwrap();
    controller.send(event("inc")).unwrap();
    host.stop_host().await;
    assert_eq!(host.session_count(), 0);
    assert!(!provider.is_empty());

    let host = Host::new(options);
    let controller = host
        .create_and_add_state_machine(chart(counter), Some(id.clone()), Value::Undefined)
        .await
        .unwrap();
    host.start_state_machine(&id).await.unwrap();
    controller.send(event("finish")).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), controller.result())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Value::from(2.0));
}
