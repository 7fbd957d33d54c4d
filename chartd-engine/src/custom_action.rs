//! Custom executable content.
//!
//! A chart action `{"action": "custom", "namespace": ..., "name": ...}` is
//! resolved against the registered [`CustomActionFactory`] instances when it
//! runs. Unknown actions fail with `UnknownCustomAction`, which the
//! interpreter reports as `error.execution`.

use crate::datamodel::{DataModelHandler, Scope};
use crate::error::EngineError;
use chartd_core::{CoreError, Event, EventName, Value};
use std::sync::Arc;

pub type Attributes = serde_json::Map<String, serde_json::Value>;

pub trait CustomActionFactory: Send + Sync {
    fn namespace(&self) -> &str;

    fn can_handle(&self, name: &str) -> bool;

    fn create(
        &self,
        name: &str,
        attributes: &Attributes,
    ) -> Result<Box<dyn CustomActionExecutor>, CoreError>;
}

pub trait CustomActionExecutor: Send + Sync {
    fn execute(&self, ctx: &mut CustomActionContext<'_>) -> Result<(), CoreError>;
}

/// What a custom action can do inside the running session.
pub struct CustomActionContext<'a> {
    scope: Scope<'a>,
    handler: &'a dyn DataModelHandler,
    raised: Vec<Event>,
    logs: Vec<(Option<String>, Value)>,
}

impl<'a> CustomActionContext<'a> {
    pub(crate) fn new(scope: Scope<'a>, handler: &'a dyn DataModelHandler) -> Self {
        Self {
            scope,
            handler,
            raised: Vec::new(),
            logs: Vec::new(),
        }
    }

    pub fn evaluate(&self, expr: &str) -> Result<Value, CoreError> {
        self.handler.evaluate_value(expr, &self.scope)
    }

    pub fn evaluate_bool(&self, expr: &str) -> Result<bool, CoreError> {
        self.handler.evaluate_bool(expr, &self.scope)
    }

    pub fn assign(&self, location: &str, value: Value) -> Result<(), CoreError> {
        self.handler.assign(location, value, &self.scope)
    }

    /// Queues an internal event, delivered after the action completes.
    pub fn raise(&mut self, name: &str, data: Value) -> Result<(), CoreError> {
        let event = Event::internal(EventName::parse(name)?).with_data(data);
        self.raised.push(event);
        Ok(())
    }

    pub fn log(&mut self, label: Option<&str>, value: Value) {
        self.logs.push((label.map(str::to_string), value));
    }

    pub(crate) fn into_effects(self) -> (Vec<Event>, Vec<(Option<String>, Value)>) {
        (self.raised, self.logs)
    }
}

pub(crate) fn create_executor(
    factories: &[Arc<dyn CustomActionFactory>],
    namespace: &str,
    name: &str,
    attributes: &Attributes,
) -> Result<Box<dyn CustomActionExecutor>, EngineError> {
    let factory = factories
        .iter()
        .find(|f| f.namespace() == namespace && f.can_handle(name))
        .ok_or_else(|| EngineError::UnknownCustomAction {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;
    Ok(factory.create(name, attributes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::RuntimeDataModelHandler;
    use chartd_core::{Chart, Map, OrderedSet};
    use serde_json::json;

    struct Counter;

    impl CustomActionExecutor for Counter {
        fn execute(&self, ctx: &mut CustomActionContext<'_>) -> Result<(), CoreError> {
            let next = ctx.evaluate("count + 1")?;
            ctx.assign("count", next.clone())?;
            ctx.log(Some("count"), next);
            ctx.raise("counted", Value::Null)
        }
    }

    struct CounterFactory;

    impl CustomActionFactory for CounterFactory {
        fn namespace(&self) -> &str {
            "urn:test"
        }

        fn can_handle(&self, name: &str) -> bool {
            name == "increment"
        }

        fn create(
            &self,
            _name: &str,
            _attributes: &Attributes,
        ) -> Result<Box<dyn CustomActionExecutor>, CoreError> {
            Ok(Box::new(Counter))
        }
    }

    #[test]
    fn test_executor_effects() {
        let chart = Chart::from_json(&json!({"states": [{"id": "a"}]})).unwrap();
        let data = Map::new();
        data.set("count", Value::from(1.0)).unwrap();
        let configuration = OrderedSet::new();
        let handler = RuntimeDataModelHandler::new();

        let factories: Vec<Arc<dyn CustomActionFactory>> = vec![Arc::new(CounterFactory)];
        let executor =
            create_executor(&factories, "urn:test", "increment", &Attributes::new()).unwrap();

        let mut ctx = CustomActionContext::new(Scope::new(&data, &chart, &configuration), &handler);
        executor.execute(&mut ctx).unwrap();
        let (raised, logs) = ctx.into_effects();

        assert_eq!(data.get("count"), Value::from(2.0));
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].name.to_string(), "counted");
        assert_eq!(logs, vec![(Some("count".to_string()), Value::from(2.0))]);
    }

    #[test]
    fn test_unknown_action() {
        let factories: Vec<Arc<dyn CustomActionFactory>> = vec![Arc::new(CounterFactory)];
        assert!(matches!(
            create_executor(&factories, "urn:test", "decrement", &Attributes::new()),
            Err(EngineError::UnknownCustomAction { .. })
        ));
        assert!(matches!(
            create_executor(&factories, "urn:other", "increment", &Attributes::new()),
            Err(EngineError::UnknownCustomAction { .. })
        ));
    }
}
