//! Data-model handlers.
//!
//! A chart names its data model (`"datamodel": "runtime"`). The interpreter
//! asks the registered [`DataModelHandlerFactory`] instances for a handler
//! that accepts the name and delegates every condition, value expression,
//! assignment and script to it.

use crate::error::EngineError;
use chartd_core::{Chart, CoreError, EvalContext, Expr, Map, OrderedSet, Path, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// What a handler can see while evaluating: the session's data model and
/// active configuration.
pub struct Scope<'a> {
    pub data: &'a Map,
    pub chart: &'a Chart,
    pub configuration: &'a OrderedSet,
}

impl<'a> Scope<'a> {
    pub fn new(data: &'a Map, chart: &'a Chart, configuration: &'a OrderedSet) -> Self {
        Self {
            data,
            chart,
            configuration,
        }
    }
}

impl EvalContext for Scope<'_> {
    fn variable(&self, name: &str) -> Value {
        self.data.get(name)
    }

    fn in_state(&self, state_id: &str) -> bool {
        self.chart
            .lookup(state_id)
            .is_some_and(|doc| self.configuration.contains(doc))
    }
}

pub trait DataModelHandler: Send + Sync {
    /// Data model name, for logs.
    fn name(&self) -> &str;

    fn evaluate_value(&self, expr: &str, scope: &Scope<'_>) -> Result<Value, CoreError>;

    fn evaluate_bool(&self, expr: &str, scope: &Scope<'_>) -> Result<bool, CoreError>;

    /// Writes `value` at `location`.
    fn assign(&self, location: &str, value: Value, scope: &Scope<'_>) -> Result<(), CoreError>;

    fn execute_script(&self, source: &str, scope: &Scope<'_>) -> Result<(), CoreError>;
}

pub trait DataModelHandlerFactory: Send + Sync {
    fn can_handle(&self, datamodel: &str) -> bool;

    fn create(
        &self,
        datamodel: &str,
        configuration: &HashMap<String, String>,
    ) -> Result<Arc<dyn DataModelHandler>, EngineError>;
}

/// Picks the first factory accepting `datamodel`, falling back to the
/// built-in handlers.
pub fn create_handler(
    factories: &[Arc<dyn DataModelHandlerFactory>],
    datamodel: &str,
    configuration: &HashMap<String, String>,
) -> Result<Arc<dyn DataModelHandler>, EngineError> {
    for factory in factories {
        if factory.can_handle(datamodel) {
            return factory.create(datamodel, configuration);
        }
    }
    match datamodel {
        RuntimeDataModelHandler::NAME => Ok(Arc::new(RuntimeDataModelHandler::new())),
        NullDataModelHandler::NAME => Ok(Arc::new(NullDataModelHandler)),
        other => Err(EngineError::UnknownDataModel {
            datamodel: other.to_string(),
        }),
    }
}

/// Handler for the built-in expression language.
///
/// Scripts are sequences of `location = expression` statements separated by
/// `;` or newlines.
#[derive(Default)]
pub struct RuntimeDataModelHandler {
    cache: Mutex<HashMap<String, Arc<Expr>>>,
}

impl RuntimeDataModelHandler {
    pub const NAME: &'static str = "runtime";

    pub fn new() -> Self {
        Self::default()
    }

    fn parse(&self, expr: &str) -> Result<Arc<Expr>, CoreError> {
        if let Some(parsed) = self.cache.lock().get(expr) {
            return Ok(parsed.clone());
        }
        let parsed = Arc::new(Expr::parse(expr)?);
        self.cache.lock().insert(expr.to_string(), parsed.clone());
        Ok(parsed)
    }
}

impl DataModelHandler for RuntimeDataModelHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate_value(&self, expr: &str, scope: &Scope<'_>) -> Result<Value, CoreError> {
        self.parse(expr)?.evaluate(scope)
    }

    fn evaluate_bool(&self, expr: &str, scope: &Scope<'_>) -> Result<bool, CoreError> {
        self.parse(expr)?.evaluate_bool(scope)
    }

    fn assign(&self, location: &str, value: Value, scope: &Scope<'_>) -> Result<(), CoreError> {
        let path = Path::parse(location)?;
        path.assign(&Value::Map(scope.data.clone()), value)
    }

    fn execute_script(&self, source: &str, scope: &Scope<'_>) -> Result<(), CoreError> {
        for statement in source.split([';', '\n']) {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            let (location, expr) = split_assignment(statement).ok_or_else(|| {
                CoreError::UnsupportedExpression {
                    expression: statement.to_string(),
                }
            })?;
            let value = self.evaluate_value(expr, scope)?;
            self.assign(location, value, scope)?;
        }
        Ok(())
    }
}

// Splits `a.b = expr` at the first lone `=`.
fn split_assignment(statement: &str) -> Option<(&str, &str)> {
    let bytes = statement.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b != b'=' {
            continue;
        }
        let prev = i.checked_sub(1).map(|p| bytes[p]);
        let next = bytes.get(i + 1).copied();
        if matches!(prev, Some(b'=' | b'!' | b'<' | b'>')) || next == Some(b'=') {
            return None;
        }
        let location = statement[..i].trim();
        let expr = statement[i + 1..].trim();
        if location.is_empty() || expr.is_empty() {
            return None;
        }
        return Some((location, expr));
    }
    None
}

/// The `null` data model: no data, only `In('state')` conditions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDataModelHandler;

impl NullDataModelHandler {
    pub const NAME: &'static str = "null";
}

impl DataModelHandler for NullDataModelHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate_value(&self, expr: &str, _scope: &Scope<'_>) -> Result<Value, CoreError> {
        Err(CoreError::UnsupportedExpression {
            expression: expr.to_string(),
        })
    }

    fn evaluate_bool(&self, expr: &str, scope: &Scope<'_>) -> Result<bool, CoreError> {
        match Expr::parse(expr) {
            Ok(Expr::In(state)) => Ok(scope.in_state(&state)),
            _ => Err(CoreError::UnsupportedExpression {
                expression: expr.to_string(),
            }),
        }
    }

    fn assign(&self, location: &str, _value: Value, _scope: &Scope<'_>) -> Result<(), CoreError> {
        Err(CoreError::UnsupportedExpression {
            expression: location.to_string(),
        })
    }

    fn execute_script(&self, source: &str, _scope: &Scope<'_>) -> Result<(), CoreError> {
        Err(CoreError::UnsupportedExpression {
            expression: source.to_string(),
        })
    }
}
