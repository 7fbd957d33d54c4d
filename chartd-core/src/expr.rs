//! Built-in expression language.
//!
//! Supports:
//! - Literals: numbers, `"strings"` or `'strings'`, `true`, `false`, `null`, `undefined`
//! - Locations: `count`, `order.items[0].price`, `_event.data.amount`
//! - Comparisons: `==`, `!=`, `>`, `>=`, `<`, `<=`
//! - Arithmetic: `+` (numbers, or string concatenation), `-`
//! - Logical: `&&`, `||`, `!`, parentheses
//! - State test: `In('state_id')`

use crate::accessor::{Path, PathSegment, Selector};
use crate::error::CoreError;
use crate::value::Value;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A parsed expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Location(Path),
    In(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
}

/// What an expression can see while evaluating.
pub trait EvalContext {
    /// Top-level variable lookup; `Undefined` when absent.
    fn variable(&self, name: &str) -> Value;

    fn in_state(&self, state_id: &str) -> bool;
}

impl Expr {
    /// Parses an expression string.
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(invalid("empty expression"));
        }

        let mut parser = Parser::new(input);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < input.len() {
            return Err(invalid(format!(
                "unexpected input at position {}: '{}'",
                parser.pos,
                &input[parser.pos..]
            )));
        }
        Ok(expr)
    }

    /// The location if this expression is a plain location path.
    pub fn as_location(&self) -> Option<&Path> {
        match self {
            Expr::Location(path) => Some(path),
            _ => None,
        }
    }

    pub fn evaluate(&self, ctx: &dyn EvalContext) -> Result<Value, CoreError> {
        Ok(match self {
            Expr::Literal(v) => v.clone(),
            Expr::Location(path) => resolve(path, ctx),
            Expr::In(state) => Value::Boolean(ctx.in_state(state)),
            Expr::Not(inner) => Value::Boolean(!inner.evaluate(ctx)?.is_truthy()),
            Expr::And(a, b) => {
                Value::Boolean(a.evaluate(ctx)?.is_truthy() && b.evaluate(ctx)?.is_truthy())
            }
            Expr::Or(a, b) => {
                Value::Boolean(a.evaluate(ctx)?.is_truthy() || b.evaluate(ctx)?.is_truthy())
            }
            Expr::Compare(op, a, b) => {
                Value::Boolean(compare(*op, &a.evaluate(ctx)?, &b.evaluate(ctx)?))
            }
            Expr::Add(a, b) => add(a.evaluate(ctx)?, b.evaluate(ctx)?)?,
            Expr::Sub(a, b) => {
                let (a, b) = (a.evaluate(ctx)?, b.evaluate(ctx)?);
                match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => Value::Number(x - y),
                    _ => {
                        return Err(CoreError::Evaluation {
                            reason: format!(
                                "cannot subtract {} from {}",
                                b.kind().as_str(),
                                a.kind().as_str()
                            ),
                        })
                    }
                }
            }
        })
    }

    pub fn evaluate_bool(&self, ctx: &dyn EvalContext) -> Result<bool, CoreError> {
        Ok(self.evaluate(ctx)?.is_truthy())
    }
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidExpression {
        reason: reason.into(),
    }
}

fn resolve(path: &Path, ctx: &dyn EvalContext) -> Value {
    let Some(root) = path.root() else {
        return Value::Undefined;
    };
    let top = ctx.variable(root);
    let rest = &path.segments()[1..];
    if rest.is_empty() {
        return top;
    }
    let mut current = top;
    for segment in rest {
        current = match segment {
            PathSegment::Key(k) => current.accessor().get(Selector::Key(k)),
            PathSegment::Index(i) => current.accessor().get(Selector::Index(*i)),
        };
        if current.is_undefined() {
            break;
        }
    }
    current
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => (a - b).abs() < f64::EPSILON,
        _ => a == b,
    }
}

fn compare(op: CompareOp, a: &Value, b: &Value) -> bool {
    use std::cmp::Ordering;

    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        _ => None,
    };
    match op {
        CompareOp::Eq => values_equal(a, b),
        CompareOp::Ne => !values_equal(a, b),
        CompareOp::Gt => ordering == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lt => ordering == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
    }
}

fn add(a: Value, b: Value) -> Result<Value, CoreError> {
    match (&a, &b) {
        (Value::Number(x), Value::Number(y)) => Ok(Value::Number(x + y)),
        (Value::String(_), _) | (_, Value::String(_)) => Ok(Value::String(format!("{}{}", a, b))),
        _ => Err(CoreError::Evaluation {
            reason: format!("cannot add {} and {}", a.kind().as_str(), b.kind().as_str()),
        }),
    }
}

/// Recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, CoreError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, CoreError> {
        let left = self.parse_additive()?;
        self.skip_whitespace();

        let op = if self.peek_str("==") {
            Some((CompareOp::Eq, 2))
        } else if self.peek_str("!=") {
            Some((CompareOp::Ne, 2))
        } else if self.peek_str(">=") {
            Some((CompareOp::Ge, 2))
        } else if self.peek_str("<=") {
            Some((CompareOp::Le, 2))
        } else if self.peek_char() == Some('>') {
            Some((CompareOp::Gt, 1))
        } else if self.peek_char() == Some('<') {
            Some((CompareOp::Lt, 1))
        } else {
            None
        };

        match op {
            Some((op, width)) => {
                self.pos += width;
                let right = self.parse_additive()?;
                Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_primary()?;
        loop {
            self.skip_whitespace();
            match self.peek_char() {
                Some('+') => {
                    self.pos += 1;
                    let right = self.parse_primary()?;
                    left = Expr::Add(Box::new(left), Box::new(right));
                }
                Some('-') => {
                    self.pos += 1;
                    let right = self.parse_primary()?;
                    left = Expr::Sub(Box::new(left), Box::new(right));
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();

        match self.peek_char() {
            None => Err(invalid("unexpected end of expression")),
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.skip_whitespace();
                if self.peek_char() != Some(')') {
                    return Err(invalid("expected ')'"));
                }
                self.pos += 1;
                Ok(expr)
            }
            Some('"') | Some('\'') => Ok(Expr::Literal(Value::String(self.parse_string()?))),
            Some(c) if c.is_ascii_digit() || c == '-' => {
                Ok(Expr::Literal(Value::Number(self.parse_number()?)))
            }
            Some(c) if c.is_alphabetic() || c == '_' || c == '$' => self.parse_word(),
            Some(c) => Err(invalid(format!("unexpected character '{}'", c))),
        }
    }

    fn parse_word(&mut self) -> Result<Expr, CoreError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '$' || c == '.' || c == '[' || c == ']' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        let word = &self.input[start..self.pos];

        match word {
            "true" => return Ok(Expr::Literal(Value::Boolean(true))),
            "false" => return Ok(Expr::Literal(Value::Boolean(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            "undefined" => return Ok(Expr::Literal(Value::Undefined)),
            "In" => {
                self.skip_whitespace();
                if self.peek_char() != Some('(') {
                    return Err(invalid("expected '(' after In"));
                }
                self.pos += 1;
                self.skip_whitespace();
                let state = self.parse_string()?;
                self.skip_whitespace();
                if self.peek_char() != Some(')') {
                    return Err(invalid("expected ')' after In argument"));
                }
                self.pos += 1;
                return Ok(Expr::In(state));
            }
            _ => {}
        }

        Ok(Expr::Location(Path::parse(word)?))
    }

    fn parse_string(&mut self) -> Result<String, CoreError> {
        let quote = match self.peek_char() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(invalid("expected string")),
        };
        self.pos += 1;

        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(out);
            }
            if c == '\\' {
                if let Some(escaped) = self.peek_char() {
                    self.pos += escaped.len_utf8();
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
            } else {
                out.push(c);
            }
        }

        Err(invalid("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<f64, CoreError> {
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }

        if self.peek_char() == Some('.') {
            self.pos += 1;
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let num_str = &self.input[start..self.pos];
        num_str
            .parse::<f64>()
            .map_err(|_| invalid(format!("invalid number: '{}'", num_str)))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Ctx {
        vars: Value,
        active: Vec<&'static str>,
    }

    impl Ctx {
        fn new(json: serde_json::Value) -> Self {
            Self {
                vars: Value::from_json(&json),
                active: vec!["running"],
            }
        }
    }

    impl EvalContext for Ctx {
        fn variable(&self, name: &str) -> Value {
            self.vars.as_map().map(|m| m.get(name)).unwrap_or_default()
        }

        fn in_state(&self, state_id: &str) -> bool {
            self.active.contains(&state_id)
        }
    }

    fn eval(expr: &str, json: serde_json::Value) -> Value {
        Expr::parse(expr).unwrap().evaluate(&Ctx::new(json)).unwrap()
    }

    fn check(expr: &str, json: serde_json::Value) -> bool {
        eval(expr, json).is_truthy()
    }

    #[test]
    fn test_truthy_location() {
        assert!(check("enabled", json!({"enabled": true})));
        assert!(!check("enabled", json!({"enabled": false})));
        assert!(!check("enabled", json!({})));
    }

    #[test]
    fn test_equality() {
        assert!(check("status == \"active\"", json!({"status": "active"})));
        assert!(check("status != 'inactive'", json!({"status": "active"})));
        assert!(check("count == 42", json!({"count": 42})));
        assert!(check("value == null", json!({"value": null})));
        assert!(check("missing == undefined", json!({})));
    }

    #[test]
    fn test_numeric_comparison() {
        assert!(check("amount > 100", json!({"amount": 150})));
        assert!(!check("amount > 100", json!({"amount": 100})));
        assert!(check("amount >= 100", json!({"amount": 100})));
        assert!(check("temp > -10", json!({"temp": 0})));
        assert!(check("rate <= 0.5", json!({"rate": 0.5})));
        assert!(!check("value > 10", json!({"value": "not a number"})));
    }

    #[test]
    fn test_logic_and_precedence() {
        assert!(check("a && b || c", json!({"a": false, "b": false, "c": true})));
        assert!(!check("(a || b) && c", json!({"a": true, "b": true, "c": false})));
        assert!(check("!(a && b)", json!({"a": true, "b": false})));
        assert!(check("!!a", json!({"a": 1})));
    }

    #[test]
    fn test_nested_and_indexed_locations() {
        let data = json!({"order": {"items": [{"price": 5}, {"price": 7}]}});
        assert_eq!(eval("order.items[1].price", data.clone()), Value::from(7.0));
        assert!(eval("order.items[9].price", data).is_undefined());
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("count + 1", json!({"count": 2})), Value::from(3.0));
        assert_eq!(eval("count - 1 - 1", json!({"count": 2})), Value::from(0.0));
        assert_eq!(eval("'n=' + count", json!({"count": 2})), Value::from("n=2"));
        let err = Expr::parse("a - b")
            .unwrap()
            .evaluate(&Ctx::new(json!({"a": 1, "b": "x"})));
        assert!(matches!(err, Err(CoreError::Evaluation { .. })));
    }

    #[test]
    fn test_in_predicate() {
        assert!(check("In('running')", json!({})));
        assert!(!check("In(\"stopped\")", json!({})));
        assert!(check("In('running') && x == 1", json!({"x": 1})));
    }

    #[test]
    fn test_as_location() {
        assert!(Expr::parse("a.b").unwrap().as_location().is_some());
        assert!(Expr::parse("a + 1").unwrap().as_location().is_none());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("   ").is_err());
        assert!(Expr::parse("(a && b").is_err());
        assert!(Expr::parse("name == \"unclosed").is_err());
        assert!(Expr::parse("a ==").is_err());
        assert!(Expr::parse("a b").is_err());
        assert!(Expr::parse("In(state)").is_err());
        assert!(Expr::parse("#").is_err());
    }
}
