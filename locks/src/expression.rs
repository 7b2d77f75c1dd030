//! Key expressions evaluated against a call's named arguments.
//!
//! An expression starts with `#` and a parameter name, followed by any
//! number of `.field` and `[index]` steps:
//!
//! | Expression | Reads |
//! |---|---|
//! | `#show_id` | argument `show_id` |
//! | `#order.seat.row` | field `row` of field `seat` of argument `order` |
//! | `#order.seats[0]` | first element of `order.seats` |
//!
//! The value found must be a string, number or boolean. Anything else
//! (missing parameter, missing field, `null`, objects, arrays) is a
//! [`LockError::Configuration`].

use crate::error::{LockError, Result};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Named arguments of one call, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    params: Vec<(String, Value)>,
}

impl CallArgs {
    /// No arguments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument. A repeated name replaces the earlier value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name.into(), value.into());
        self
    }

    /// Add an argument by serializing `value`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Configuration`] if `value` cannot be represented
    /// as JSON.
    pub fn with_serialized<T: Serialize>(mut self, name: impl Into<String>, value: &T) -> Result<Self> {
        let name = name.into();
        let json = serde_json::to_value(value).map_err(|e| {
            LockError::configuration(format!("argument `{name}` is not serializable: {e}"))
        })?;
        self.insert(name, json);
        Ok(self)
    }

    /// Look up an argument.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.params.iter().find(|(param, _)| param == name).map(|(_, value)| value)
    }

    /// Parameter names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(name, _)| name.as_str())
    }

    fn insert(&mut self, name: String, value: Value) {
        match self.params.iter_mut().find(|(param, _)| *param == name) {
            Some(slot) => slot.1 = value,
            None => self.params.push((name, value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Field(String),
    Index(usize),
}

/// A parsed key expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExpression {
    source: String,
    param: String,
    steps: Vec<Step>,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl KeyExpression {
    /// Parse an expression.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Configuration`] on malformed input.
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            LockError::configuration(format!("invalid key expression `{source}`: {reason}"))
        };

        let rest = source.trim().strip_prefix('#').ok_or_else(|| invalid("must start with `#`"))?;
        let param_len = rest.find(|c: char| !is_ident_char(c)).unwrap_or(rest.len());
        if param_len == 0 {
            return Err(invalid("missing parameter name"));
        }
        let param = rest[..param_len].to_string();
        let mut rest = &rest[param_len..];
        let mut steps = Vec::new();

        while let Some(next) = rest.chars().next() {
            match next {
                '.' => {
                    let body = &rest[1..];
                    let len = body.find(|c: char| !is_ident_char(c)).unwrap_or(body.len());
                    if len == 0 {
                        return Err(invalid("empty field name"));
                    }
                    steps.push(Step::Field(body[..len].to_string()));
                    rest = &body[len..];
                }
                '[' => {
                    let close = rest.find(']').ok_or_else(|| invalid("unclosed `[`"))?;
                    let index = rest[1..close]
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| invalid("index must be a non-negative integer"))?;
                    steps.push(Step::Index(index));
                    rest = &rest[close + 1..];
                }
                other => return Err(invalid(&format!("unexpected character `{other}`"))),
            }
        }

        Ok(Self {
            source: source.trim().to_string(),
            param,
            steps,
        })
    }

    /// Parameter the expression starts from.
    #[must_use]
    pub fn param(&self) -> &str {
        &self.param
    }

    /// Evaluate against `args`, producing one key value.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Configuration`] if the value cannot be reached
    /// or is not a scalar.
    pub fn evaluate(&self, args: &CallArgs) -> Result<String> {
        let unresolved = |reason: String| {
            LockError::configuration(format!("key expression `{}` {reason}", self.source))
        };

        let mut value = args
            .get(&self.param)
            .ok_or_else(|| unresolved(format!("names unknown parameter `{}`", self.param)))?;

        for step in &self.steps {
            value = match step {
                Step::Field(field) => value
                    .get(field.as_str())
                    .ok_or_else(|| unresolved(format!("has no field `{field}`")))?,
                Step::Index(index) => value
                    .get(*index)
                    .ok_or_else(|| unresolved(format!("has no element [{index}]")))?,
            };
        }

        match value {
            Value::String(text) => Ok(text.clone()),
            Value::Number(number) => Ok(number.to_string()),
            Value::Bool(flag) => Ok(flag.to_string()),
            Value::Null => Err(unresolved("resolved to null".to_string())),
            Value::Array(_) | Value::Object(_) => {
                Err(unresolved("resolved to a composite value".to_string()))
            }
        }
    }
}

impl fmt::Display for KeyExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse and evaluate every expression in order.
///
/// # Errors
///
/// Returns the first parse or evaluation failure.
pub fn evaluate_all(expressions: &[String], args: &CallArgs) -> Result<Vec<String>> {
    expressions
        .iter()
        .map(|source| KeyExpression::parse(source)?.evaluate(args))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn booking_args() -> CallArgs {
        CallArgs::new()
            .with("show_id", 42)
            .with("vip", true)
            .with(
                "order",
                json!({
                    "client": "c-7",
                    "seats": [{"row": "A", "number": 1}, {"row": "B", "number": 9}],
                    "coupon": null,
                }),
            )
    }

    #[test]
    fn test_scalar_parameters() {
        let args = booking_args();
        assert_eq!(KeyExpression::parse("#show_id").unwrap().evaluate(&args).unwrap(), "42");
        assert_eq!(KeyExpression::parse("#vip").unwrap().evaluate(&args).unwrap(), "true");
    }

    #[test]
    fn test_nested_fields_and_indexes() {
        let args = booking_args();
        let expr = KeyExpression::parse("#order.seats[1].row").unwrap();
        assert_eq!(expr.evaluate(&args).unwrap(), "B");
        assert_eq!(expr.param(), "order");
        assert_eq!(
            evaluate_all(&["#order.client".into(), "#order.seats[0].number".into()], &args)
                .unwrap(),
            vec!["c-7".to_string(), "1".to_string()]
        );
    }

    #[test]
    fn test_unresolvable_expressions_are_configuration_errors() {
        let args = booking_args();
        for source in [
            "#missing",
            "#order.unknown",
            "#order.seats[5]",
            "#order.coupon",
            "#order.seats",
            "#order",
        ] {
            let err = KeyExpression::parse(source).unwrap().evaluate(&args).unwrap_err();
            assert!(matches!(err, LockError::Configuration(_)), "{source}: {err}");
        }
    }

    #[test]
    fn test_malformed_expressions() {
        for source in ["show_id", "#", "#order.", "#order[x]", "#order[0", "#order-x"] {
            assert!(KeyExpression::parse(source).is_err(), "{source}");
        }
    }

    #[test]
    fn test_serialized_arguments() {
        #[derive(Serialize)]
        struct Seat {
            row: char,
            number: u32,
        }

        let args = CallArgs::new()
            .with_serialized("seat", &Seat { row: 'C', number: 12 })
            .unwrap()
            .with("seat", json!({"row": "D", "number": 3}));
        assert_eq!(evaluate_all(&["#seat.row".into()], &args).unwrap(), vec!["D"]);
        assert_eq!(args.names().collect::<Vec<_>>(), vec!["seat"]);
    }
}
