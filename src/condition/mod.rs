//! Inclusion predicates for resources and module instances.
//!
//! A condition is a small, pure predicate over the bound parameters of the
//! node's scope. It is parsed when the blueprint loads and evaluated exactly once
//! during planning; an excluded node contributes neither apply actions nor
//! outputs.
//!
//! Supported forms:
//!
//! | Expression | Included when |
//! |---|---|
//! | `deployOpenAI` | the parameter is truthy |
//! | `!deployOpenAI` | the parameter is falsy |
//! | `empty(openaiEndpoint)` | the parameter is absent, null or empty |
//! | `!empty(openaiEndpoint)` | the parameter has a non-empty value |
//! | `environment == 'prod'` | the parameter equals the literal |
//! | `environment != 'prod'` | the parameter differs from the literal |
//!
//! Literals are `true`, `false`, numbers and single- or double-quoted strings.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::core::{StackError, Value};
use crate::params::ResolvedParams;

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    expression: String,
    predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Constant(bool),
    Truthy {
        param: String,
        negated: bool,
    },
    Empty {
        param: String,
        negated: bool,
    },
    Equals {
        param: String,
        literal: Value,
        negated: bool,
    },
}

impl Condition {
    /// Parse an expression.
    pub fn parse(expression: &str) -> Result<Self, StackError> {
        let trimmed = expression.trim();
        let invalid = |reason: &str| StackError::InvalidCondition {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("expression is empty"));
        }

        let predicate = if let Some((lhs, rhs, negated)) = split_comparison(trimmed) {
            let param = parse_identifier(lhs).ok_or_else(|| invalid("left side must be a parameter name"))?;
            let literal = parse_literal(rhs).ok_or_else(|| {
                invalid("right side must be true, false, a number or a quoted string")
            })?;
            Predicate::Equals {
                param,
                literal,
                negated,
            }
        } else {
            let (body, negated) = match trimmed.strip_prefix('!') {
                Some(rest) => (rest.trim(), true),
                None => (trimmed, false),
            };
            if let Some(inner) = body.strip_prefix("empty(").and_then(|s| s.strip_suffix(')')) {
                let param = parse_identifier(inner)
                    .ok_or_else(|| invalid("empty(...) takes a single parameter name"))?;
                Predicate::Empty {
                    param,
                    negated,
                }
            } else if body == "true" || body == "false" {
                Predicate::Constant((body == "true") != negated)
            } else {
                let param = parse_identifier(body).ok_or_else(|| {
                    invalid("expected a parameter name, empty(name) or a comparison")
                })?;
                Predicate::Truthy {
                    param,
                    negated,
                }
            }
        };

        Ok(Self {
            expression: trimmed.to_string(),
            predicate,
        })
    }

    /// Original expression text.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Parameter the condition reads, if any.
    #[must_use]
    pub fn parameter(&self) -> Option<&str> {
        match &self.predicate {
            Predicate::Constant(_) => None,
            Predicate::Truthy {
                param,
                ..
            }
            | Predicate::Empty {
                param,
                ..
            }
            | Predicate::Equals {
                param,
                ..
            } => Some(param),
        }
    }

    /// Evaluate against bound parameters.
    ///
    /// `NonStaticCondition` is returned with the scope as the node; callers
    /// replace it with the node id they are evaluating.
    pub fn evaluate(&self, params: &ResolvedParams) -> Result<bool, StackError> {
        let Some(name) = self.parameter() else {
            return Ok(matches!(self.predicate, Predicate::Constant(true)));
        };

        let value = match params.get(name) {
            Some(value) => value,
            None if params.is_absent(name) => &Value::Null,
            None => {
                return Err(StackError::InvalidCondition {
                    expression: self.expression.clone(),
                    reason: format!("parameter '{name}' is not declared in scope '{}'", params.scope()),
                });
            }
        };

        if value.is_deferred() {
            return Err(StackError::NonStaticCondition {
                node: params.scope().to_string(),
                parameter: name.to_string(),
            });
        }

        Ok(match &self.predicate {
            Predicate::Constant(b) => *b,
            Predicate::Truthy {
                negated,
                ..
            } => value.is_truthy() != *negated,
            Predicate::Empty {
                negated,
                ..
            } => value.is_empty_value() != *negated,
            Predicate::Equals {
                literal,
                negated,
                ..
            } => literal_matches(value, literal) != *negated,
        })
    }
}

/// Decide whether a node is part of the plan. No condition means included.
pub fn should_include(
    condition: Option<&Condition>,
    params: &ResolvedParams,
) -> Result<bool, StackError> {
    condition.map_or(Ok(true), |c| c.evaluate(params))
}

fn literal_matches(value: &Value, literal: &Value) -> bool {
    let value = match value {
        Value::Secret(inner) => inner.as_ref(),
        other => other,
    };
    match (value, literal) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(s), Value::Bool(b)) => s.eq_ignore_ascii_case(&b.to_string()),
        (Value::String(s), Value::Number(n)) => *s == n.to_string(),
        (Value::Null, Value::Bool(false)) => true,
        _ => value == literal,
    }
}

/// Splits on the first `==` or `!=` outside a quoted literal.
fn split_comparison(expr: &str) -> Option<(&str, &str, bool)> {
    let bytes = expr.as_bytes();
    let mut quote = None;
    for (i, &byte) in bytes.iter().enumerate() {
        match quote {
            Some(open) if byte == open => quote = None,
            Some(_) => {}
            None if byte == b'\'' || byte == b'"' => quote = Some(byte),
            None if (byte == b'=' || byte == b'!') && bytes.get(i + 1) == Some(&b'=') => {
                return Some((expr[..i].trim(), expr[i + 2..].trim(), byte == b'!'));
            }
            None => {}
        }
    }
    None
}

fn parse_identifier(input: &str) -> Option<String> {
    let input = input.trim();
    let input = input.strip_prefix("params.").unwrap_or(input);
    let valid = !input.is_empty()
        && input.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && input.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    valid.then(|| input.to_string())
}

fn parse_literal(input: &str) -> Option<Value> {
    match input {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }
    for quote in ['\'', '"'] {
        if let Some(inner) = input.strip_prefix(quote).and_then(|s| s.strip_suffix(quote)) {
            return Some(Value::string(inner));
        }
    }
    if let Ok(n) = input.parse::<i64>() {
        return Some(Value::from(n));
    }
    input
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.expression)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
