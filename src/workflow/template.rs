//! Parameter Projection Templates
//!
//! A template maps output field names to either literal values or
//! expressions resolved at run time. Nested mappings and arrays are
//! evaluated recursively.
//!
//! # Expressions
//!
//! | Expression      | Resolves to                               |
//! |-----------------|-------------------------------------------|
//! | `$`, `$.path`   | a value from the current execution context |
//! | `$item[.path]`  | the current map element (map steps only)   |
//! | `$index`        | the current map element index (map only)   |
//! | `$run_id`       | the identifier of the current run          |
//! | `$$text`        | the literal string `$text`                 |
//!
//! # Example YAML
//!
//! ```yaml
//! parameters:
//!   repository: $item
//!   jobId: $.jobId
//!   model: claude
//!   limits:
//!     max_tokens: 4096
//! ```

use std::borrow::Cow;

use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::PathError;
use crate::execution::context::{value_at, ExecutionContext};
use crate::workflow::path::ContextPath;

/// A parameter projection template.
pub type Template = IndexMap<String, Value>;

/// A parsed template string value.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Value),
    Context(ContextPath),
    Item(ContextPath),
    Index,
    RunId,
}

impl Expression {
    /// Parses a string template value.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if let Some(escaped) = raw.strip_prefix("$$") {
            return Ok(Self::Literal(Value::String(format!("${}", escaped))));
        }
        if !raw.starts_with('$') {
            return Ok(Self::Literal(Value::String(raw.to_string())));
        }

        if raw == "$index" {
            return Ok(Self::Index);
        }
        if raw == "$run_id" {
            return Ok(Self::RunId);
        }
        if let Some(rest) = raw.strip_prefix("$item") {
            if rest.is_empty() || rest.starts_with('.') || rest.starts_with('[') {
                let relative = format!("${}", rest);
                return ContextPath::parse(&relative).map(Self::Item);
            }
        }
        if raw == "$" || raw.starts_with("$.") || raw.starts_with("$[") {
            return ContextPath::parse(raw).map(Self::Context);
        }

        Err(PathError::Invalid {
            path: raw.to_string(),
            reason: "unknown expression; expected $, $.path, $item, $index or $run_id".to_string(),
        })
    }

    /// True for expressions that only make sense inside a map step.
    pub fn needs_element(&self) -> bool {
        matches!(self, Self::Item(_) | Self::Index)
    }
}

/// Element binding available while projecting map parameters.
#[derive(Debug, Clone, Copy)]
pub struct ElementBinding<'a> {
    pub index: usize,
    pub item: &'a Value,
}

/// Inputs for evaluating a template.
pub struct Scope<'a> {
    pub context: &'a ExecutionContext,
    pub run_id: &'a str,
    pub element: Option<ElementBinding<'a>>,
}

/// Evaluates a template into a JSON mapping.
pub fn evaluate(template: &Template, scope: &Scope<'_>) -> Result<Value, PathError> {
    let mut out = Map::with_capacity(template.len());
    for (key, value) in template {
        out.insert(key.clone(), evaluate_value(value, scope)?);
    }
    Ok(Value::Object(out))
}

fn evaluate_value(value: &Value, scope: &Scope<'_>) -> Result<Value, PathError> {
    match value {
        Value::String(raw) => resolve(&Expression::parse(raw)?, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate_value(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                out.insert(key.clone(), evaluate_value(inner, scope)?);
            }
            Ok(Value::Object(out))
        }
        literal => Ok(literal.clone()),
    }
}

fn resolve(expression: &Expression, scope: &Scope<'_>) -> Result<Value, PathError> {
    match expression {
        Expression::Literal(value) => Ok(value.clone()),
        Expression::Context(path) => scope.context.get(path).map(Cow::into_owned),
        Expression::RunId => Ok(Value::String(scope.run_id.to_string())),
        Expression::Index => scope
            .element
            .map(|element| Value::from(element.index))
            .ok_or_else(|| PathError::NotFound("$index".to_string())),
        Expression::Item(path) => {
            let element = scope
                .element
                .ok_or_else(|| PathError::NotFound("$item".to_string()))?;
            value_at(element.item, path)
                .cloned()
                .map_err(|_| {
                    PathError::NotFound(format!("$item{}", path.as_str().trim_start_matches('$')))
                })
        }
    }
}

/// Walks every expression in a template, for load-time validation.
pub fn expressions(template: &Template) -> Vec<(String, Result<Expression, PathError>)> {
    let mut found = Vec::new();
    for (key, value) in template {
        collect(key, value, &mut found);
    }
    found
}

fn collect(key: &str, value: &Value, found: &mut Vec<(String, Result<Expression, PathError>)>) {
    match value {
        Value::String(raw) => found.push((key.to_string(), Expression::parse(raw))),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                collect(&format!("{}[{}]", key, i), item, found);
            }
        }
        Value::Object(map) => {
            for (inner_key, inner) in map {
                collect(&format!("{}.{}", key, inner_key), inner, found);
            }
        }
        _ => {}
    }
}
