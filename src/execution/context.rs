//! Execution Context
//!
//! The growing document of inputs and accumulated step results for a run.
//!
//! A context is either a root context, created once per run from the
//! initial input, or a derived context created for a single map element.
//! Derived contexts read through to their parent and write only to their
//! own overlay, so concurrent map branches never share mutable state.
//!
//! Documents are held behind an [`Arc`] and copied on write, which makes
//! freezing a context for a map stage a pointer copy rather than a deep
//! clone.

use std::borrow::Cow;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::PathError;
use crate::workflow::path::{ContextPath, Segment};

/// Execution context for one run (or one map element of a run).
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    parent: Option<Arc<ExecutionContext>>,
    document: Arc<Value>,
    version: u64,
}

impl ExecutionContext {
    /// Creates a root context from an initial input document.
    ///
    /// A `null` input starts from an empty mapping.
    pub fn new(input: Value) -> Self {
        let document = if input.is_null() {
            Value::Object(Map::new())
        } else {
            input
        };

        Self {
            parent: None,
            document: Arc::new(document),
            version: 0,
        }
    }

    /// Creates a derived context reading through to `parent`.
    ///
    /// `overlay` holds the bindings injected for the element; it shadows
    /// parent keys with the same name.
    pub fn derived(parent: Arc<ExecutionContext>, overlay: Value) -> Self {
        let version = parent.version;
        Self {
            parent: Some(parent),
            document: Arc::new(overlay),
            version,
        }
    }

    /// Shallow copy suitable for sharing with concurrent readers.
    pub fn freeze(&self) -> Arc<ExecutionContext> {
        Arc::new(self.clone())
    }

    /// Number of successful writes applied so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Reads the value at `path`.
    ///
    /// Fails with [`PathError::NotFound`] when the path does not resolve.
    pub fn get(&self, path: &ContextPath) -> Result<Cow<'_, Value>, PathError> {
        if path.is_root() {
            return Ok(match self.parent {
                None => Cow::Borrowed(self.document.as_ref()),
                Some(_) => Cow::Owned(self.snapshot()),
            });
        }
        self.resolve(path).map(Cow::Borrowed)
    }

    /// Reads an array at `path`.
    pub fn slice(&self, path: &ContextPath) -> Result<Vec<Value>, PathError> {
        match self.get(path)?.into_owned() {
            Value::Array(items) => Ok(items),
            other => Err(PathError::NotASequence {
                path: path.to_string(),
                found: type_name(&other),
            }),
        }
    }

    /// Writes `value` at `path`, replacing whatever was there.
    ///
    /// Intermediate mappings are created as needed. A failed write leaves
    /// the context untouched.
    pub fn set(&mut self, path: &ContextPath, value: Value) -> Result<(), PathError> {
        if path.is_root() {
            self.document = Arc::new(value);
            self.version += 1;
            return Ok(());
        }

        let inherited = self.inherited_subtree(path);
        check_write(&self.document, path, inherited.as_ref().map(|(_, subtree)| subtree))?;
        let document = Arc::make_mut(&mut self.document);

        if let Some((key, subtree)) = inherited {
            if let Some(map) = document.as_object_mut() {
                map.insert(key, subtree);
            }
        }

        write_at(document, path, value)?;
        self.version += 1;
        Ok(())
    }

    /// Materializes the full view: parent state with this overlay on top.
    pub fn snapshot(&self) -> Value {
        let Some(parent) = &self.parent else {
            return self.document.as_ref().clone();
        };

        match (parent.snapshot(), self.document.as_ref()) {
            (Value::Object(mut base), Value::Object(overlay)) => {
                for (key, value) in overlay {
                    base.insert(key.clone(), value.clone());
                }
                Value::Object(base)
            }
            (_, overlay) => overlay.clone(),
        }
    }

    fn resolve(&self, path: &ContextPath) -> Result<&Value, PathError> {
        let local = match (path.head_key(), self.document.as_ref()) {
            (Some(key), Value::Object(map)) => map.contains_key(key),
            (None, _) => true,
            _ => false,
        };

        if local || self.parent.is_none() {
            return value_at(&self.document, path);
        }

        match &self.parent {
            Some(parent) => parent.resolve(path),
            None => Err(PathError::NotFound(path.to_string())),
        }
    }

    /// For a nested write whose head key only exists in the parent, returns
    /// that subtree so the overlay keeps its siblings.
    fn inherited_subtree(&self, path: &ContextPath) -> Option<(String, Value)> {
        let parent = self.parent.as_ref()?;
        if path.segments().len() < 2 {
            return None;
        }

        let key = path.head_key()?;
        if let Value::Object(map) = self.document.as_ref() {
            if map.contains_key(key) {
                return None;
            }
        }

        parent
            .resolve(&ContextPath::root().child(key))
            .ok()
            .map(|value| (key.to_string(), value.clone()))
    }
}

/// Resolves `path` inside a plain JSON value.
pub fn value_at<'a>(root: &'a Value, path: &ContextPath) -> Result<&'a Value, PathError> {
    let mut current = root;
    for segment in path.segments() {
        let next = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key),
            (Segment::Index(index), Value::Array(items)) => items.get(*index),
            _ => None,
        };
        current = next.ok_or_else(|| PathError::NotFound(path.to_string()))?;
    }
    Ok(current)
}

/// Walks `path` without mutating and fails where [`write_at`] would.
///
/// `inherited` stands in for the head key when a derived overlay is about
/// to copy it from the parent.
fn check_write(root: &Value, path: &ContextPath, inherited: Option<&Value>) -> Result<(), PathError> {
    let mut current = Some(root);

    for (depth, segment) in path.segments().iter().enumerate() {
        current = match (segment, current) {
            (Segment::Key(_), None | Some(Value::Null)) => None,
            (Segment::Key(key), Some(Value::Object(map))) => match (depth, inherited) {
                (0, Some(subtree)) if !map.contains_key(key) => Some(subtree),
                _ => map.get(key),
            },
            (Segment::Key(_), Some(_)) => {
                return Err(PathError::NotAMapping {
                    path: path.to_string(),
                    at: path.prefix(depth),
                })
            }
            (Segment::Index(index), Some(Value::Array(items))) if *index < items.len() => {
                items.get(*index)
            }
            (Segment::Index(_), _) => return Err(PathError::NotFound(path.prefix(depth + 1))),
        };
    }

    Ok(())
}

fn write_at(root: &mut Value, path: &ContextPath, value: Value) -> Result<(), PathError> {
    let segments = path.segments();
    let mut value = Some(value);
    let mut current = root;

    for (depth, segment) in segments.iter().enumerate() {
        let last = depth + 1 == segments.len();

        match segment {
            Segment::Key(key) => {
                if current.is_null() {
                    *current = Value::Object(Map::new());
                }
                let map = current.as_object_mut().ok_or_else(|| PathError::NotAMapping {
                    path: path.to_string(),
                    at: path.prefix(depth),
                })?;

                if last {
                    map.insert(key.clone(), value.take().unwrap_or(Value::Null));
                    return Ok(());
                }
                current = map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            Segment::Index(index) => {
                let slot = current
                    .as_array_mut()
                    .and_then(|items| items.get_mut(*index))
                    .ok_or_else(|| PathError::NotFound(path.prefix(depth + 1)))?;

                if last {
                    *slot = value.take().unwrap_or(Value::Null);
                    return Ok(());
                }
                current = slot;
            }
        }
    }

    Ok(())
}

/// Human-readable JSON type name, for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a mapping",
    }
}
