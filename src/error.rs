//! Error Taxonomy
//!
//! Every failure the engine can produce falls into one of these types:
//!
//! - [`ConfigurationError`]: malformed workflow definition, raised at load time
//! - [`PathError`]: a context path could not be read or written
//! - [`InvocationError`]: an external task call failed
//! - [`StepError`]: a step failed while a run was executing
//!
//! [`ErrorKind`] is the coarse classification exposed on failed runs.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a failure, as reported on a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ConfigurationError,
    PathError,
    InvocationError,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConfigurationError => "ConfigurationError",
            Self::PathError => "PathError",
            Self::InvocationError => "InvocationError",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Malformed workflow definitions. Fatal to process start, never per-run.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to read workflow file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse workflow document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("graph has no steps")]
    EmptyGraph,

    #[error("graph has no start step")]
    MissingStart,

    #[error("start step '{0}' is not defined")]
    UnknownStart(String),

    #[error("step '{step}' transitions to unknown step '{next}'")]
    UnknownNext { step: String, next: String },

    #[error("steps form a cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("step '{0}' has no resource reference")]
    MissingResource(String),

    #[error("step '{step}': invalid path '{path}': {reason}")]
    InvalidPath {
        step: String,
        path: String,
        reason: String,
    },

    #[error("step '{step}': invalid parameter '{key}': {reason}")]
    InvalidTemplate {
        step: String,
        key: String,
        reason: String,
    },

    #[error("in iterator of map step '{step}': {source}")]
    Iterator {
        step: String,
        #[source]
        source: Box<ConfigurationError>,
    },
}

/// Failures to resolve or write a context path.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PathError {
    #[error("path '{0}' not found in execution context")]
    NotFound(String),

    #[error("path '{path}' resolved to {found}, expected an array")]
    NotASequence { path: String, found: &'static str },

    #[error("cannot write '{path}': '{at}' is not a mapping")]
    NotAMapping { path: String, at: String },

    #[error("invalid path '{path}': {reason}")]
    Invalid { path: String, reason: String },
}

/// An external unit of work failed. Carries the resource reference and cause.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("invocation of '{resource}' failed: {cause}")]
pub struct InvocationError {
    pub resource: String,
    pub cause: String,
}

impl InvocationError {
    pub fn new(resource: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self {
            resource: resource.into(),
            cause: cause.to_string(),
        }
    }
}

/// A step failure during a run.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// One element of a map step failed; `step` is the failing inner step.
    #[error("element {index} failed at step '{step}': {source}")]
    Element {
        index: usize,
        step: String,
        #[source]
        source: Box<StepError>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl StepError {
    /// Classification of the root cause.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Path(_) => ErrorKind::PathError,
            Self::Invocation(_) => ErrorKind::InvocationError,
            Self::Element { source, .. } => source.kind(),
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Innermost error, unwrapping map element layers.
    pub fn root_cause(&self) -> &StepError {
        match self {
            Self::Element { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Failures of the run-record store.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("run record I/O failed for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("run record is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("run record needs a non-empty run id")]
    EmptyRunId,
}
