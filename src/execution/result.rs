//! Run Results
//!
//! The immutable outcome of a run: final status, the context snapshot as of
//! the last successful step and, for failed runs, which step failed and why.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, StepError};

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Top-level step that failed
    pub step: String,
    pub kind: ErrorKind,
    /// Full cause, including map element trail
    pub cause: String,
}

impl RunFailure {
    pub fn from_step_error(step: impl Into<String>, error: &StepError) -> Self {
        Self {
            step: step.into(),
            kind: error.kind(),
            cause: error.to_string(),
        }
    }
}

/// Final record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    /// Context snapshot after the last successful step
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Wall time per step and map element, in milliseconds
    #[serde(default)]
    pub durations_ms: BTreeMap<String, u64>,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn failed_step(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.step.as_str())
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// Total run duration.
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
