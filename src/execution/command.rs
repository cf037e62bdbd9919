//! Command-Backed Task Execution
//!
//! Runs one external executable per invocation:
//! - The projected input is written to stdin as JSON
//! - stdout is parsed as the JSON output (empty stdout means `null`)
//! - A non-zero exit status, spawn failure, timeout or unparsable stdout
//!   becomes an [`InvocationError`] carrying the tail of stderr
//!
//! # Example YAML
//!
//! ```yaml
//! resources:
//!   discover_and_chunk:
//!     command: python3
//!     args: [tasks/discover_and_chunk.py]
//!     working_dir: /srv/pipeline
//!     timeout_secs: 300
//!     env:
//!       MAX_CHUNK_SIZE: "8000"
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::invoker::TaskInvoker;
use crate::error::InvocationError;

/// Maximum number of stderr bytes carried into an error.
const STDERR_TAIL_BYTES: usize = 2048;

/// How a resource reference maps onto an executable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ResourceBinding {
    /// Executable to run
    pub command: String,

    /// Arguments passed before any input
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Working directory for the process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Kill the process after this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Extra environment variables
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
}

impl ResourceBinding {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into().trim().to_string(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_secs = Some(seconds);
        self
    }
}

/// Invokes a resource by running its bound executable.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    binding: ResourceBinding,
}

impl CommandInvoker {
    pub fn new(binding: ResourceBinding) -> Self {
        Self { binding }
    }

    pub fn binding(&self) -> &ResourceBinding {
        &self.binding
    }

    async fn run(&self, resource: &str, payload: Vec<u8>) -> Result<std::process::Output, InvocationError> {
        let binding = &self.binding;

        let mut cmd = Command::new(&binding.command);
        cmd.args(&binding.args)
            .envs(&binding.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &binding.working_dir {
            cmd.current_dir(dir);
            debug!("Executing '{}' in directory: {}", resource, dir.display());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| InvocationError::new(resource, format!("failed to start '{}': {}", binding.command, e)))?;

        // Input is fed concurrently so a task writing before it reads cannot deadlock
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                let written = stdin.write_all(&payload).await;
                drop(stdin);
                written
            })
        });

        let waiting = child.wait_with_output();
        let output = match binding.timeout_secs {
            Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), waiting)
                .await
                .map_err(|_| InvocationError::new(resource, format!("timed out after {}s", seconds)))?,
            None => waiting.await,
        };

        // A task that exits without reading its input closes the pipe early
        if let Some(writer) = writer {
            if let Ok(Err(e)) = writer.await {
                warn!("Could not write full input to '{}': {}", resource, e);
            }
        }

        output.map_err(|e| InvocationError::new(resource, format!("failed to collect output: {}", e)))
    }
}

#[async_trait]
impl TaskInvoker for CommandInvoker {
    async fn invoke(&self, resource: &str, input: Value) -> Result<Value, InvocationError> {
        let payload = serde_json::to_vec(&input)
            .map_err(|e| InvocationError::new(resource, format!("input is not serializable: {}", e)))?;

        let output = self.run(resource, payload).await?;

        if !output.status.success() {
            let stderr = stderr_tail(&output.stderr);
            error!(
                "Resource '{}' failed with exit code: {:?}",
                resource,
                output.status.code()
            );
            if !stderr.is_empty() {
                error!("stderr:\n{}", stderr);
            }

            let cause = match output.status.code() {
                Some(code) => format!("exited with status {}: {}", code, stderr),
                None => format!("terminated by signal: {}", stderr),
            };
            return Err(InvocationError::new(resource, cause));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!("Resource '{}' produced {} bytes of output", resource, stdout.len());

        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(stdout.trim())
            .map_err(|e| InvocationError::new(resource, format!("output is not valid JSON: {}", e)))
    }
}

/// Last few kilobytes of stderr, trimmed.
fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
