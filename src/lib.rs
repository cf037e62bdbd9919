//! MapRunner - Fan-Out/Fan-In Workflow Engine
//!
//! Executes declarative workflow graphs made of task steps and map steps.
//! Task steps call a named unit of work; map steps run a nested graph once
//! per element of a runtime collection under a concurrency ceiling, and
//! collect the results in source order. Every step reads from and writes
//! to a per-run execution context addressed by paths.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Graph definitions, YAML parsing, paths and validation
//! - [`execution`]: The interpreter, map executor, context and invokers
//! - [`monitoring`]: Execution timeline for steps and map elements
//! - [`error`]: Error types shared by all of the above
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use maprunner::execution::{Engine, FnInvoker, InvokerRegistry};
//! use maprunner::workflow::{StepDefinition, WorkflowGraph};
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let per_item = WorkflowGraph::single(
//!         "square",
//!         StepDefinition::task("square", "$.squared").with_parameter("n", "$.item"),
//!     );
//!     let graph = WorkflowGraph::single(
//!         "square_all",
//!         StepDefinition::map("$.numbers", per_item, "$.results").with_max_concurrency(2),
//!     );
//!
//!     let invokers = InvokerRegistry::new().with(
//!         "square",
//!         FnInvoker::new(|input: Value| async move {
//!             let n = input["n"].as_i64().unwrap_or_default();
//!             Ok::<_, String>(json!(n * n))
//!         }),
//!     );
//!
//!     let engine = Engine::new(graph, Arc::new(invokers))?;
//!     let result = engine.run(json!({ "numbers": [1, 2, 3] })).await;
//!     assert_eq!(result.context["results"], json!([1, 4, 9]));
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use error::{ConfigurationError, ErrorKind, InvocationError, PathError, StepError};
pub use execution::engine::Engine;
pub use execution::result::{RunResult, RunStatus};
pub use workflow::model::{StepDefinition, WorkflowGraph};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "MapRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "MapRunner");
    }

    #[test]
    fn test_module_exports_step() {
        let step = StepDefinition::task("aggregate", "$.summary");
        assert_eq!(step.kind_name(), "task");
        assert!(step.is_terminal());
    }

    #[test]
    fn test_module_exports_graph() {
        let graph = WorkflowGraph::default();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
