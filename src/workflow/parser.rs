//! Workflow Parser
//!
//! Handles loading and parsing workflow documents from YAML (or JSON) files.
//! A document is a [`WorkflowGraph`] plus an optional `resources` section
//! binding resource references to external commands.
//!
//! Documents are validated on load; a document that loads is safe to share
//! read-only across any number of runs.

use std::error::Error;
use std::fs;

use indexmap::IndexMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::model::WorkflowGraph;
use super::validator::validate_graph;
use crate::error::ConfigurationError;
use crate::execution::command::ResourceBinding;

/// A workflow definition file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WorkflowDocument {
    #[serde(flatten)]
    pub graph: WorkflowGraph,

    /// Resource reference -> external command binding
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub resources: IndexMap<String, ResourceBinding>,
}

impl WorkflowDocument {
    /// Resources referenced by the graph that have no command binding.
    pub fn unbound_resources(&self) -> Vec<String> {
        self.graph
            .resources()
            .into_iter()
            .filter(|name| !self.resources.contains_key(name))
            .collect()
    }
}

/// Loads a workflow document from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Validates the graph structure (start step, transitions, cycles,
///    paths, templates) including every nested iterator graph
///
/// # Example
///
/// ```rust,no_run
/// use maprunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let document = load_workflow("pipeline.yaml")?;
///     println!("Loaded {} steps", document.graph.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: &str) -> Result<WorkflowDocument, ConfigurationError> {
    info!("Loading workflow from: {}", path);

    let content = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
        path: path.to_string(),
        source,
    })?;

    debug!("Workflow content loaded ({} bytes)", content.len());

    parse_workflow(&content)
}

/// Parses and validates a workflow document from a string.
pub fn parse_workflow(content: &str) -> Result<WorkflowDocument, ConfigurationError> {
    let document: WorkflowDocument = serde_yaml::from_str(content)?;

    info!(
        "Parsed {} steps, {} resource bindings",
        document.graph.steps.len(),
        document.resources.len()
    );

    validate_graph(&document.graph)?;

    Ok(document)
}

/// Saves a workflow document to a YAML file.
pub fn save_workflow(document: &WorkflowDocument, path: &str) -> Result<(), Box<dyn Error>> {
    let yaml_content = serde_yaml::to_string(document)?;
    fs::write(path, yaml_content)?;
    info!("Workflow saved to: {}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::StepDefinition;

    const PIPELINE: &str = r#"
start_at: list_repositories
steps:
  list_repositories:
    type: task
    resource: list_clone
    parameters:
      jobId: $.jobId
    result_path: $.listing
    next: process_repositories

  process_repositories:
    type: map
    items_path: $.listing.repositories
    parameters:
      repository: $item
      jobId: $.jobId
    max_concurrency: 5
    result_path: $.processed
    iterator:
      start_at: discover
      output_path: $.chunk_results
      steps:
        discover:
          type: task
          resource: discover_and_chunk
          parameters:
            repository: $.repository
            jobId: $.jobId
          result_path: $.discovered
          next: process_chunks
        process_chunks:
          type: map
          items_path: $.discovered.chunks
          parameters:
            chunk: $item
            repository: $.repository
            jobId: $.jobId
          max_concurrency: 10
          result_path: $.chunk_results
          iterator:
            start_at: invoke
            steps:
              invoke:
                type: task
                resource: invoke_model
                result_path: $.endpoints
    next: aggregate

  aggregate:
    type: task
    resource: aggregate
    parameters:
      jobId: $.jobId
    result_path: $.summary

resources:
  list_clone:
    command: ./bin/list_clone
  discover_and_chunk:
    command: ./bin/discover
    args: ["--max-chunk", "8000"]
  invoke_model:
    command: ./bin/invoke
    timeout_secs: 120
"#;

    #[test]
    fn test_parse_pipeline() {
        let document = parse_workflow(PIPELINE).unwrap();

        assert_eq!(document.graph.start_at, "list_repositories");
        assert_eq!(document.graph.len(), 3);
        assert_eq!(document.graph.map_depth(), 2);
        assert_eq!(document.resources.len(), 3);
        assert_eq!(document.resources["discover_and_chunk"].args, vec!["--max-chunk", "8000"]);

        let keys: Vec<&String> = document.graph.steps.keys().collect();
        assert_eq!(keys, vec!["list_repositories", "process_repositories", "aggregate"]);

        match &document.graph.steps["process_repositories"] {
            StepDefinition::Map(map) => {
                assert_eq!(map.iterator.output_path.as_deref(), Some("$.chunk_results"));
                assert_eq!(map.max_concurrency, Some(5));
            }
            StepDefinition::Task(_) => panic!("expected map step"),
        }
    }

    #[test]
    fn test_unbound_resources() {
        let document = parse_workflow(PIPELINE).unwrap();
        assert_eq!(document.unbound_resources(), vec!["aggregate"]);
    }

    #[test]
    fn test_parse_json_document() {
        let json = r#"{
            "start_at": "only",
            "steps": {
                "only": {"type": "task", "resource": "r", "result_path": "$.out"}
            }
        }"#;

        let document = parse_workflow(json).unwrap();
        assert_eq!(document.graph.len(), 1);
        assert!(document.resources.is_empty());
    }

    #[test]
    fn test_parse_rejects_cycle() {
        let yaml = r#"
start_at: a
steps:
  a: {type: task, resource: r, result_path: $.a, next: b}
  b: {type: task, resource: r, result_path: $.b, next: a}
"#;
        assert!(matches!(parse_workflow(yaml), Err(ConfigurationError::Cycle(_))));
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        let yaml = r#"
start_at: a
steps:
  a: {type: choice, result_path: $.a}
"#;
        assert!(matches!(parse_workflow(yaml), Err(ConfigurationError::Parse(_))));
    }

    #[test]
    fn test_load_workflow_file_not_found() {
        let result = load_workflow("/nonexistent/path/workflow.yaml");
        assert!(matches!(result, Err(ConfigurationError::Read { .. })));
    }

    #[test]
    fn test_load_workflow_invalid_yaml() {
        use tempfile::tempdir;

        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("bad.yaml");
        std::fs::write(&workflow_path, "this is not valid yaml: [[[").unwrap();

        let result = load_workflow(workflow_path.to_str().unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_reload() {
        use tempfile::tempdir;

        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("saved.yaml");
        let path = workflow_path.to_str().unwrap();

        let document = parse_workflow(PIPELINE).unwrap();
        save_workflow(&document, path).unwrap();

        let reloaded = load_workflow(path).unwrap();
        assert_eq!(reloaded, document);
    }
}
