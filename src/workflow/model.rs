//! Workflow Data Model
//!
//! Core data structures representing the step graph of a workflow.
//!
//! # Example YAML Format
//!
//! ```yaml
//! start_at: list_repositories
//! steps:
//!   list_repositories:
//!     type: task
//!     resource: list_clone
//!     result_path: $.listing
//!     next: process_repositories
//!
//!   process_repositories:
//!     type: map
//!     items_path: $.listing.repositories
//!     parameters:
//!       repository: $item
//!       jobId: $.jobId
//!     max_concurrency: 5
//!     result_path: $.processed
//!     iterator:
//!       start_at: discover
//!       steps:
//!         discover:
//!           type: task
//!           resource: discover_and_chunk
//!           parameters:
//!             repository: $.repository
//!           result_path: $.discovered
//!     next: aggregate
//!
//!   aggregate:
//!     type: task
//!     resource: aggregate
//!     parameters:
//!       jobId: $.jobId
//!     result_path: $.summary
//! ```

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::template::Template;

/// A single step of a workflow graph.
///
/// Steps are a tagged variant: a plain task invocation, or a map that runs
/// a nested graph once per element of a collection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDefinition {
    Task(TaskStep),
    Map(MapStep),
}

/// Invokes one named unit of work.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskStep {
    /// Opaque name of the unit of work
    pub resource: String,

    /// Projection of the context into the task input; identity when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Template>,

    /// Where the raw task output is written
    pub result_path: String,

    /// Following step, or end of graph when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// Runs `iterator` once per element of the collection at `items_path`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MapStep {
    /// Context path of the collection to iterate
    pub items_path: String,

    /// Graph executed for every element
    pub iterator: Arc<WorkflowGraph>,

    /// Bindings injected into each element's derived context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Template>,

    /// Maximum simultaneously running elements; `0` means unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    /// Where the ordered result array is written
    pub result_path: String,

    /// Following step, or end of graph when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

impl StepDefinition {
    /// Creates a task step writing its output to `result_path`.
    ///
    /// # Example
    ///
    /// ```
    /// use maprunner::workflow::StepDefinition;
    ///
    /// let step = StepDefinition::task("aggregate", "$.summary")
    ///     .with_parameter("jobId", "$.jobId")
    ///     .then("notify");
    /// assert_eq!(step.next(), Some("notify"));
    /// ```
    pub fn task(resource: impl Into<String>, result_path: impl Into<String>) -> Self {
        Self::Task(TaskStep {
            resource: resource.into().trim().to_string(),
            parameters: None,
            result_path: result_path.into(),
            next: None,
        })
    }

    /// Creates a map step over `items_path` running `iterator` per element.
    pub fn map(
        items_path: impl Into<String>,
        iterator: WorkflowGraph,
        result_path: impl Into<String>,
    ) -> Self {
        Self::Map(MapStep {
            items_path: items_path.into(),
            iterator: Arc::new(iterator),
            parameters: None,
            max_concurrency: None,
            result_path: result_path.into(),
            next: None,
        })
    }

    /// Sets the following step.
    pub fn then(mut self, next: impl Into<String>) -> Self {
        match &mut self {
            Self::Task(task) => task.next = Some(next.into()),
            Self::Map(map) => map.next = Some(next.into()),
        }
        self
    }

    /// Adds one parameter to the projection template.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let parameters = match &mut self {
            Self::Task(task) => &mut task.parameters,
            Self::Map(map) => &mut map.parameters,
        };
        parameters
            .get_or_insert_with(Template::new)
            .insert(key.into(), value.into());
        self
    }

    /// Sets the concurrency ceiling. No effect on task steps.
    pub fn with_max_concurrency(mut self, ceiling: usize) -> Self {
        if let Self::Map(map) = &mut self {
            map.max_concurrency = Some(ceiling);
        }
        self
    }

    pub fn next(&self) -> Option<&str> {
        match self {
            Self::Task(task) => task.next.as_deref(),
            Self::Map(map) => map.next.as_deref(),
        }
    }

    pub fn result_path(&self) -> &str {
        match self {
            Self::Task(task) => &task.result_path,
            Self::Map(map) => &map.result_path,
        }
    }

    pub fn parameters(&self) -> Option<&Template> {
        match self {
            Self::Task(task) => task.parameters.as_ref(),
            Self::Map(map) => map.parameters.as_ref(),
        }
    }

    /// Short label of the step kind, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Task(_) => "task",
            Self::Map(_) => "map",
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.next().is_none()
    }
}

/// A graph of steps with a single entry point.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WorkflowGraph {
    /// Identifier of the first step
    #[serde(default)]
    pub start_at: String,

    /// Step definitions keyed by identifier, in document order
    #[serde(default)]
    pub steps: IndexMap<String, StepDefinition>,

    /// For iterator graphs: path whose value becomes the element result.
    /// When absent, the element result is the output of the last step run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
}

impl WorkflowGraph {
    /// Creates an empty graph starting at `start_at`.
    pub fn new(start_at: impl Into<String>) -> Self {
        Self {
            start_at: start_at.into().trim().to_string(),
            steps: IndexMap::new(),
            output_path: None,
        }
    }

    /// Single-step graph, the usual shape of a map iterator.
    pub fn single(id: impl Into<String>, step: StepDefinition) -> Self {
        let id = id.into();
        let mut graph = Self::new(id.clone());
        graph.steps.insert(id, step);
        graph
    }

    /// Adds a step, builder style.
    pub fn with_step(mut self, id: impl Into<String>, step: StepDefinition) -> Self {
        self.steps.insert(id.into(), step);
        self
    }

    /// Sets the element result path.
    pub fn with_output_path(mut self, path: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn get_step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.get(id)
    }

    /// Unique resource references used anywhere in the graph, sorted.
    pub fn resources(&self) -> Vec<String> {
        let mut found = Vec::new();
        self.collect_resources(&mut found);
        found.sort();
        found.dedup();
        found
    }

    fn collect_resources(&self, found: &mut Vec<String>) {
        for step in self.steps.values() {
            match step {
                StepDefinition::Task(task) => found.push(task.resource.clone()),
                StepDefinition::Map(map) => map.iterator.collect_resources(found),
            }
        }
    }

    /// Deepest nesting of map steps; a graph without maps has depth 0.
    pub fn map_depth(&self) -> usize {
        self.steps
            .values()
            .map(|step| match step {
                StepDefinition::Task(_) => 0,
                StepDefinition::Map(map) => 1 + map.iterator.map_depth(),
            })
            .max()
            .unwrap_or(0)
    }

    /// Returns the number of steps at this level.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the graph has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
