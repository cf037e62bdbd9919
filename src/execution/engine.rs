//! Workflow Execution Engine
//!
//! The interpreter that drives a run through a workflow graph:
//! - Top-level steps execute strictly one after another
//! - Task steps project the context, invoke their resource and write the
//!   raw output at their result path
//! - Map steps fan out through [`run_map`](super::map), whose elements run
//!   the iterator graph through this same driver
//! - Any step failure ends the run as `Failed`, keeping the context as of
//!   the last successful step
//!
//! One [`Engine`] can serve many concurrent runs; the graph and invoker are
//! shared read-only and every run owns its context.

use std::borrow::Cow;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::{ConfigurationError, PathError, StepError};
use crate::monitoring::{record, EventType, ExecutionTimeline, SharedTimeline};
use crate::workflow::path::ContextPath;
use crate::workflow::template::{evaluate, Scope, Template};
use crate::workflow::{validate_graph, StepDefinition, WorkflowGraph};

use super::context::ExecutionContext;
use super::invoker::TaskInvoker;
use super::map::run_map;
use super::record::RunRecordStore;
use super::result::{RunFailure, RunResult, RunStatus};

/// Concurrency ceiling for map steps that do not declare one.
pub static DEFAULT_CONCURRENCY: Lazy<usize> = Lazy::new(|| num_cpus::get().max(1));

/// Context field holding the run identifier.
const RUN_ID_FIELD: &str = "run_id";

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use maprunner::execution::{Engine, InvokerRegistry};
/// use maprunner::load_workflow;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let document = load_workflow("pipeline.yaml")?;
///     let invokers = InvokerRegistry::new();
///     let mut engine = Engine::new(document.graph, Arc::new(invokers))?;
///     engine.set_default_concurrency(8);
///
///     let result = engine.run(json!({ "run_id": "nightly-42" })).await;
///     println!("{:?}", result.status);
///     Ok(())
/// }
/// ```
pub struct Engine {
    graph: Arc<WorkflowGraph>,
    invoker: Arc<dyn TaskInvoker>,
    default_concurrency: usize,
    record_store: Option<RunRecordStore>,
}

impl Engine {
    /// Creates an engine for a graph, validating it first.
    pub fn new(graph: WorkflowGraph, invoker: Arc<dyn TaskInvoker>) -> Result<Self, ConfigurationError> {
        validate_graph(&graph)?;
        Ok(Self {
            graph: Arc::new(graph),
            invoker,
            default_concurrency: *DEFAULT_CONCURRENCY,
            record_store: None,
        })
    }

    /// Sets the ceiling used by map steps without `max_concurrency`.
    pub fn set_default_concurrency(&mut self, ceiling: usize) {
        self.default_concurrency = ceiling.max(1);
    }

    /// Persists every finished run to `store`.
    pub fn set_record_store(&mut self, store: RunRecordStore) {
        self.record_store = Some(store);
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn default_concurrency(&self) -> usize {
        self.default_concurrency
    }

    /// Executes one run from `input` to completion.
    pub async fn run(&self, input: Value) -> RunResult {
        self.run_with_timeline(input).await.0
    }

    /// Executes one run and also returns its timeline.
    pub async fn run_with_timeline(&self, input: Value) -> (RunResult, ExecutionTimeline) {
        let started_at = Utc::now();
        let mut context = ExecutionContext::new(input);
        let run_id = resolve_run_id(&mut context);

        let env = Arc::new(RunEnv::new(
            Arc::clone(&self.invoker),
            &run_id,
            self.default_concurrency,
        ));

        info!(
            "Starting run '{}' at step '{}' (default concurrency: {})",
            run_id, self.graph.start_at, self.default_concurrency
        );

        let outcome = run_graph(&env, &self.graph, &mut context, "").await;
        let finished_at = Utc::now();

        let (status, failure) = match outcome {
            Ok(done) => {
                info!("Run '{}' succeeded after step '{}'", run_id, done.last_step);
                (RunStatus::Succeeded, None)
            }
            Err(failed) => {
                error!("Run '{}' failed at step '{}': {}", run_id, failed.step, failed.error);
                (
                    RunStatus::Failed,
                    Some(RunFailure::from_step_error(failed.step, &failed.error)),
                )
            }
        };

        let timeline = match env.timeline.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let result = RunResult {
            run_id,
            status,
            context: context.snapshot(),
            failure,
            started_at,
            finished_at,
            durations_ms: timeline.durations_ms(),
        };

        if let Some(store) = &self.record_store {
            match store.save(&result) {
                Ok(path) => debug!("Run record written to {}", path.display()),
                Err(e) => warn!("Failed to persist run record for '{}': {}", result.run_id, e),
            }
        }

        (result, timeline)
    }
}

/// State shared by every step and element of a single run.
pub(crate) struct RunEnv {
    pub(crate) invoker: Arc<dyn TaskInvoker>,
    pub(crate) run_id: Arc<str>,
    pub(crate) timeline: SharedTimeline,
    pub(crate) default_concurrency: usize,
}

impl RunEnv {
    pub(crate) fn new(invoker: Arc<dyn TaskInvoker>, run_id: &str, default_concurrency: usize) -> Self {
        Self {
            invoker,
            run_id: Arc::from(run_id),
            timeline: ExecutionTimeline::shared(),
            default_concurrency,
        }
    }
}

/// A graph that ran to its terminal step.
pub(crate) struct GraphOutcome {
    pub(crate) last_step: String,
    pub(crate) output: Value,
}

/// The step a graph stopped at, and why.
pub(crate) struct StepFailure {
    pub(crate) step: String,
    pub(crate) error: StepError,
}

pub(crate) type GraphFuture<'a> =
    Pin<Box<dyn Future<Output = Result<GraphOutcome, StepFailure>> + Send + 'a>>;

/// Walks `graph` from its start step, writing into `context`.
///
/// `scope` is empty for the top-level graph and the element label for an
/// iterator graph. Only top-level steps are recorded on the timeline.
pub(crate) fn run_graph<'a>(
    env: &'a Arc<RunEnv>,
    graph: &'a WorkflowGraph,
    context: &'a mut ExecutionContext,
    scope: &'a str,
) -> GraphFuture<'a> {
    Box::pin(async move {
        let top_level = scope.is_empty();
        let mut current = graph.start_at.clone();

        loop {
            let Some(step) = graph.get_step(&current) else {
                return Err(StepFailure {
                    error: StepError::Internal(format!("step '{}' is not defined", current)),
                    step: current,
                });
            };

            if top_level {
                info!("Starting step: {} ({})", current, step.kind_name());
                record(&env.timeline, &current, EventType::Started);
            } else {
                debug!("{}: starting step '{}'", scope, current);
            }

            let output = match execute_step(env, &current, step, context, scope).await {
                Ok(output) => output,
                Err(error) => {
                    if top_level {
                        record(&env.timeline, &current, EventType::Failed);
                    }
                    return Err(StepFailure { step: current, error });
                }
            };

            if top_level {
                info!("Step '{}' completed successfully", current);
                record(&env.timeline, &current, EventType::Completed);
            }

            match step.next() {
                Some(next) => current = next.to_string(),
                None => {
                    return Ok(GraphOutcome {
                        last_step: current,
                        output,
                    })
                }
            }
        }
    })
}

/// Runs one step and writes its output at the step's result path.
async fn execute_step(
    env: &Arc<RunEnv>,
    step_id: &str,
    step: &StepDefinition,
    context: &mut ExecutionContext,
    scope: &str,
) -> Result<Value, StepError> {
    let target = ContextPath::parse(step.result_path())?;

    let output = match step {
        StepDefinition::Task(task) => {
            let input = project_input(task.parameters.as_ref(), context, &env.run_id)?;
            debug!("Invoking '{}' for step '{}'", task.resource, step_id);
            env.invoker.invoke(&task.resource, input).await?
        }
        StepDefinition::Map(map) => run_map(env, step_id, map, context, scope).await?,
    };

    context.set(&target, output.clone())?;
    Ok(output)
}

/// Builds a task input: the template if declared, otherwise the full
/// context view. Mapping inputs always carry the run identifier.
fn project_input(
    parameters: Option<&Template>,
    context: &ExecutionContext,
    run_id: &str,
) -> Result<Value, PathError> {
    let mut input = match parameters {
        Some(template) => evaluate(
            template,
            &Scope {
                context,
                run_id,
                element: None,
            },
        )?,
        None => context.snapshot(),
    };

    if let Value::Object(fields) = &mut input {
        fields
            .entry(RUN_ID_FIELD)
            .or_insert_with(|| Value::String(run_id.to_string()));
    }
    Ok(input)
}

/// Takes the run identifier from the input, or generates and stores one.
fn resolve_run_id(context: &mut ExecutionContext) -> String {
    let field = ContextPath::root().child(RUN_ID_FIELD);

    match context.get(&field).map(Cow::into_owned) {
        Ok(Value::String(id)) if !id.is_empty() => return id,
        Ok(Value::Number(id)) => return id.to_string(),
        _ => {}
    }

    let generated = format!("run-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
    if let Err(e) = context.set(&field, Value::String(generated.clone())) {
        warn!("Could not record run id in context: {}", e);
    }
    generated
}
