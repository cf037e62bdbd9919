//! Map Stage Execution
//!
//! Runs a map step's iterator graph once per element of a collection read
//! from the context. Elements are dispatched in index order, at most
//! `ceiling` at a time; a completion frees a slot for the next queued
//! element. Each result lands in a pre-sized slot keyed by its source index,
//! so the aggregate array mirrors the source order whatever order the
//! elements finish in.
//!
//! The first failing element fails the whole step: dispatch stops, the
//! in-flight elements are aborted and every computed result is dropped.
//! Aborted elements are closed on the timeline as failed.

use std::borrow::Cow;
use std::sync::Arc;

use log::{debug, error, info};
use serde_json::{json, Value};
use tokio::task::JoinSet;

use super::context::ExecutionContext;
use super::engine::{run_graph, RunEnv};
use crate::error::StepError;
use crate::monitoring::{record, EventType, SharedTimeline};
use crate::workflow::path::ContextPath;
use crate::workflow::template::{evaluate, ElementBinding, Scope};
use crate::workflow::{MapStep, WorkflowGraph};

/// Resolves the number of elements allowed to run at once.
///
/// `None` falls back to the engine default and `0` means one slot per
/// element. The result is never below one.
pub fn concurrency_ceiling(requested: Option<usize>, default: usize, len: usize) -> usize {
    let ceiling = match requested {
        None => default,
        Some(0) => len,
        Some(limit) => limit,
    };
    ceiling.clamp(1, len.max(1))
}

/// Timeline label of element `index` of `step_id`, nested under `scope`.
pub fn element_label(scope: &str, step_id: &str, index: usize) -> String {
    if scope.is_empty() {
        format!("{}[{}]", step_id, index)
    } else {
        format!("{}/{}[{}]", scope, step_id, index)
    }
}

/// Executes a map step against `context` and returns the ordered results.
pub(crate) async fn run_map(
    env: &Arc<RunEnv>,
    step_id: &str,
    step: &MapStep,
    context: &ExecutionContext,
    scope: &str,
) -> Result<Value, StepError> {
    let items_path = ContextPath::parse(&step.items_path)?;
    let items = context.slice(&items_path)?;

    if items.is_empty() {
        info!("Map step '{}': {} is empty, nothing to run", step_id, items_path);
        return Ok(Value::Array(Vec::new()));
    }

    // Every element context is built before anything runs, so a bad
    // projection fails the step without side effects.
    let parent = context.freeze();
    let mut queued = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let overlay = match &step.parameters {
            Some(template) => evaluate(
                template,
                &Scope {
                    context,
                    run_id: &env.run_id,
                    element: Some(ElementBinding { index, item }),
                },
            )?,
            None => json!({ "item": item }),
        };
        queued.push(ExecutionContext::derived(Arc::clone(&parent), overlay));
    }

    let total = queued.len();
    let ceiling = concurrency_ceiling(step.max_concurrency, env.default_concurrency, total);
    info!(
        "Map step '{}': {} elements, max concurrency {}",
        step_id, total, ceiling
    );

    let mut results: Vec<Option<Value>> = vec![None; total];
    let mut pending = queued.into_iter().enumerate();
    let mut in_flight = JoinSet::new();

    loop {
        while in_flight.len() < ceiling {
            let Some((index, element_context)) = pending.next() else {
                break;
            };

            let label = element_label(scope, step_id, index);
            debug!("Dispatching element {}", label);
            in_flight.spawn(
                ElementTask {
                    env: Arc::clone(env),
                    graph: Arc::clone(&step.iterator),
                    context: element_context,
                    index,
                    label,
                }
                .run(),
            );
        }

        let Some(joined) = in_flight.join_next().await else {
            break;
        };

        match joined {
            Ok((index, Ok(value))) => results[index] = Some(value),
            Ok((index, Err(failure))) => {
                error!("Map step '{}': element {} failed: {}", step_id, index, failure);
                in_flight.shutdown().await;
                return Err(failure);
            }
            Err(join_error) => {
                error!("Map step '{}': element task did not finish: {}", step_id, join_error);
                in_flight.shutdown().await;
                return Err(StepError::Internal(format!(
                    "element of map step '{}' did not finish: {}",
                    step_id, join_error
                )));
            }
        }
    }

    results
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| {
                StepError::Internal(format!("element {} of '{}' produced no result", index, step_id))
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

/// One element execution, owned so it can be spawned.
struct ElementTask {
    env: Arc<RunEnv>,
    graph: Arc<WorkflowGraph>,
    context: ExecutionContext,
    index: usize,
    label: String,
}

impl ElementTask {
    async fn run(mut self) -> (usize, Result<Value, StepError>) {
        let span = ElementSpan::start(&self.env.timeline, &self.label);

        let outcome = match run_graph(&self.env, &self.graph, &mut self.context, &self.label).await {
            Ok(done) => element_result(&self.graph, &self.context, done.output).map_err(|error| {
                StepError::Element {
                    index: self.index,
                    step: done.last_step,
                    source: Box::new(error),
                }
            }),
            Err(failure) => Err(StepError::Element {
                index: self.index,
                step: failure.step,
                source: Box::new(failure.error),
            }),
        };

        span.finish(if outcome.is_ok() {
            EventType::Completed
        } else {
            EventType::Failed
        });

        (self.index, outcome)
    }
}

/// Timeline entry of one element. Dropping it unfinished, as happens when
/// the element task is aborted, records a failure.
struct ElementSpan {
    timeline: SharedTimeline,
    label: String,
    finished: bool,
}

impl ElementSpan {
    fn start(timeline: &SharedTimeline, label: &str) -> Self {
        record(timeline, label, EventType::Started);
        Self {
            timeline: Arc::clone(timeline),
            label: label.to_string(),
            finished: false,
        }
    }

    fn finish(mut self, event: EventType) {
        record(&self.timeline, &self.label, event);
        self.finished = true;
    }
}

impl Drop for ElementSpan {
    fn drop(&mut self) {
        if !self.finished {
            record(&self.timeline, &self.label, EventType::Failed);
        }
    }
}

/// The element's value: `output_path` when declared, else the last output.
fn element_result(
    graph: &WorkflowGraph,
    context: &ExecutionContext,
    last_output: Value,
) -> Result<Value, StepError> {
    match &graph.output_path {
        Some(raw) => {
            let path = ContextPath::parse(raw)?;
            Ok(context.get(&path).map(Cow::into_owned)?)
        }
        None => Ok(last_output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, InvocationError, PathError};
    use crate::execution::invoker::TaskInvoker;
    use crate::workflow::StepDefinition;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Counts calls and the peak number of simultaneously active calls.
    #[derive(Default)]
    struct Meter {
        order: Mutex<Vec<Value>>,
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl TaskInvoker for Meter {
        async fn invoke(&self, resource: &str, input: Value) -> Result<Value, InvocationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(input["value"].clone());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let delay = input["delay"].as_u64().unwrap_or(5);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if input["fail"] == json!(true) {
                return Err(InvocationError::new(resource, "element rejected"));
            }
            Ok(json!({ "seen": input["value"] }))
        }
    }

    fn env_with(meter: &Arc<Meter>) -> Arc<RunEnv> {
        let invoker: Arc<dyn TaskInvoker> = meter.clone();
        Arc::new(RunEnv::new(invoker, "run-test", 4))
    }

    fn process_graph() -> WorkflowGraph {
        WorkflowGraph::single(
            "process",
            StepDefinition::task("meter", "$.processed")
                .with_parameter("value", "$.value")
                .with_parameter("delay", "$.delay")
                .with_parameter("fail", "$.fail"),
        )
    }

    fn map_step(ceiling: Option<usize>) -> MapStep {
        let step = StepDefinition::map("$.items", process_graph(), "$.results")
            .with_parameter("value", "$item.n")
            .with_parameter("delay", "$item.delay")
            .with_parameter("fail", "$item.fail");
        let step = match ceiling {
            Some(limit) => step.with_max_concurrency(limit),
            None => step,
        };
        match step {
            StepDefinition::Map(map) => map,
            StepDefinition::Task(_) => unreachable!(),
        }
    }

    fn items(count: usize, delay: impl Fn(usize) -> u64) -> Value {
        Value::Array(
            (0..count)
                .map(|n| json!({ "n": n, "delay": delay(n), "fail": false }))
                .collect(),
        )
    }

    #[test]
    fn test_concurrency_ceiling_resolution() {
        assert_eq!(concurrency_ceiling(None, 8, 20), 8);
        assert_eq!(concurrency_ceiling(Some(0), 8, 20), 20);
        assert_eq!(concurrency_ceiling(Some(3), 8, 20), 3);
        assert_eq!(concurrency_ceiling(Some(50), 8, 20), 20);
        assert_eq!(concurrency_ceiling(Some(0), 8, 0), 1);
    }

    #[test]
    fn test_element_labels() {
        assert_eq!(element_label("", "repos", 2), "repos[2]");
        assert_eq!(element_label("repos[2]", "chunks", 0), "repos[2]/chunks[0]");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_results_follow_source_order() {
        let meter = Arc::new(Meter::default());
        let env = env_with(&meter);
        let context = ExecutionContext::new(json!({ "items": items(8, |n| (8 - n as u64) * 10) }));

        let results = run_map(&env, "process_all", &map_step(Some(0)), &context, "")
            .await
            .unwrap();

        let seen: Vec<Value> = results
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["seen"].clone())
            .collect();
        assert_eq!(seen, (0..8).map(|n| json!(n)).collect::<Vec<_>>());
        assert_eq!(meter.calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_empty_collection_invokes_nothing() {
        let meter = Arc::new(Meter::default());
        let env = env_with(&meter);
        let context = ExecutionContext::new(json!({ "items": [] }));

        let results = run_map(&env, "process_all", &map_step(None), &context, "")
            .await
            .unwrap();

        assert_eq!(results, json!([]));
        assert_eq!(meter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_ceiling_is_never_exceeded() {
        for ceiling in [1, 5, 10] {
            let meter = Arc::new(Meter::default());
            let env = env_with(&meter);
            let context = ExecutionContext::new(json!({ "items": items(30, |_| 15) }));

            let results = run_map(&env, "process_all", &map_step(Some(ceiling)), &context, "")
                .await
                .unwrap();

            assert_eq!(results.as_array().unwrap().len(), 30);
            assert_eq!(meter.calls.load(Ordering::SeqCst), 30);
            let peak = meter.peak.load(Ordering::SeqCst);
            assert!(peak <= ceiling, "ceiling {} exceeded: peak {}", ceiling, peak);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failing_element_fails_step() {
        let meter = Arc::new(Meter::default());
        let env = env_with(&meter);
        let mut source = items(6, |_| 5);
        source[3]["fail"] = json!(true);
        let context = ExecutionContext::new(json!({ "items": source }));

        let err = run_map(&env, "process_all", &map_step(Some(2)), &context, "")
            .await
            .unwrap_err();

        match &err {
            StepError::Element { index, step, .. } => {
                assert_eq!(*index, 3);
                assert_eq!(step, "process");
            }
            other => panic!("expected element failure, got {:?}", other),
        }
        assert_eq!(err.kind(), ErrorKind::InvocationError);
        assert!(err.to_string().contains("element rejected"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_slot_runs_in_index_order() {
        let meter = Arc::new(Meter::default());
        let env = env_with(&meter);
        let context = ExecutionContext::new(json!({ "items": items(6, |n| (6 - n as u64) * 3) }));

        run_map(&env, "process_all", &map_step(Some(1)), &context, "")
            .await
            .unwrap();

        let order = meter.order.lock().unwrap().clone();
        assert_eq!(order, (0..6).map(|n| json!(n)).collect::<Vec<_>>());
        assert_eq!(meter.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_stops_dispatch() {
        let meter = Arc::new(Meter::default());
        let env = env_with(&meter);
        let mut source = items(6, |_| 2);
        source[2]["fail"] = json!(true);
        let context = ExecutionContext::new(json!({ "items": source }));

        let err = run_map(&env, "process_all", &map_step(Some(1)), &context, "")
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Element { index: 2, .. }));
        assert_eq!(meter.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            meter.order.lock().unwrap().clone(),
            vec![json!(0), json!(1), json!(2)]
        );
    }

    #[tokio::test]
    async fn test_aborted_elements_close_on_timeline() {
        let meter = Arc::new(Meter::default());
        let env = env_with(&meter);
        let source = json!([
            { "n": 0, "delay": 1, "fail": true },
            { "n": 1, "delay": 5000, "fail": false },
        ]);
        let context = ExecutionContext::new(json!({ "items": source }));

        let started = std::time::Instant::now();
        run_map(&env, "process_all", &map_step(Some(2)), &context, "")
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));

        let timeline = env.timeline.lock().unwrap();
        assert!(timeline.in_flight().is_empty());
        let last_for_slow = timeline
            .get_events()
            .iter()
            .rev()
            .find(|event| event.label == "process_all[1]")
            .map(|event| event.event_type);
        assert!(matches!(last_for_slow, None | Some(EventType::Failed)));
    }

    #[tokio::test]
    async fn test_items_must_be_a_sequence() {
        let meter = Arc::new(Meter::default());
        let env = env_with(&meter);
        let context = ExecutionContext::new(json!({ "items": { "n": 1 } }));

        let err = run_map(&env, "process_all", &map_step(None), &context, "")
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::Path(PathError::NotASequence { .. })));
        assert_eq!(meter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_items_path() {
        let meter = Arc::new(Meter::default());
        let env = env_with(&meter);
        let context = ExecutionContext::new(json!({}));

        let err = run_map(&env, "process_all", &map_step(None), &context, "")
            .await
            .unwrap_err();

        assert_eq!(err, StepError::Path(PathError::NotFound("$.items".to_string())));
    }

    #[tokio::test]
    async fn test_default_overlay_binds_item() {
        let meter = Arc::new(Meter::default());
        let env = env_with(&meter);
        let inner = WorkflowGraph::single(
            "process",
            StepDefinition::task("meter", "$.processed").with_parameter("value", "$.item"),
        );
        let step = match StepDefinition::map("$.items", inner, "$.results") {
            StepDefinition::Map(map) => map,
            StepDefinition::Task(_) => unreachable!(),
        };
        let context = ExecutionContext::new(json!({ "items": ["a", "b"] }));

        let results = run_map(&env, "each", &step, &context, "").await.unwrap();
        assert_eq!(results, json!([{ "seen": "a" }, { "seen": "b" }]));
    }

    #[tokio::test]
    async fn test_output_path_selects_element_result() {
        let meter = Arc::new(Meter::default());
        let env = env_with(&meter);
        let inner = WorkflowGraph::single(
            "process",
            StepDefinition::task("meter", "$.processed").with_parameter("value", "$.item"),
        )
        .with_output_path("$.processed.seen");
        let step = match StepDefinition::map("$.items", inner, "$.results") {
            StepDefinition::Map(map) => map,
            StepDefinition::Task(_) => unreachable!(),
        };
        let context = ExecutionContext::new(json!({ "items": [10, 20] }));

        let results = run_map(&env, "each", &step, &context, "").await.unwrap();
        assert_eq!(results, json!([10, 20]));
    }

    #[tokio::test]
    async fn test_elements_are_recorded_on_timeline() {
        let meter = Arc::new(Meter::default());
        let env = env_with(&meter);
        let context = ExecutionContext::new(json!({ "items": items(2, |_| 1) }));

        run_map(&env, "process_all", &map_step(None), &context, "outer[1]")
            .await
            .unwrap();

        let durations = env.timeline.lock().unwrap().durations_ms();
        assert!(durations.contains_key("outer[1]/process_all[0]"));
        assert!(durations.contains_key("outer[1]/process_all[1]"));
    }
}
