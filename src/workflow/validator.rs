//! Workflow Validation
//!
//! Load-time checks that turn a parsed document into a graph the engine can
//! trust:
//! - Start step present and defined
//! - Every `next` resolves to a defined step
//! - No cycles (Kahn's algorithm over `next` links)
//! - Paths and projection templates parse
//! - Map iterators are valid graphs themselves
//!
//! Any failure is a [`ConfigurationError`], fatal to process start.

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info, warn};

use super::model::{StepDefinition, WorkflowGraph};
use super::path::ContextPath;
use super::template::{expressions, Template};
use crate::error::ConfigurationError;

/// Validates a graph and all nested iterator graphs.
pub fn validate_graph(graph: &WorkflowGraph) -> Result<(), ConfigurationError> {
    info!("Validating workflow graph with {} steps", graph.len());

    validate_level(graph)?;

    info!(
        "Workflow graph validated: {} top-level steps, map nesting depth {}",
        graph.len(),
        graph.map_depth()
    );
    Ok(())
}

fn validate_level(graph: &WorkflowGraph) -> Result<(), ConfigurationError> {
    if graph.is_empty() {
        return Err(ConfigurationError::EmptyGraph);
    }

    if graph.start_at.trim().is_empty() {
        return Err(ConfigurationError::MissingStart);
    }

    if !graph.steps.contains_key(&graph.start_at) {
        return Err(ConfigurationError::UnknownStart(graph.start_at.clone()));
    }

    for (id, step) in &graph.steps {
        validate_step(id, step)?;

        if let Some(next) = step.next() {
            if !graph.steps.contains_key(next) {
                return Err(ConfigurationError::UnknownNext {
                    step: id.clone(),
                    next: next.to_string(),
                });
            }
        }
    }

    if let Some(output_path) = &graph.output_path {
        check_path("$output", output_path)?;
    }

    detect_cycles(graph)?;

    let reachable = execution_order(graph);
    if reachable.len() < graph.len() {
        let reached: HashSet<&str> = reachable.iter().map(String::as_str).collect();
        for id in graph.steps.keys().filter(|id| !reached.contains(id.as_str())) {
            warn!("Step '{}' is unreachable from start step '{}'", id, graph.start_at);
        }
    }

    Ok(())
}

/// Validates a single step's fields.
fn validate_step(id: &str, step: &StepDefinition) -> Result<(), ConfigurationError> {
    check_path(id, step.result_path())?;

    match step {
        StepDefinition::Task(task) => {
            if task.resource.trim().is_empty() {
                return Err(ConfigurationError::MissingResource(id.to_string()));
            }
            if let Some(template) = &task.parameters {
                check_template(id, template, false)?;
            }
        }
        StepDefinition::Map(map) => {
            check_path(id, &map.items_path)?;
            if let Some(template) = &map.parameters {
                check_template(id, template, true)?;
            }
            if map.max_concurrency == Some(0) {
                debug!("Map step '{}' has an unbounded concurrency ceiling", id);
            }

            validate_level(&map.iterator).map_err(|source| ConfigurationError::Iterator {
                step: id.to_string(),
                source: Box::new(source),
            })?;
        }
    }

    if step.is_terminal() {
        debug!("Step '{}' ends its graph", id);
    }

    Ok(())
}

fn check_path(step: &str, raw: &str) -> Result<(), ConfigurationError> {
    ContextPath::parse(raw)
        .map(|_| ())
        .map_err(|e| ConfigurationError::InvalidPath {
            step: step.to_string(),
            path: raw.to_string(),
            reason: e.to_string(),
        })
}

fn check_template(step: &str, template: &Template, allow_element: bool) -> Result<(), ConfigurationError> {
    for (key, parsed) in expressions(template) {
        let expression = parsed.map_err(|e| ConfigurationError::InvalidTemplate {
            step: step.to_string(),
            key: key.clone(),
            reason: e.to_string(),
        })?;

        if expression.needs_element() && !allow_element {
            return Err(ConfigurationError::InvalidTemplate {
                step: step.to_string(),
                key,
                reason: "$item and $index are only available in map step parameters".to_string(),
            });
        }
    }
    Ok(())
}

/// Detects cycles using Kahn's algorithm over `next` links.
fn detect_cycles(graph: &WorkflowGraph) -> Result<(), ConfigurationError> {
    let mut in_degree: HashMap<&str, usize> =
        graph.steps.keys().map(|id| (id.as_str(), 0)).collect();

    for step in graph.steps.values() {
        if let Some(next) = step.next() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut visited = 0;
    while let Some(current) = queue.pop_front() {
        visited += 1;

        let successor = graph.steps.get(current).and_then(|s| s.next());
        if let Some(next) = successor {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if visited == graph.len() {
        return Ok(());
    }

    // Every remaining step lies on or leads into a cycle; walk one to report it
    let Some(first) = graph
        .steps
        .keys()
        .find(|id| in_degree.get(id.as_str()).copied().unwrap_or(0) > 0)
    else {
        return Err(ConfigurationError::Cycle(Vec::new()));
    };

    let mut trail: Vec<String> = Vec::new();
    let mut current = Some(first.as_str());
    while let Some(id) = current {
        if let Some(pos) = trail.iter().position(|seen| seen == id) {
            let mut cycle = trail.split_off(pos);
            cycle.push(id.to_string());
            return Err(ConfigurationError::Cycle(cycle));
        }
        trail.push(id.to_string());
        current = graph.steps.get(id).and_then(|s| s.next());
    }

    Err(ConfigurationError::Cycle(trail))
}

/// Step identifiers in the order a run visits them, starting at `start_at`.
///
/// Stops at the first repeated step, so it is safe on unvalidated graphs.
pub fn execution_order(graph: &WorkflowGraph) -> Vec<String> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    let mut current = graph.steps.get_key_value(&graph.start_at);

    while let Some((id, step)) = current {
        if !seen.insert(id.as_str()) {
            break;
        }
        order.push(id.clone());
        current = step.next().and_then(|next| graph.steps.get_key_value(next));
    }

    order
}
