//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating step graphs.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (StepDefinition, WorkflowGraph)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Load-time validation (transitions, cycles, paths)
//! - [`path`]: Context path expressions
//! - [`template`]: Parameter projection templates

pub mod model;
pub mod parser;
pub mod path;
pub mod template;
pub mod validator;

pub use model::{MapStep, StepDefinition, TaskStep, WorkflowGraph};
pub use parser::{load_workflow, parse_workflow, save_workflow, WorkflowDocument};
pub use path::ContextPath;
pub use template::Template;
pub use validator::{execution_order, validate_graph};
