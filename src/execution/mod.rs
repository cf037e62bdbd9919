//! Workflow Execution Module
//!
//! Runs workflow graphs: the interpreter loop, bounded fan-out of map
//! steps, the per-run context document and the task invokers.
//!
//! # Architecture
//!
//! - [`engine`]: Main execution engine driving a run step by step
//! - [`map`]: Concurrent, order-preserving map stage execution
//! - [`context`]: Path-addressed run document with derived element views
//! - [`invoker`]: Task invocation trait and in-process invokers
//! - [`command`]: Invoker running external executables
//! - [`result`]: Run outcome types
//! - [`record`]: Persisted run records

pub mod command;
pub mod context;
pub mod engine;
pub mod invoker;
pub mod map;
pub mod record;
pub mod result;

pub use command::{CommandInvoker, ResourceBinding};
pub use context::ExecutionContext;
pub use engine::{Engine, DEFAULT_CONCURRENCY};
pub use invoker::{FnInvoker, InvokerRegistry, TaskInvoker};
pub use record::RunRecordStore;
pub use result::{RunFailure, RunResult, RunStatus};
