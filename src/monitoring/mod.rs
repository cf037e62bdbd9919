//! Run Monitoring Module
//!
//! Provides utilities for tracking the execution timeline of workflow runs.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Step and map element start/end timing for Gantt charts

pub mod timeline;

pub use timeline::{record, EventType, ExecutionTimeline, SharedTimeline, TimelineEvent};
