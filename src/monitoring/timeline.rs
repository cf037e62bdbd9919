//! Execution Timeline
//!
//! Tracks start/end times of top-level steps and map elements for
//! run reports and Gantt charts.
//!
//! Labels identify what ran: `aggregate` for a top-level step,
//! `process_repositories[2]` for an element of a map step and
//! `process_repositories[2]/process_chunks[0]` for nested elements.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step or element started executing
    Started,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub label: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Timeline shared between concurrently running map elements.
pub type SharedTimeline = Arc<Mutex<ExecutionTimeline>>;

/// Records when steps and elements start, complete, or fail.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Creates a timeline ready to be shared across tasks.
    pub fn shared() -> SharedTimeline {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Records an event.
    pub fn add_event(&mut self, label: impl Into<String>, event_type: EventType) {
        self.events.push(TimelineEvent {
            label: label.into(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Labels that started but have not finished.
    pub fn in_flight(&self) -> Vec<String> {
        let mut open: Vec<String> = Vec::new();
        for event in &self.events {
            match event.event_type {
                EventType::Started => open.push(event.label.clone()),
                EventType::Completed | EventType::Failed => open.retain(|l| *l != event.label),
            }
        }
        open
    }

    /// Finished durations in milliseconds, keyed by label.
    pub fn durations_ms(&self) -> BTreeMap<String, u64> {
        let mut starts: HashMap<&str, Instant> = HashMap::new();
        let mut durations = BTreeMap::new();

        for event in &self.events {
            match event.event_type {
                EventType::Started => {
                    starts.insert(&event.label, event.timestamp);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.get(event.label.as_str()) {
                        let millis = event.timestamp.duration_since(*start).as_millis();
                        durations.insert(event.label.clone(), u64::try_from(millis).unwrap_or(u64::MAX));
                    }
                }
            }
        }

        durations
    }

    /// Generates an ASCII Gantt chart.
    ///
    /// Each label is shown as a bar indicating when it ran relative to the
    /// total execution time. Failed entries are marked with `!`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.start_time.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut spans: HashMap<&str, (u128, Option<(u128, EventType)>)> = HashMap::new();
        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            match event.event_type {
                EventType::Started => {
                    spans.insert(&event.label, (elapsed, None));
                }
                finished => {
                    if let Some(span) = spans.get_mut(event.label.as_str()) {
                        span.1 = Some((elapsed, finished));
                    }
                }
            }
        }

        let mut sorted: Vec<_> = spans.into_iter().collect();
        sorted.sort_by(|a, b| a.1 .0.cmp(&b.1 .0).then_with(|| a.0.cmp(&b.0)));

        for (label, (start, end)) in sorted {
            let Some((end, outcome)) = end else {
                continue;
            };

            let start_pos = (start as f64 * scale) as usize;
            let width = ((end.saturating_sub(start)) as f64 * scale).max(1.0) as usize;
            let mark = if outcome == EventType::Failed { "!" } else { "#" };

            output.push_str(&format!(
                "{:24} |{}{}| ({} ms)\n",
                truncate(label, 24),
                " ".repeat(start_pos),
                mark.repeat(width),
                end.saturating_sub(start)
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Records an event on a shared timeline. A poisoned lock is recovered.
pub fn record(timeline: &SharedTimeline, label: &str, event_type: EventType) {
    let mut guard = match timeline.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.add_event(label, event_type);
}

/// Truncates a label to a maximum width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.get_events().is_empty());
    }

    #[test]
    fn test_durations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("list", EventType::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.add_event("list", EventType::Completed);

        let durations = timeline.durations_ms();
        assert!(durations["list"] >= 30);
    }

    #[test]
    fn test_failed_event_has_duration() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("repos[1]", EventType::Started);
        timeline.add_event("repos[1]", EventType::Failed);

        assert!(timeline.durations_ms().contains_key("repos[1]"));
        assert_eq!(timeline.get_events()[1].event_type, EventType::Failed);
    }

    #[test]
    fn test_durations_only_started() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("list", EventType::Started);

        assert!(timeline.durations_ms().is_empty());
        assert_eq!(timeline.in_flight(), vec!["list"]);
    }

    #[test]
    fn test_in_flight_tracks_open_labels() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("a", EventType::Started);
        timeline.add_event("b", EventType::Started);
        timeline.add_event("a", EventType::Completed);

        assert_eq!(timeline.in_flight(), vec!["b"]);
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();

        timeline.add_event("list", EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("list", EventType::Completed);

        timeline.add_event("repos[0]", EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("repos[0]", EventType::Failed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("list"));
        assert!(chart.contains("repos[0]"));
        assert!(chart.contains('!'));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.gantt_chart().contains("Timeline"));
    }

    #[test]
    fn test_shared_record() {
        let timeline = ExecutionTimeline::shared();
        record(&timeline, "x", EventType::Started);
        record(&timeline, "x", EventType::Completed);

        assert_eq!(timeline.lock().unwrap().get_events().len(), 2);
    }

    #[test]
    fn test_truncate_long_label() {
        let label = "process_repositories[12]/process_chunks[40]";
        let cut = truncate(label, 24);
        assert_eq!(cut.chars().count(), 24);
        assert!(cut.ends_with("..."));
    }
}
