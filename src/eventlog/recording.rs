use super::{Event, EventLogger, EventState};
use std::sync::Mutex;

/// Keeps every event in memory so callers can assert on step transitions.
#[derive(Default)]
pub struct RecordingEventLogger {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Names of stages in the order they were started.
    pub fn stages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.task.is_none() && e.state == EventState::Started)
            .map(|e| e.stage)
            .collect()
    }

    /// Step names of a stage in first-seen order.
    pub fn steps(&self, stage: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for event in self.events() {
            if event.stage != stage {
                continue;
            }
            if let Some(task) = event.task {
                if !names.contains(&task) {
                    names.push(task);
                }
            }
        }
        names
    }

    pub fn step_states(&self, stage: &str, step: &str) -> Vec<EventState> {
        self.events()
            .into_iter()
            .filter(|e| e.stage == stage && e.task.as_deref() == Some(step))
            .map(|e| e.state)
            .collect()
    }

    /// Message attached to the last transition of a step, if any.
    pub fn step_message(&self, stage: &str, step: &str) -> Option<String> {
        self.events()
            .into_iter()
            .filter(|e| e.stage == stage && e.task.as_deref() == Some(step))
            .filter_map(|e| e.message)
            .last()
    }
}

impl EventLogger for RecordingEventLogger {
    fn add_event(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
