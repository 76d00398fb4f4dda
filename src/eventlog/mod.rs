//! Stage and step progress reporting.
//!
//! Every component that performs user-visible work opens a [`Stage`] and
//! records one [`Step`] per unit of work. Steps move through
//! `Started -> Finished | Failed`, or go straight to `Skipped` when the work
//! has already been done by an earlier run.

pub mod console;
pub mod recording;

pub use console::ConsoleEventLogger;
pub use recording::RecordingEventLogger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    Started,
    Finished,
    Failed,
    Skipped,
}

/// A single progress transition. `task` is `None` for stage-level events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub time: DateTime<Utc>,
    pub stage: String,
    pub task: Option<String>,
    pub index: usize,
    pub state: EventState,
    pub message: Option<String>,
}

/// Sink for progress events.
pub trait EventLogger: Send + Sync {
    fn add_event(&self, event: Event);
}

#[derive(Clone)]
pub struct Stage {
    name: String,
    logger: Arc<dyn EventLogger>,
    step_count: Arc<AtomicUsize>,
}

impl Stage {
    pub fn new(logger: Arc<dyn EventLogger>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logger,
            step_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) {
        self.emit(EventState::Started, None);
    }

    pub fn finish(&self) {
        self.emit(EventState::Finished, None);
    }

    pub fn fail(&self, message: impl Into<String>) {
        self.emit(EventState::Failed, Some(message.into()));
    }

    pub fn new_step(&self, name: impl Into<String>) -> Step {
        let index = self.step_count.fetch_add(1, Ordering::SeqCst) + 1;
        Step {
            stage: self.name.clone(),
            name: name.into(),
            index,
            logger: self.logger.clone(),
        }
    }

    /// Run `work` as a step, recording `Finished` or `Failed` with the
    /// innermost error message.
    pub async fn perform<T, E, F>(&self, name: impl Into<String>, work: F) -> Result<T, E>
    where
        E: Error + 'static,
        F: Future<Output = Result<T, E>>,
    {
        let step = self.new_step(name);
        step.start();
        match work.await {
            Ok(value) => {
                step.finish();
                Ok(value)
            }
            Err(e) => {
                step.fail(failure_message(&e));
                Err(e)
            }
        }
    }

    fn emit(&self, state: EventState, message: Option<String>) {
        self.logger.add_event(Event {
            time: Utc::now(),
            stage: self.name.clone(),
            task: None,
            index: 0,
            state,
            message,
        });
    }
}

/// Message of the innermost error in `error`'s source chain. Failed steps
/// and stages record this rather than the wrapped text.
pub fn failure_message(error: &(dyn Error + 'static)) -> String {
    let mut current = error;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}

pub struct Step {
    stage: String,
    name: String,
    index: usize,
    logger: Arc<dyn EventLogger>,
}

impl Step {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) {
        self.emit(EventState::Started, None);
    }

    pub fn finish(&self) {
        self.emit(EventState::Finished, None);
    }

    pub fn fail(&self, message: impl Into<String>) {
        self.emit(EventState::Failed, Some(message.into()));
    }

    pub fn skip(&self, message: impl Into<String>) {
        self.emit(EventState::Skipped, Some(message.into()));
    }

    fn emit(&self, state: EventState, message: Option<String>) {
        self.logger.add_event(Event {
            time: Utc::now(),
            stage: self.stage.clone(),
            task: Some(self.name.clone()),
            index: self.index,
            state,
            message,
        });
    }
}
