use super::{Event, EventLogger, EventState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use tracing::debug;

/// Prints one line per stage/step transition.
///
/// ```text
/// Started uploading stemcell
/// Started uploading stemcell > Uploading... Done (00:00:12)
/// Done uploading stemcell
/// ```
pub struct ConsoleEventLogger {
    out: Mutex<Box<dyn Write + Send>>,
    started: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl Default for ConsoleEventLogger {
    fn default() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }
}

impl ConsoleEventLogger {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            started: Mutex::new(HashMap::new()),
        }
    }

    fn render(&self, event: &Event) -> String {
        let Some(task) = &event.task else {
            return match event.state {
                EventState::Started => format!("Started {}", event.stage),
                EventState::Finished => format!("Done {}\n", event.stage),
                EventState::Failed => format!(
                    "Failed {}: {}\n",
                    event.stage,
                    event.message.as_deref().unwrap_or("")
                ),
                EventState::Skipped => format!("Skipped {}\n", event.stage),
            };
        };

        let key = (event.stage.clone(), task.clone());
        let prefix = format!("Started {} > {}", event.stage, task);
        match event.state {
            EventState::Started => {
                if let Ok(mut started) = self.started.lock() {
                    started.insert(key, event.time);
                }
                format!("{prefix}...")
            }
            EventState::Finished => format!("{prefix}. Done ({})", self.elapsed(&key, event)),
            EventState::Failed => format!(
                "{prefix}. Failed '{}' ({})",
                event.message.as_deref().unwrap_or(""),
                self.elapsed(&key, event)
            ),
            EventState::Skipped => format!(
                "{prefix}. Skipped [{}] ({})",
                event.message.as_deref().unwrap_or(""),
                format_duration(chrono::Duration::zero())
            ),
        }
    }

    fn elapsed(&self, key: &(String, String), event: &Event) -> String {
        let started = self
            .started
            .lock()
            .ok()
            .and_then(|mut started| started.remove(key));
        let duration = started
            .map(|start| event.time - start)
            .unwrap_or_else(chrono::Duration::zero);
        format_duration(duration)
    }
}

fn format_duration(duration: chrono::Duration) -> String {
    let secs = duration.num_seconds().max(0);
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

impl EventLogger for ConsoleEventLogger {
    fn add_event(&self, event: Event) {
        debug!(
            "event stage={} task={:?} state={:?} message={:?}",
            event.stage, event.task, event.state, event.message
        );
        let line = self.render(&event);
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
    }
}
