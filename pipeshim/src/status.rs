//! Current-step and upcoming-steps store read by the status renderer.
//!
//! Two independent guards:
//! - **current step**: RwLock, written by the running operation
//! - **upcoming queue**: Mutex, so slow queue work never delays progress updates
//!
//! Readers get owned copies and never hold a guard while rendering.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Step shown when no operation is reporting progress.
pub const IDLE_STEP: &str = "Idle - Waiting for commands";

/// Placeholder returned by [`TaskStatusStore::peek_upcoming`] on an empty queue.
pub const NO_UPCOMING_STEPS: &str = "No upcoming steps";

#[derive(Debug, Clone)]
struct CurrentStep {
    description: Arc<str>,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl CurrentStep {
    fn new(description: &str) -> Self {
        Self {
            description: Arc::from(description),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }
}

#[derive(Debug)]
pub struct TaskStatusStore {
    current: RwLock<CurrentStep>,
    upcoming: Mutex<VecDeque<String>>,
}

impl Default for TaskStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStatusStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(CurrentStep::new(IDLE_STEP)),
            upcoming: Mutex::new(VecDeque::new()),
        }
    }

    // Poisoning only means a writer panicked mid-operation; every write here
    // replaces whole values, so the inner data is still consistent.
    fn read_current(&self) -> RwLockReadGuard<'_, CurrentStep> {
        self.current.read().unwrap_or_else(|poisoned| {
            tracing::error!("Current step lock poisoned - recovering");
            poisoned.into_inner()
        })
    }

    fn write_current(&self) -> RwLockWriteGuard<'_, CurrentStep> {
        self.current.write().unwrap_or_else(|poisoned| {
            tracing::error!("Current step lock poisoned - recovering");
            poisoned.into_inner()
        })
    }

    fn lock_upcoming(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.upcoming.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Upcoming steps lock poisoned - recovering");
            poisoned.into_inner()
        })
    }

    /// Replace the current step and restart its clock.
    pub fn set_current_step(&self, description: impl AsRef<str>) {
        let step = CurrentStep::new(description.as_ref());
        tracing::debug!(step = %step.description, "Current step");
        *self.write_current() = step;
    }

    /// Return to [`IDLE_STEP`].
    pub fn reset_current_step(&self) {
        self.set_current_step(IDLE_STEP);
    }

    pub fn current_step(&self) -> String {
        self.read_current().description.to_string()
    }

    pub fn step_started_at(&self) -> DateTime<Utc> {
        self.read_current().started_at
    }

    pub fn elapsed_since_step_start(&self) -> Duration {
        self.read_current().started.elapsed()
    }

    pub fn enqueue_upcoming(&self, description: impl Into<String>) {
        let description = description.into();
        tracing::debug!(step = %description, "Upcoming step added");
        self.lock_upcoming().push_back(description);
    }

    pub fn dequeue_upcoming(&self) -> Option<String> {
        self.lock_upcoming().pop_front()
    }

    /// First upcoming step without removing it, or [`NO_UPCOMING_STEPS`].
    pub fn peek_upcoming(&self) -> String {
        self.lock_upcoming()
            .front()
            .cloned()
            .unwrap_or_else(|| NO_UPCOMING_STEPS.to_string())
    }

    /// Independent copy of the queue, front first.
    pub fn list_upcoming(&self) -> Vec<String> {
        self.lock_upcoming().iter().cloned().collect()
    }

    pub fn clear_upcoming(&self) {
        self.lock_upcoming().clear();
        tracing::debug!("Upcoming steps cleared");
    }

    pub fn upcoming_len(&self) -> usize {
        self.lock_upcoming().len()
    }

    pub fn has_upcoming(&self) -> bool {
        !self.lock_upcoming().is_empty()
    }

    /// Point-in-time copy for renderers.
    pub fn snapshot(&self) -> StatusSnapshot {
        let current = self.read_current().clone();
        StatusSnapshot {
            current_step: current.description.to_string(),
            step_started_at: current.started_at,
            elapsed: current.started.elapsed(),
            upcoming: self.list_upcoming(),
        }
    }
}

/// Everything a status panel shows, detached from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub current_step: String,
    pub step_started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub upcoming: Vec<String>,
}

impl StatusSnapshot {
    /// Upcoming steps shown by [`render`](Self::render).
    pub const MAX_UPCOMING_SHOWN: usize = 3;

    /// Text panel with lines truncated to `width` characters.
    pub fn render(&self, width: usize) -> String {
        let current = format!(
            "{} ({})",
            self.current_step,
            format_elapsed(self.elapsed)
        );
        let mut out = format!("Current: {}\n", truncate(&current, width));

        out.push_str("Upcoming Steps:\n");
        if self.upcoming.is_empty() {
            out.push_str("  ");
            out.push_str(NO_UPCOMING_STEPS);
            out.push('\n');
        }
        for (i, step) in self
            .upcoming
            .iter()
            .take(Self::MAX_UPCOMING_SHOWN)
            .enumerate()
        {
            out.push_str(&format!("  {}. {}\n", i + 1, truncate(step, width)));
        }
        out
    }
}

impl std::fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render(45))
    }
}

/// `mm:ss`, minutes unbounded.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let keep = width.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}
