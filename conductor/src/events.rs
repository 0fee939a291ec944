//! Structured progress events for presentation layers.

use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};

use crate::core::types::{Phase, Verdict};

/// One progress event. Serializes as `{"event": "task_started", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    PhaseStarted {
        phase: Phase,
        tasks: usize,
    },
    PhaseFinished {
        phase: Phase,
        completed: usize,
        failed: usize,
    },
    TaskStarted {
        task: String,
        attempt: u32,
    },
    TaskSucceeded {
        task: String,
        attempt: u32,
        checkpoint: Option<String>,
    },
    TaskFailed {
        task: String,
        attempts: u32,
        error: String,
    },
    /// A self-correction or rate-limit retry is about to run.
    TaskRetrying {
        task: String,
        attempt: u32,
        reason: String,
    },
    TaskCancelled {
        task: String,
    },
    ReviewCompleted {
        label: String,
        verdict: Verdict,
        round: u32,
    },
    ReplanRequested {
        iteration: u32,
    },
}

/// Receiver for progress events. Shared across workers.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &Event) {
        match event {
            Event::TaskFailed {
                task,
                attempts,
                error,
            } => warn!(task, attempts, error, "task failed"),
            Event::TaskCancelled { task } => warn!(task, "task cancelled"),
            other => info!(event = ?other, "progress"),
        }
    }
}

/// Writes each event as one JSON line.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: &Event) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        if let Err(err) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            warn!(err = %err, "failed to write event");
        }
    }
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &Event) {}
}
