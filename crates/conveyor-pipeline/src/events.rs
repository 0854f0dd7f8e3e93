//! Stage event system for observability.
//!
//! Emits [`StageEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (the CLI logger, tests) can follow a run without coupling to the
//! executor internals.

use serde::{Deserialize, Serialize};

use conveyor_types::Status;

/// Events emitted while a stage executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageEvent {
    StageStarted {
        stage: String,
        step_count: usize,
    },
    StageFinished {
        stage: String,
        status: Status,
        duration_secs: i64,
    },
    StepStarted {
        step: String,
        number: usize,
    },
    StepFinished {
        step: String,
        status: Status,
        exit_code: i32,
    },
    StepSkipped {
        step: String,
    },
    StageCancelled {
        stage: String,
        reason: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<StageEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: StageEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<StageEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
