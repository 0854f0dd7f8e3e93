//! Stage execution loop.
//!
//! Runs the compiled steps in declared order against an [`Engine`], streaming
//! each step's output through a [`Streamer`] and recording status on the
//! [`Stage`] roster.

use std::future::Future;
use std::sync::Arc;

use conveyor_runtime::Engine;
use conveyor_types::{
    unix_now, CompiledSpec, ConveyorError, Result, Stage, StageStep, Status, Step,
};

use crate::events::{EventEmitter, StageEvent};
use crate::streamer::{LogWriter, Streamer};

/// Exit code recorded for a step that was running when the stage was cancelled.
pub const KILLED_EXIT_CODE: i32 = 137;

// ---------------------------------------------------------------------------
// StageExecutor
// ---------------------------------------------------------------------------

pub struct StageExecutor {
    engine: Arc<dyn Engine>,
    streamer: Arc<dyn Streamer>,
    events: EventEmitter,
}

impl StageExecutor {
    pub fn new(engine: Arc<dyn Engine>, streamer: Arc<dyn Streamer>) -> Self {
        Self {
            engine,
            streamer,
            events: EventEmitter::default(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Execute every roster step of `spec`, updating `stage` in place.
    ///
    /// Step failures are reported through the stage status and return `Ok`.
    /// `Err` is returned when the engine or the log streamer could not run a
    /// step. When `cancel` resolves, the running step and the stage become
    /// [`Status::Killed`] and the remaining steps are skipped.
    pub async fn exec<F>(&self, spec: &CompiledSpec, stage: &mut Stage, cancel: F) -> Result<()>
    where
        F: Future<Output = String>,
    {
        stage.status = Status::Running;
        stage.started = unix_now();
        let started = stage.started;
        self.events.emit(StageEvent::StageStarted {
            stage: stage.name.clone(),
            step_count: stage.steps.len(),
        });
        tracing::info!(stage = %stage.name, steps = stage.steps.len(), "Stage started");

        if let Err(e) = self.engine.setup(spec).await {
            tracing::error!(stage = %stage.name, error = %e, "Engine setup failed");
            for entry in &mut stage.steps {
                entry.status = Status::Skipped;
            }
            self.finish(stage, Status::Error, started);
            return Err(e);
        }

        tokio::pin!(cancel);
        let mut cancelled: Option<String> = None;
        let mut result: Result<()> = Ok(());

        for step in spec.steps.iter().filter(|s| !s.is_skipped()) {
            if cancelled.is_none() {
                // Pick up a cancellation that fired between steps.
                let fired = tokio::select! {
                    biased;
                    reason = &mut cancel => Some(reason),
                    _ = std::future::ready(()) => None,
                };
                if let Some(reason) = fired {
                    self.cancelled(stage, &reason);
                    cancelled = Some(reason);
                }
            }

            if cancelled.is_some() || stage.status != Status::Running {
                self.skip(stage, &step.name);
                continue;
            }

            match self.run_step(step, stage, cancel.as_mut()).await {
                StepOutcome::Finished => {}
                StepOutcome::Cancelled(reason) => {
                    self.cancelled(stage, &reason);
                    cancelled = Some(reason);
                }
                StepOutcome::Failed(e) => {
                    stage.status = Status::Error;
                    result = Err(e);
                }
            }
        }

        if let Err(e) = self.engine.destroy(spec).await {
            tracing::warn!(stage = %stage.name, error = %e, "Engine teardown failed");
        }

        let status = if stage.status == Status::Running {
            Status::Success
        } else {
            stage.status
        };
        self.finish(stage, status, started);
        result
    }

    async fn run_step<F>(
        &self,
        step: &Step,
        stage: &mut Stage,
        cancel: std::pin::Pin<&mut F>,
    ) -> StepOutcome
    where
        F: Future<Output = String>,
    {
        let mut writer = match self.streamer.stream(stage, &step.name) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(step = %step.name, error = %e, "Could not open step log stream");
                self.update(stage, &step.name, |entry| {
                    entry.status = Status::Error;
                    entry.stopped = unix_now();
                });
                return StepOutcome::Failed(e);
            }
        };

        let number = stage.step(&step.name).map(|s| s.number).unwrap_or_default();
        self.update(stage, &step.name, |entry| {
            entry.status = Status::Running;
            entry.started = unix_now();
        });
        self.events.emit(StageEvent::StepStarted {
            step: step.name.clone(),
            number,
        });
        tracing::debug!(step = %step.name, number, image = %step.image, "Step started");

        let ran = tokio::select! {
            r = self.engine.run(step, &mut writer) => Ok(r),
            reason = cancel => Err(reason),
        };
        close_writer(&step.name, writer.as_mut());

        let outcome = match ran {
            Err(reason) => {
                self.update(stage, &step.name, |entry| {
                    entry.status = Status::Killed;
                    entry.exit_code = KILLED_EXIT_CODE;
                });
                StepOutcome::Cancelled(reason)
            }
            Ok(Err(e)) => {
                tracing::error!(step = %step.name, error = %e, "Engine failed to run step");
                self.update(stage, &step.name, |entry| entry.status = Status::Error);
                StepOutcome::Failed(e)
            }
            Ok(Ok(state)) => {
                let mut fatal = false;
                self.update(stage, &step.name, |entry| {
                    entry.exit_code = state.exit_code;
                    if state.exit_code == 0 {
                        entry.status = Status::Success;
                    } else {
                        entry.status = Status::Failure;
                        fatal = !entry.err_ignore;
                    }
                });
                if fatal {
                    stage.status = Status::Failure;
                } else if state.exit_code != 0 {
                    tracing::info!(step = %step.name, exit_code = state.exit_code, "Ignoring step failure");
                }
                StepOutcome::Finished
            }
        };

        self.update(stage, &step.name, |entry| entry.stopped = unix_now());
        if let Some(entry) = stage.step(&step.name) {
            self.events.emit(StageEvent::StepFinished {
                step: entry.name.clone(),
                status: entry.status,
                exit_code: entry.exit_code,
            });
            tracing::info!(
                step = %entry.name,
                status = ?entry.status,
                exit_code = entry.exit_code,
                "Step finished"
            );
        }
        outcome
    }

    fn update(&self, stage: &mut Stage, name: &str, f: impl FnOnce(&mut StageStep)) {
        if let Some(entry) = stage.step_mut(name) {
            f(entry);
        }
    }

    fn cancelled(&self, stage: &mut Stage, reason: &str) {
        stage.status = Status::Killed;
        self.events.emit(StageEvent::StageCancelled {
            stage: stage.name.clone(),
            reason: reason.to_string(),
        });
        tracing::warn!(stage = %stage.name, %reason, "Stage cancelled");
    }

    fn skip(&self, stage: &mut Stage, name: &str) {
        self.update(stage, name, |entry| entry.status = Status::Skipped);
        self.events.emit(StageEvent::StepSkipped {
            step: name.to_string(),
        });
        tracing::debug!(step = %name, "Step skipped");
    }

    fn finish(&self, stage: &mut Stage, status: Status, started: i64) {
        stage.status = status;
        stage.stopped = unix_now();
        self.events.emit(StageEvent::StageFinished {
            stage: stage.name.clone(),
            status,
            duration_secs: stage.stopped - started,
        });
        tracing::info!(stage = %stage.name, status = ?status, "Stage finished");
    }
}

enum StepOutcome {
    Finished,
    Cancelled(String),
    Failed(ConveyorError),
}

fn close_writer(step: &str, writer: &mut dyn LogWriter) {
    if let Err(e) = writer.close() {
        tracing::warn!(step = %step, error = %e, "Closing step log stream failed");
    }
}
