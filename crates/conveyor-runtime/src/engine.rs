use std::io::Write;

use async_trait::async_trait;

use conveyor_types::{CompiledSpec, Result, Step};

/// Result of running one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepState {
    pub exit_code: i32,
    /// `false` for detached steps that are still running when `run` returns.
    pub exited: bool,
}

impl StepState {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            exited: true,
        }
    }

    pub fn detached() -> Self {
        Self {
            exit_code: 0,
            exited: false,
        }
    }
}

/// Abstraction over whatever actually executes compiled steps.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Prepare shared resources for the whole stage.
    async fn setup(&self, spec: &CompiledSpec) -> Result<()>;

    /// Run one step, writing its output line by line into `output`.
    ///
    /// A non-zero exit is reported through [`StepState`]; `Err` means the
    /// engine itself could not run the step.
    async fn run(&self, step: &Step, output: &mut (dyn Write + Send)) -> Result<StepState>;

    /// Tear down anything `setup` or detached steps left behind.
    async fn destroy(&self, spec: &CompiledSpec) -> Result<()>;
}
