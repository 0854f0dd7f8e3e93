//! Shared types and errors for the Conveyor local pipeline runner.
//!
//! This crate provides the foundational types used across all other Conveyor crates:
//! - `ConveyorError`: unified error taxonomy
//! - `Step` / `CompiledSpec`: the compiled step list handed over by the compiler
//! - `Stage` / `StageStep`: the runtime roster a run reports status against
//! - `Build`: build identity and parameters

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of the implicit checkout step. It is never subject to include/exclude filtering.
pub const CLONE_STEP: &str = "clone";

/// Unified error type for all Conveyor subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    // === Setup Errors ===
    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    #[error("stage '{name}' not found in build file")]
    StageNotFound { name: String },

    #[error("Pipeline lint failed: {0}")]
    LintError(String),

    #[error("Pipeline compile failed: {0}")]
    CompileError(String),

    #[error("Resume-at step '{name}' does not exist in the pipeline")]
    ResumeTargetNotFound { name: String },

    // === Streaming Errors ===
    #[error("No step named '{step}' in stage '{stage}'")]
    UnknownStep { stage: String, step: String },

    // === Execution Errors ===
    #[error("Engine failed on step '{step}': {message}")]
    EngineError { step: String, message: String },

    // === Registry Errors ===
    #[error("Registry {registry} returned HTTP {status} for {reference}: {message}")]
    RegistryError {
        registry: String,
        reference: String,
        status: u16,
        message: String,
    },

    #[error("Invalid image reference '{0}'")]
    InvalidReference(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ConveyorError {
    /// Returns `true` for errors that abort a run before any step executes.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            ConveyorError::ManifestParse(_)
                | ConveyorError::StageNotFound { .. }
                | ConveyorError::LintError(_)
                | ConveyorError::CompileError(_)
                | ConveyorError::ResumeTargetNotFound { .. }
        )
    }
}

/// A convenience alias for `Result<T, ConveyorError>`.
pub type Result<T> = std::result::Result<T, ConveyorError>;

// ---------------------------------------------------------------------------
// Step: one compiled unit of work
// ---------------------------------------------------------------------------

/// Whether a compiled step executes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPolicy {
    #[default]
    Always,
    Never,
}

/// What a non-zero exit of the step means for the stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrPolicy {
    #[default]
    Fail,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub name: String,
    /// Zero-based position in the compiled step list.
    pub number: usize,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub run_policy: RunPolicy,
    #[serde(default)]
    pub err_policy: ErrPolicy,
    /// Detached steps are started and left running as services.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub detach: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Step {
    pub fn new(name: impl Into<String>, number: usize, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            number,
            image: image.into(),
            commands: Vec::new(),
            environment: BTreeMap::new(),
            run_policy: RunPolicy::Always,
            err_policy: ErrPolicy::Fail,
            detach: false,
            labels: BTreeMap::new(),
        }
    }

    pub fn is_clone(&self) -> bool {
        self.name == CLONE_STEP
    }

    pub fn is_skipped(&self) -> bool {
        self.run_policy == RunPolicy::Never
    }
}

/// Identity of the pipeline resource a spec was compiled from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResource {
    pub kind: String,
    #[serde(rename = "type")]
    pub pipeline_type: String,
    pub name: String,
}

impl PipelineResource {
    /// `<kind>/<type>`, e.g. `pipeline/docker`.
    pub fn build_type(&self) -> String {
        format!("{}/{}", self.kind, self.pipeline_type)
    }
}

/// The compiler's output: an ordered step list plus the resource it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledSpec {
    pub pipeline: PipelineResource,
    pub steps: Vec<Step>,
    /// Names of steps that were declared as services.
    #[serde(default)]
    pub services: Vec<String>,
}

impl CompiledSpec {
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// Status / Stage: runtime roster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
    Error,
    Killed,
    Skipped,
}

impl Status {
    /// Terminal statuses that map to a non-zero process exit.
    pub fn is_failed(self) -> bool {
        matches!(self, Status::Failure | Status::Error | Status::Killed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStep {
    /// One-based position among the steps that will run.
    pub number: usize,
    pub name: String,
    pub status: Status,
    pub err_ignore: bool,
    pub exit_code: i32,
    /// Unix timestamps, zero until set.
    pub started: i64,
    pub stopped: i64,
}

impl StageStep {
    pub fn new(number: usize, name: impl Into<String>, err_ignore: bool) -> Self {
        Self {
            number,
            name: name.into(),
            status: Status::Pending,
            err_ignore,
            exit_code: 0,
            started: 0,
            stopped: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub status: Status,
    pub started: i64,
    pub stopped: i64,
    pub steps: Vec<StageStep>,
    pub services: Vec<String>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Look up a roster entry by exact name.
    pub fn step(&self, name: &str) -> Option<&StageStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: &str) -> Option<&mut StageStep> {
        self.steps.iter_mut().find(|s| s.name == name)
    }
}

/// Build identity. Parameters are kept ordered so serialized output is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: u64,
    pub params: BTreeMap<String, String>,
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
