//! End-to-end tests for the Conveyor stage runner.
//!
//! Each test exercises the full run: write manifest -> compile -> select ->
//! execute -> stream logs -> write provenance -> verify.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use conveyor_pipeline::{
    EventEmitter, ExecConfig, LogRecord, Runner, Selection, StageEvent, Statement,
};
use conveyor_registry::StaticResolver;
use conveyor_runtime::{Engine, ShellEngine, StepState};
use conveyor_types::{CompiledSpec, ConveyorError, Result, Status, Step};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const MANIFEST: &str = r#"
kind: pipeline
type: docker
name: default

services:
  - name: cache
    image: redis:7

steps:
  - name: clone
    image: alpine/git
    commands:
      - git status
  - name: build
    image: golang:1.22
    commands:
      - go build ./...
  - name: test
    image: golang:1.22
    commands:
      - go test ./...
  - name: deploy
    image: plugins/deploy
---
kind: pipeline
type: exec
name: docs
steps:
  - name: render
    image: alpine
    commands:
      - echo rendering
      - echo done
"#;

/// Engine that echoes the step's commands and exits with a scripted code.
#[derive(Default)]
struct MockEngine {
    exits: HashMap<String, i32>,
    ran: Mutex<Vec<String>>,
}

impl MockEngine {
    fn failing(step: &str, code: i32) -> Self {
        let mut engine = Self::default();
        engine.exits.insert(step.to_string(), code);
        engine
    }

    fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn setup(&self, _spec: &CompiledSpec) -> Result<()> {
        Ok(())
    }

    async fn run(&self, step: &Step, output: &mut (dyn Write + Send)) -> Result<StepState> {
        self.ran.lock().unwrap().push(step.name.clone());
        for command in &step.commands {
            writeln!(output, "+ {}", command)?;
        }
        Ok(StepState::exited(*self.exits.get(&step.name).unwrap_or(&0)))
    }

    async fn destroy(&self, _spec: &CompiledSpec) -> Result<()> {
        Ok(())
    }
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".drone.yml"), MANIFEST).unwrap();
        Self { dir }
    }

    fn source(&self) -> PathBuf {
        self.dir.path().join(".drone.yml")
    }

    fn config(&self) -> ExecConfig {
        let mut config = ExecConfig::new(self.source(), self.dir.path().join("logs"));
        config.pipeline_id = "run-1".into();
        config.console = false;
        config
    }
}

fn resolver() -> Arc<StaticResolver> {
    Arc::new(
        StaticResolver::new()
            .with("alpine/git", "a".repeat(64))
            .with("golang:1.22", "b".repeat(64))
            .with("redis:7", "c".repeat(64)),
    )
}

fn never() -> std::future::Pending<String> {
    std::future::pending()
}

fn records(path: &Path) -> Vec<LogRecord> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn statuses(stage: &conveyor_types::Stage) -> Vec<(String, Status)> {
    stage
        .steps
        .iter()
        .map(|s| (s.name.clone(), s.status))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_run_succeeds_and_writes_artifacts() {
    let ws = Workspace::new();
    let engine = Arc::new(MockEngine::default());
    let runner = Runner::new(engine.clone(), resolver());

    let report = runner.run(&ws.config(), never()).await.unwrap();

    assert_eq!(report.stage.status, Status::Success);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(engine.ran(), vec!["cache", "clone", "build", "test", "deploy"]);

    let logs = records(&report.log_file);
    assert_eq!(report.log_file, ws.dir.path().join("logs").join("run-1.log"));
    let build: Vec<_> = logs.iter().filter(|r| r.step_name == "build").collect();
    assert_eq!(build.len(), 1);
    assert_eq!(build[0].line, "+ go build ./...");
    assert_eq!(build[0].step_number, 3);
    assert_eq!(build[0].pos, 1);

    let path = report.provenance.unwrap();
    assert_eq!(path, ws.dir.path().join(".drone.yml-provenance.json"));
    let statement: Statement =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(statement.predicate.build_type, "pipeline/docker");
    assert_eq!(statement.predicate.materials.len(), 5);
    // deploy's image is unknown to the resolver
    assert_eq!(statement.predicate.materials[4].sha256(), "");
}

#[tokio::test]
async fn selection_skips_steps_but_provenance_sees_all() {
    let ws = Workspace::new();
    let engine = Arc::new(MockEngine::default());
    let runner = Runner::new(engine.clone(), resolver());

    let mut config = ws.config();
    config.selection = Selection::new().exclude(["build", "clone"]).resume_at("test");

    let report = runner.run(&config, never()).await.unwrap();

    assert_eq!(engine.ran(), vec!["cache", "clone", "test", "deploy"]);
    let numbers: Vec<_> = report
        .stage
        .steps
        .iter()
        .map(|s| (s.name.as_str(), s.number))
        .collect();
    assert_eq!(
        numbers,
        vec![("cache", 1), ("clone", 2), ("test", 3), ("deploy", 4)]
    );

    let statement: Statement = serde_json::from_str(
        &std::fs::read_to_string(report.provenance.unwrap()).unwrap(),
    )
    .unwrap();
    let steps = &statement.predicate.build_config.steps;
    assert_eq!(steps.len(), 5);
    assert!(steps.iter().find(|s| s.name == "build").unwrap().is_skipped());
    assert_eq!(statement.predicate.materials.len(), 5);
}

#[tokio::test]
async fn step_failure_sets_exit_code() {
    let ws = Workspace::new();
    let engine = Arc::new(MockEngine::failing("build", 2));
    let runner = Runner::new(engine.clone(), resolver());

    let report = runner.run(&ws.config(), never()).await.unwrap();

    assert_eq!(report.stage.status, Status::Failure);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        statuses(&report.stage),
        vec![
            ("cache".to_string(), Status::Success),
            ("clone".to_string(), Status::Success),
            ("build".to_string(), Status::Failure),
            ("test".to_string(), Status::Skipped),
            ("deploy".to_string(), Status::Skipped),
        ]
    );
    // Provenance is still written for a failed build.
    assert!(report.provenance.is_some());
}

#[tokio::test]
async fn unknown_stage_fails_before_running() {
    let ws = Workspace::new();
    let engine = Arc::new(MockEngine::default());
    let runner = Runner::new(engine.clone(), resolver());

    let mut config = ws.config();
    config.stage = "release".into();
    let err = runner.run(&config, never()).await.unwrap_err();

    assert!(matches!(err, ConveyorError::StageNotFound { ref name } if name == "release"));
    assert!(err.is_setup_error());
    assert!(engine.ran().is_empty());
}

#[tokio::test]
async fn unknown_resume_target_fails_before_running() {
    let ws = Workspace::new();
    let engine = Arc::new(MockEngine::default());
    let runner = Runner::new(engine.clone(), resolver());

    let mut config = ws.config();
    config.selection = Selection::new().resume_at("publish");
    let err = runner.run(&config, never()).await.unwrap_err();

    assert!(matches!(err, ConveyorError::ResumeTargetNotFound { .. }));
    assert!(engine.ran().is_empty());
    assert!(!ws.dir.path().join("logs").exists());
}

#[tokio::test]
async fn missing_manifest_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let runner = Runner::new(Arc::new(MockEngine::default()), resolver());
    let config = ExecConfig::new(dir.path().join("nope.yml"), dir.path().join("logs"));

    let err = runner.run(&config, never()).await.unwrap_err();
    assert!(matches!(err, ConveyorError::Io(_)));
}

#[tokio::test]
async fn provenance_can_be_disabled() {
    let ws = Workspace::new();
    let runner = Runner::new(Arc::new(MockEngine::default()), resolver());
    let mut config = ws.config();
    config.provenance = false;

    let report = runner.run(&config, never()).await.unwrap();
    assert!(report.provenance.is_none());
    assert!(!ws.dir.path().join(".drone.yml-provenance.json").exists());
}

#[tokio::test]
async fn events_follow_the_run() {
    let ws = Workspace::new();
    let events = EventEmitter::new(64);
    let mut rx = events.subscribe();
    let runner = Runner::new(Arc::new(MockEngine::default()), resolver()).with_events(events);

    let mut config = ws.config();
    config.stage = "docs".into();
    runner.run(&config, never()).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(match event {
            StageEvent::StageStarted { .. } => "stage-started",
            StageEvent::StepStarted { .. } => "step-started",
            StageEvent::StepFinished { .. } => "step-finished",
            StageEvent::StageFinished { .. } => "stage-finished",
            _ => "other",
        });
    }
    assert_eq!(
        seen,
        vec!["stage-started", "step-started", "step-finished", "stage-finished"]
    );
}

#[tokio::test]
async fn shell_engine_streams_real_output() {
    let ws = Workspace::new();
    let engine = Arc::new(ShellEngine::new(ws.dir.path()));
    let runner = Runner::new(engine, resolver());

    let mut config = ws.config();
    config.stage = "docs".into();
    config.provenance = false;
    let report = runner.run(&config, never()).await.unwrap();

    assert_eq!(report.stage.status, Status::Success);
    let lines: Vec<_> = records(&report.log_file)
        .into_iter()
        .map(|r| (r.pos, r.line))
        .collect();
    assert_eq!(
        lines,
        vec![
            (1, "+ echo rendering".to_string()),
            (2, "rendering".to_string()),
            (3, "+ echo done".to_string()),
            (4, "done".to_string()),
        ]
    );
}

#[tokio::test]
async fn timeout_kills_the_stage() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(".drone.yml"),
        "kind: pipeline\ntype: exec\nname: default\nsteps:\n  - name: slow\n    image: alpine\n    commands:\n      - sleep 30\n  - name: after\n    image: alpine\n    commands:\n      - echo never\n",
    )
    .unwrap();
    let runner = Runner::new(Arc::new(ShellEngine::new(dir.path())), resolver());
    let mut config = ExecConfig::new(dir.path().join(".drone.yml"), dir.path().join("logs"));
    config.console = false;
    config.timeout = std::time::Duration::from_millis(200);

    let report = runner.run(&config, never()).await.unwrap();

    assert_eq!(report.stage.status, Status::Killed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        statuses(&report.stage),
        vec![
            ("slow".to_string(), Status::Killed),
            ("after".to_string(), Status::Skipped)
        ]
    );
    // Provenance still runs after a kill.
    assert!(report.provenance.is_some());
}

#[tokio::test]
async fn run_environ_reaches_shell_steps() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(".drone.yml"),
        "kind: pipeline\ntype: exec\nname: default\nenvironment:\n  TARGET: manifest\nsteps:\n  - name: greet\n    image: alpine\n    commands:\n      - echo $GREETING $TARGET\n",
    )
    .unwrap();
    let runner = Runner::new(Arc::new(ShellEngine::new(dir.path())), resolver());
    let mut config = ExecConfig::new(dir.path().join(".drone.yml"), dir.path().join("logs"));
    config.console = false;
    config.provenance = false;
    config.environ.insert("GREETING".into(), "hello".into());
    config.environ.insert("TARGET".into(), "env-file".into());

    let report = runner.run(&config, never()).await.unwrap();

    let lines: Vec<_> = records(&report.log_file).into_iter().map(|r| r.line).collect();
    assert_eq!(lines.last().map(String::as_str), Some("hello manifest"));
}
