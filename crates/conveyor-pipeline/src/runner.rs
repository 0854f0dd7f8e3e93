//! End-to-end run of one pipeline stage from a manifest on disk.
//!
//! Lifecycle: load, lint, compile, label, select, execute, attest.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use conveyor_manifest::{lint_or_raise, parse, Compiler};
use conveyor_registry::DigestResolver;
use conveyor_runtime::Engine;
use conveyor_types::{Build, Result, Stage};

use crate::events::EventEmitter;
use crate::executor::StageExecutor;
use crate::provenance::{assemble, write_statement};
use crate::selection::{build_roster, label_steps, Selection};
use crate::streamer::{ConsoleStreamer, JsonFileStreamer, Streamer, TeeStreamer};

pub const DEFAULT_STAGE: &str = "default";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything a single `exec` needs. Built once per run.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Pipeline manifest path.
    pub source: PathBuf,
    /// Stage (pipeline resource) name.
    pub stage: String,
    pub selection: Selection,
    /// Extra variables for every step, below the manifest's own environment.
    pub environ: BTreeMap<String, String>,
    pub build: Build,
    /// Stem of the JSON log file.
    pub pipeline_id: String,
    pub logs_dir: PathBuf,
    pub timeout: Duration,
    pub provenance: bool,
    /// Echo step output to stdout as well as the log file.
    pub console: bool,
    pub pretty: bool,
}

impl ExecConfig {
    pub fn new(source: impl Into<PathBuf>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            stage: DEFAULT_STAGE.to_string(),
            selection: Selection::default(),
            environ: BTreeMap::new(),
            build: Build {
                id: 1,
                params: BTreeMap::new(),
            },
            pipeline_id: "pipeline".to_string(),
            logs_dir: logs_dir.into(),
            timeout: DEFAULT_TIMEOUT,
            provenance: true,
            console: true,
            pretty: false,
        }
    }
}

/// What a finished run leaves behind.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub stage: Stage,
    pub log_file: PathBuf,
    pub provenance: Option<PathBuf>,
}

impl RunReport {
    /// Process exit code for the stage's final status.
    pub fn exit_code(&self) -> i32 {
        if self.stage.status.is_failed() {
            1
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct Runner {
    engine: Arc<dyn Engine>,
    resolver: Arc<dyn DigestResolver>,
    events: EventEmitter,
}

impl Runner {
    pub fn new(engine: Arc<dyn Engine>, resolver: Arc<dyn DigestResolver>) -> Self {
        Self {
            engine,
            resolver,
            events: EventEmitter::default(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Run the configured stage.
    ///
    /// Setup problems (unreadable manifest, unknown stage, lint or compile
    /// failure, unknown resume-at target) return `Err` before anything runs.
    /// An execution error dumps the stage roster to stdout and returns `Err`.
    /// Step failures, timeouts and `cancel` all end in `Ok` with the stage
    /// status set accordingly.
    pub async fn run<F>(&self, config: &ExecConfig, cancel: F) -> Result<RunReport>
    where
        F: Future<Output = String>,
    {
        let source = absolute(&config.source)?;
        let text = tokio::fs::read_to_string(&source).await?;
        let manifest = parse(&text)?;
        let pipeline = manifest.lookup(&config.stage)?;
        lint_or_raise(pipeline)?;

        let compiler = Compiler {
            environ: config.environ.clone(),
            ..Compiler::default()
        };
        let mut spec = compiler.compile(pipeline)?;
        label_steps(&mut spec, &pipeline.name, &config.selection, &source);
        config.selection.apply(&mut spec.steps)?;
        let mut stage = build_roster(&pipeline.name, &spec);

        let json = JsonFileStreamer::new(&config.logs_dir, &config.pipeline_id)?;
        let log_file = json.log_file().to_path_buf();
        let streamer: Arc<dyn Streamer> = if config.console {
            let sinks: Vec<Arc<dyn Streamer>> = vec![
                Arc::new(json),
                Arc::new(ConsoleStreamer::new(config.pretty)),
            ];
            Arc::new(TeeStreamer::new(sinks))
        } else {
            Arc::new(json)
        };

        let executor = StageExecutor::new(Arc::clone(&self.engine), streamer)
            .with_events(self.events.clone());
        let timeout = config.timeout;
        let cancel = async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => format!("timeout of {:?} exceeded", timeout),
                reason = cancel => reason,
            }
        };

        if let Err(e) = executor.exec(&spec, &mut stage, cancel).await {
            dump(&stage);
            return Err(e);
        }

        let provenance = if config.provenance {
            let statement = assemble(
                &spec.pipeline,
                &config.build,
                &spec.steps,
                self.resolver.as_ref(),
            )
            .await;
            write_statement(&statement, &source)
        } else {
            tracing::debug!("Provenance disabled");
            None
        };

        Ok(RunReport {
            stage,
            log_file,
            provenance,
        })
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Print the stage as indented JSON on stdout.
pub fn dump(stage: &Stage) {
    match serde_json::to_string_pretty(stage) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::error!(error = %e, "Could not serialize stage"),
    }
}
