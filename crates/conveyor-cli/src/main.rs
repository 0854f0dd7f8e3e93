//! CLI binary for running Conveyor pipeline stages locally.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use conveyor_pipeline::{EventEmitter, ExecConfig, Runner, Selection, StageEvent};
use conveyor_registry::RegistryClient;
use conveyor_runtime::ShellEngine;
use conveyor_types::Build;

#[derive(Parser)]
#[command(name = "conveyor", version, about = "Run pipeline stages locally with build provenance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Enable trace logging
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one stage of a pipeline file
    Exec(ExecArgs),

    /// Lint one stage of a pipeline file
    Lint {
        /// Path to the pipeline file
        #[arg(default_value = ".drone.yml")]
        source: PathBuf,

        /// Name of the pipeline (stage) to lint
        #[arg(long, default_value = conveyor_pipeline::DEFAULT_STAGE)]
        pipeline: String,
    },
}

#[derive(clap::Args, Debug)]
struct ExecArgs {
    /// Path to the pipeline file
    #[arg(default_value = ".drone.yml")]
    source: PathBuf,

    /// Name of the pipeline (stage) to execute
    #[arg(long, default_value = conveyor_pipeline::DEFAULT_STAGE)]
    pipeline: String,

    /// Run only these steps (repeatable); `clone` always runs
    #[arg(long)]
    include: Vec<String>,

    /// Skip these steps (repeatable); `clone` always runs
    #[arg(long)]
    exclude: Vec<String>,

    /// Resume the pipeline at this step
    #[arg(long)]
    resume_at: Option<String>,

    /// Stage timeout, e.g. 90s, 30m, 1h
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    timeout: Duration,

    /// Dotenv file whose variables are given to every step
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Build parameter KEY=VALUE (repeatable)
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Numeric build identifier
    #[arg(long, default_value = "1")]
    build_id: u64,

    /// Log file stem (default: derived from the pipeline file and stage)
    #[arg(long)]
    pipeline_id: Option<String>,

    /// Directory for JSON step logs (default: $CONVEYOR_HOME/logs)
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    /// Working directory steps run in (default: current directory)
    #[arg(short, long)]
    workdir: Option<PathBuf>,

    /// Don't write the provenance statement
    #[arg(long)]
    no_provenance: bool,

    /// Prefix console output with the step name and line number
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing; RUST_LOG wins over the flags
    let level = if cli.trace {
        "trace"
    } else if cli.debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Exec(args) => {
            let code = cmd_exec(args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Lint { source, pipeline } => {
            cmd_lint(&source, &pipeline)?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// exec
// ---------------------------------------------------------------------------

async fn cmd_exec(args: ExecArgs) -> anyhow::Result<i32> {
    let config = exec_config(&args)?;
    let workdir = match args.workdir {
        Some(ref dir) => std::fs::canonicalize(dir)?,
        None => std::env::current_dir()?,
    };

    tracing::info!(
        source = %config.source.display(),
        stage = %config.stage,
        workdir = %workdir.display(),
        logs = %config.logs_dir.display(),
        "Executing pipeline"
    );

    let engine = ShellEngine::new(workdir);
    let events = EventEmitter::default();
    let logger = tokio::spawn(log_events(events.subscribe()));
    let runner = Runner::new(Arc::new(engine), Arc::new(RegistryClient::new())).with_events(events);

    let report = runner.run(&config, interrupted()).await;
    drop(runner);
    let _ = logger.await;

    let report = report?;
    if let Some(ref path) = report.provenance {
        println!("Provenance: {}", path.display());
    }
    println!("Logs: {}", report.log_file.display());
    println!("Stage {}: {:?}", report.stage.name, report.stage.status);
    Ok(report.exit_code())
}

fn exec_config(args: &ExecArgs) -> anyhow::Result<ExecConfig> {
    let logs_dir = args.logs_dir.clone().unwrap_or_else(default_logs_dir);
    let mut config = ExecConfig::new(&args.source, logs_dir);

    config.stage = args.pipeline.clone();
    let mut selection = Selection::new()
        .include(args.include.iter().cloned())
        .exclude(args.exclude.iter().cloned());
    if let Some(ref name) = args.resume_at {
        selection = selection.resume_at(name.clone());
    }
    config.selection = selection;
    config.timeout = args.timeout;
    if let Some(ref path) = args.env_file {
        config.environ = load_env_file(path)?;
    }
    config.build = Build {
        id: args.build_id,
        params: args.params.iter().cloned().collect(),
    };
    config.pipeline_id = match args.pipeline_id {
        Some(ref id) => id.clone(),
        None => default_pipeline_id(&config.source, &config.stage)?,
    };
    config.provenance = !args.no_provenance;
    config.pretty = args.pretty;
    Ok(config)
}

/// Resolves when the process receives Ctrl-C.
async fn interrupted() -> String {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "received signal, terminating process".to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending().await
        }
    }
}

async fn log_events(mut rx: tokio::sync::broadcast::Receiver<StageEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match rx.recv().await {
            Ok(StageEvent::StepSkipped { step }) => tracing::info!(%step, "Step skipped"),
            Ok(StageEvent::StageCancelled { stage, reason }) => {
                eprintln!("{}", reason);
                tracing::debug!(%stage, "Stage cancelled");
            }
            Ok(event) => tracing::debug!(?event, "Stage event"),
            Err(RecvError::Lagged(n)) => tracing::debug!(missed = n, "Event logger lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// lint
// ---------------------------------------------------------------------------

fn cmd_lint(source: &Path, stage: &str) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(source)?;
    let manifest = conveyor_manifest::parse(&text)?;
    let pipeline = manifest.lookup(stage)?;
    let diagnostics = conveyor_manifest::lint(pipeline);

    if diagnostics.is_empty() {
        println!("Pipeline '{}' is valid", pipeline.name);
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            conveyor_manifest::Severity::Error => {
                has_error = true;
                "ERROR"
            }
            conveyor_manifest::Severity::Warning => "WARN",
        };
        match diag.step {
            Some(ref step) => println!("[{}] {} ({}): {}", severity, diag.rule, step, diag.message),
            None => println!("[{}] {}: {}", severity, diag.rule, diag.message),
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Value of the environment variable `name`, or `default` when unset or empty.
fn lookup_env_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

/// `$CONVEYOR_HOME/logs`, falling back to `~/.conveyor/logs`.
fn default_logs_dir() -> PathBuf {
    let fallback = dirs::home_dir()
        .map(|h| h.join(".conveyor"))
        .unwrap_or_else(|| PathBuf::from(".conveyor"));
    let home = lookup_env_or("CONVEYOR_HOME", &fallback.to_string_lossy());
    PathBuf::from(home).join("logs")
}

/// Stable id for a pipeline file and stage, so reruns append to the same log.
fn default_pipeline_id(source: &Path, stage: &str) -> anyhow::Result<String> {
    let abs = if source.is_absolute() {
        source.to_path_buf()
    } else {
        std::env::current_dir()?.join(source)
    };
    let mut hasher = Sha256::new();
    hasher.update(abs.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(stage.as_bytes());
    let digest = hex::encode(hasher.finalize());
    Ok(digest[..12].to_string())
}

fn load_env_file(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for item in dotenvy::from_path_iter(path)? {
        let (key, value) = item?;
        env.insert(key, value);
    }
    tracing::debug!(path = %path.display(), vars = env.len(), "Loaded env file");
    Ok(env)
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit): (&str, u64) = if let Some(val) = s.strip_suffix("ms") {
        return val
            .parse()
            .map(Duration::from_millis)
            .map_err(|e| format!("invalid duration: {}", e));
    } else if let Some(val) = s.strip_suffix('s') {
        (val, 1)
    } else if let Some(val) = s.strip_suffix('m') {
        (val, 60)
    } else if let Some(val) = s.strip_suffix('h') {
        (val, 3600)
    } else {
        return Err(format!("unknown duration format: {}", s));
    };
    let n: u64 = digits.parse().map_err(|e| format!("invalid duration: {}", e))?;
    let secs = n
        .checked_mul(unit)
        .ok_or_else(|| format!("duration too large: {}", s))?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("18446744073709551615h").is_err());
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn params() {
        assert_eq!(
            parse_param("branch=main").unwrap(),
            ("branch".to_string(), "main".to_string())
        );
        assert_eq!(
            parse_param("url=a=b").unwrap(),
            ("url".to_string(), "a=b".to_string())
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn pipeline_id_is_stable() {
        let a = default_pipeline_id(Path::new("/repo/.drone.yml"), "default").unwrap();
        let b = default_pipeline_id(Path::new("/repo/.drone.yml"), "default").unwrap();
        let c = default_pipeline_id(Path::new("/repo/.drone.yml"), "docs").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn env_file_is_loaded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "GOFLAGS=-mod=vendor\n# comment\nTOKEN_NAME=\"ci\"\n").unwrap();
        let env = load_env_file(&path).unwrap();
        assert_eq!(env["GOFLAGS"], "-mod=vendor");
        assert_eq!(env["TOKEN_NAME"], "ci");
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn exec_flags_become_config() {
        let cli = Cli::try_parse_from([
            "conveyor",
            "exec",
            "ci.yml",
            "--pipeline",
            "backend",
            "--exclude",
            "lint",
            "--exclude",
            "e2e",
            "--resume-at",
            "test",
            "--timeout",
            "90s",
            "--param",
            "branch=main",
            "--build-id",
            "7",
            "--pipeline-id",
            "run-7",
            "--logs-dir",
            "/tmp/logs",
            "--no-provenance",
        ])
        .unwrap();
        let Commands::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        let config = exec_config(&args).unwrap();

        assert_eq!(config.stage, "backend");
        assert_eq!(config.selection.exclude.len(), 2);
        assert_eq!(config.selection.resume_at.as_deref(), Some("test"));
        assert_eq!(config.timeout, Duration::from_secs(90));
        assert_eq!(config.build.id, 7);
        assert_eq!(config.build.params["branch"], "main");
        assert_eq!(config.pipeline_id, "run-7");
        assert_eq!(config.logs_dir, PathBuf::from("/tmp/logs"));
        assert!(!config.provenance);
    }

    #[test]
    fn exec_defaults() {
        let cli = Cli::try_parse_from(["conveyor", "exec"]).unwrap();
        let Commands::Exec(args) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(args.source, PathBuf::from(".drone.yml"));
        assert_eq!(args.pipeline, "default");
        assert_eq!(args.timeout, Duration::from_secs(3600));
        assert_eq!(args.build_id, 1);
        assert!(args.resume_at.is_none());
    }
}
