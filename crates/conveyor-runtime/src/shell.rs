use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;

use conveyor_types::{CompiledSpec, ConveyorError, Result, Step};

use crate::engine::{Engine, StepState};

/// Engine that runs each step's commands with the host shell inside the
/// mounted working directory.
pub struct ShellEngine {
    working_dir: PathBuf,
    detached: Mutex<Vec<(String, Child)>>,
}

impl ShellEngine {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            detached: Mutex::new(Vec::new()),
        }
    }

    /// Filter environment variables, removing secrets and keeping safe defaults.
    fn filtered_env() -> HashMap<String, String> {
        let exclude_suffixes: &[&str] = &[
            "_api_key",
            "_secret",
            "_token",
            "_password",
            "_credential",
        ];
        std::env::vars()
            .filter(|(key, _)| {
                let lower = key.to_lowercase();
                !exclude_suffixes.iter().any(|s| lower.ends_with(s))
            })
            .collect()
    }

    fn command(&self, step: &Step) -> Command {
        let mut cmd = Command::new(SHELL);
        cmd.arg("-c")
            .arg(script(&step.commands))
            .current_dir(&self.working_dir)
            .env_clear()
            .envs(Self::filtered_env())
            .env("CI", "true")
            .env("CONVEYOR", "true")
            .env("CONVEYOR_STEP_NAME", &step.name)
            .env("CONVEYOR_STEP_NUMBER", step.number.to_string())
            .envs(&step.environment)
            .kill_on_drop(true);

        // On Unix, use process_group for clean kill
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        cmd
    }
}

const SHELL: &str = "/bin/sh";

/// `set -e` script that echoes each command before running it.
fn script(commands: &[String]) -> String {
    let mut out = String::from("set -e\n");
    for command in commands {
        out.push_str(&format!("echo + {}\n", shell_quote(command)));
        out.push_str(command);
        out.push('\n');
    }
    out
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn spawn_error(step: &Step, err: std::io::Error) -> ConveyorError {
    ConveyorError::EngineError {
        step: step.name.clone(),
        message: err.to_string(),
    }
}

#[async_trait]
impl Engine for ShellEngine {
    async fn setup(&self, spec: &CompiledSpec) -> Result<()> {
        if !tokio::fs::try_exists(&self.working_dir).await? {
            return Err(ConveyorError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("working directory {} does not exist", self.working_dir.display()),
            )));
        }
        tracing::debug!(
            pipeline = %spec.pipeline.name,
            workdir = %self.working_dir.display(),
            "Shell engine ready"
        );
        Ok(())
    }

    async fn run(&self, step: &Step, output: &mut (dyn Write + Send)) -> Result<StepState> {
        if step.commands.is_empty() {
            tracing::warn!(step = %step.name, image = %step.image, "Step has no commands; nothing to run on the host");
            return Ok(StepState::exited(0));
        }

        let mut cmd = self.command(step);

        if step.detach {
            cmd.stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null());
            let child = cmd.spawn().map_err(|e| spawn_error(step, e))?;
            tracing::debug!(step = %step.name, pid = ?child.id(), "Detached step started");
            self.detached.lock().await.push((step.name.clone(), child));
            return Ok(StepState::detached());
        }

        cmd.stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| spawn_error(step, e))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        // Raw lines: step output is not required to be UTF-8.
        let mut lines = SplitStream::new(BufReader::new(stdout).split(b'\n'))
            .merge(SplitStream::new(BufReader::new(stderr).split(b'\n')));

        // Output failures are logged once; the step keeps running.
        let mut sink_broken = false;
        while let Some(line) = lines.next().await {
            let mut buf = match line {
                Ok(buf) => buf,
                Err(e) => {
                    tracing::warn!(step = %step.name, error = %e, "Could not read step output");
                    continue;
                }
            };
            buf.push(b'\n');
            if sink_broken {
                continue;
            }
            if let Err(e) = output.write_all(&buf) {
                tracing::warn!(step = %step.name, error = %e, "Dropping step output");
                sink_broken = true;
            }
        }

        let status = child.wait().await?;
        Ok(StepState::exited(status.code().unwrap_or(-1)))
    }

    async fn destroy(&self, _spec: &CompiledSpec) -> Result<()> {
        let mut detached = self.detached.lock().await;
        for (name, mut child) in detached.drain(..) {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    // Send SIGTERM to the process group
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGTERM);
                    }
                }
            }
            let _ = child.kill().await;
            tracing::debug!(step = %name, "Detached step stopped");
        }
        Ok(())
    }
}
