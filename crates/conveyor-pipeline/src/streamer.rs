//! Per-step log capture.
//!
//! A [`Streamer`] hands out one [`LogWriter`] per step. The JSON file streamer
//! appends one record per output line to `<logs dir>/<pipeline id>.log`; all
//! writers of a run share that file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use conveyor_types::{ConveyorError, Result, Stage};

use crate::sequence::Sequence;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Write sink for a single step's output.
pub trait LogWriter: Write + Send {
    /// Signals end of output. Always succeeds for the built-in writers.
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Opens log sinks for the steps of a stage.
pub trait Streamer: Send + Sync {
    /// Open a writer for `step`, which must be on the stage roster.
    fn stream(&self, stage: &Stage, step: &str) -> Result<Box<dyn LogWriter>>;
}

fn roster_entry(stage: &Stage, step: &str) -> Result<(usize, String)> {
    stage
        .step(step)
        .map(|s| (s.number, s.name.clone()))
        .ok_or_else(|| ConveyorError::UnknownStep {
            stage: stage.name.clone(),
            step: step.to_string(),
        })
}

/// Split a write into lines. One trailing newline is dropped first so
/// `"a\n"` yields a single line. CRLF endings lose their `\r`.
pub fn split_lines(buf: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(buf);
    let text = text.strip_suffix('\n').unwrap_or(text.as_ref());
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// JSON file streamer
// ---------------------------------------------------------------------------

/// One line of step output as stored in the log file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub step_number: usize,
    pub step_name: String,
    pub line: String,
    /// One-based position of the line within its step's output.
    pub pos: u64,
}

/// Appends JSON-lines records for every step of a run to a single file.
pub struct JsonFileStreamer {
    log_file: PathBuf,
    file: Arc<Mutex<File>>,
    streams: Sequence,
}

impl JsonFileStreamer {
    /// Create (or reopen for append) `<logs_dir>/<pipeline_id>.log`.
    pub fn new(logs_dir: &Path, pipeline_id: &str) -> Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let log_file = logs_dir.join(format!("{}.log", pipeline_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;
        tracing::debug!(path = %log_file.display(), "Opened step log file");
        Ok(Self {
            log_file,
            file: Arc::new(Mutex::new(file)),
            streams: Sequence::new(),
        })
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Number of writers opened so far.
    pub fn streams_opened(&self) -> u64 {
        self.streams.current()
    }
}

impl Streamer for JsonFileStreamer {
    fn stream(&self, stage: &Stage, step: &str) -> Result<Box<dyn LogWriter>> {
        let (number, name) = roster_entry(stage, step)?;
        let stream = self.streams.next();
        tracing::trace!(step = %name, number, stream, "Opening JSON log stream");
        let file: Arc<Mutex<dyn Write + Send>> = self.file.clone();
        Ok(Box::new(JsonLineWriter {
            file,
            number,
            name,
            pos: 0,
        }))
    }
}

/// Writer returned by [`JsonFileStreamer`]. Each writer counts its own lines.
pub struct JsonLineWriter {
    file: Arc<Mutex<dyn Write + Send>>,
    number: usize,
    name: String,
    pos: u64,
}

impl JsonLineWriter {
    #[cfg(test)]
    fn over(file: Arc<Mutex<dyn Write + Send>>, number: usize, name: &str) -> Self {
        Self {
            file,
            number,
            name: name.to_string(),
            pos: 0,
        }
    }

    fn append(&mut self, line: String) -> io::Result<()> {
        self.pos += 1;
        let record = LogRecord {
            step_number: self.number,
            step_name: self.name.clone(),
            line,
            pos: self.pos,
        };
        let mut json = serde_json::to_vec(&record)?;
        json.push(b'\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file lock poisoned"))?;
        file.write_all(&json)
    }
}

impl Write for JsonLineWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Lines before a failed append stay written; the rest are dropped.
        for line in split_lines(buf) {
            self.append(line)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock() {
            Ok(mut file) => file.flush(),
            Err(_) => Ok(()),
        }
    }
}

impl LogWriter for JsonLineWriter {
    fn close(&mut self) -> io::Result<()> {
        tracing::debug!(step = %self.name, lines = self.pos, "Closing step log stream");
        let _ = self.flush();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Console streamer
// ---------------------------------------------------------------------------

/// Echoes step output to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleStreamer {
    pretty: bool,
}

impl ConsoleStreamer {
    /// With `pretty`, every line is prefixed `[<step>:<n>]`.
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }
}

impl Streamer for ConsoleStreamer {
    fn stream(&self, stage: &Stage, step: &str) -> Result<Box<dyn LogWriter>> {
        let (_, name) = roster_entry(stage, step)?;
        Ok(Box::new(ConsoleWriter {
            out: Box::new(io::stdout()),
            name,
            pretty: self.pretty,
            pos: 0,
        }))
    }
}

pub struct ConsoleWriter {
    out: Box<dyn Write + Send>,
    name: String,
    pretty: bool,
    pos: u64,
}

impl ConsoleWriter {
    fn render(&mut self, line: &str) -> String {
        self.pos += 1;
        if self.pretty {
            format!("[{}:{}] {}\n", self.name, self.pos, line)
        } else {
            format!("{}\n", line)
        }
    }
}

impl Write for ConsoleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        for line in split_lines(buf) {
            let rendered = self.render(&line);
            self.out.write_all(rendered.as_bytes())?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl LogWriter for ConsoleWriter {}

// ---------------------------------------------------------------------------
// Tee
// ---------------------------------------------------------------------------

/// Fans every write out to several streamers.
pub struct TeeStreamer {
    streamers: Vec<Arc<dyn Streamer>>,
}

impl TeeStreamer {
    pub fn new(streamers: Vec<Arc<dyn Streamer>>) -> Self {
        Self { streamers }
    }
}

impl Streamer for TeeStreamer {
    fn stream(&self, stage: &Stage, step: &str) -> Result<Box<dyn LogWriter>> {
        let writers = self
            .streamers
            .iter()
            .map(|s| s.stream(stage, step))
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(TeeWriter { writers }))
    }
}

pub struct TeeWriter {
    writers: Vec<Box<dyn LogWriter>>,
}

impl Write for TeeWriter {
    /// Every writer sees the buffer; the first failure is reported.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut first_err = None;
        for writer in &mut self.writers {
            if let Err(e) = writer.write_all(buf) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        for writer in &mut self.writers {
            writer.flush()?;
        }
        Ok(())
    }
}

impl LogWriter for TeeWriter {
    fn close(&mut self) -> io::Result<()> {
        for writer in &mut self.writers {
            if let Err(e) = writer.close() {
                tracing::warn!(error = %e, "Log writer failed to close");
            }
        }
        Ok(())
    }
}
