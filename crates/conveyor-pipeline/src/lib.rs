//! Stage orchestration for Conveyor.
//!
//! This crate implements the local stage runner: step selection
//! (include/exclude/resume-at), per-step JSON log streaming with stable
//! sequence numbers, the sequential stage executor, and build provenance
//! assembly.

pub mod events;
pub mod executor;
pub mod provenance;
pub mod runner;
pub mod selection;
pub mod sequence;
pub mod streamer;

pub use events::{EventEmitter, StageEvent};
pub use executor::{StageExecutor, KILLED_EXIT_CODE};
pub use provenance::{
    assemble, provenance_path, write_statement, Material, Statement, BUILDER_ID, PREDICATE_TYPE,
    STATEMENT_TYPE,
};
pub use runner::{dump, ExecConfig, RunReport, Runner, DEFAULT_STAGE, DEFAULT_TIMEOUT};
pub use selection::{build_roster, label_steps, Selection};
pub use sequence::Sequence;
pub use streamer::{
    split_lines, ConsoleStreamer, JsonFileStreamer, LogRecord, LogWriter, Streamer, TeeStreamer,
};
