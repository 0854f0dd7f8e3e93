//! Step execution for Conveyor: the `Engine` abstraction and a host-shell engine.

pub mod engine;
pub mod shell;

pub use engine::{Engine, StepState};
pub use shell::ShellEngine;
