//! Pipeline manifest loading for Conveyor.
//!
//! Parses `---`-separated YAML documents into [`Pipeline`] resources, lints
//! them, and compiles the selected one into a [`CompiledSpec`](conveyor_types::CompiledSpec).
//!
//! # Example
//! ```
//! let src = "kind: pipeline\ntype: docker\nname: default\nsteps:\n  - name: build\n    image: alpine\n";
//! let manifest = conveyor_manifest::parse(src).unwrap();
//! let pipeline = manifest.lookup("default").unwrap();
//! conveyor_manifest::lint_or_raise(pipeline).unwrap();
//! let spec = conveyor_manifest::Compiler::new().compile(pipeline).unwrap();
//! assert_eq!(spec.steps[0].name, "build");
//! ```

pub mod compiler;
pub mod lint;
mod parser;
pub mod resource;

pub use compiler::Compiler;
pub use lint::{lint, lint_or_raise, Diagnostic, LintRule, Severity};
pub use parser::{parse, Manifest};
pub use resource::{Pipeline, StepDef};
