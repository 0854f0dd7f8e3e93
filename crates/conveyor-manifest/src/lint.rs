//! Manifest lint rules and diagnostics.
//!
//! Call [`lint`] for advisory diagnostics or [`lint_or_raise`] to fail when any
//! `Error`-severity issue is found.

use std::collections::HashSet;

use conveyor_types::{ConveyorError, Result};

use crate::resource::Pipeline;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub step: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic>;
}

fn error(rule: &str, message: String, step: Option<&str>) -> Diagnostic {
    Diagnostic {
        rule: rule.into(),
        severity: Severity::Error,
        message,
        step: step.map(String::from),
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct KindRule;
impl LintRule for KindRule {
    fn name(&self) -> &str { "kind" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        if pipeline.kind == "pipeline" {
            vec![]
        } else {
            vec![error(
                self.name(),
                format!("Resource kind '{}' is not executable; expected 'pipeline'", pipeline.kind),
                None,
            )]
        }
    }
}

struct TypeRule;
impl LintRule for TypeRule {
    fn name(&self) -> &str { "type" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        match pipeline.pipeline_type.as_str() {
            "docker" | "exec" | "" => vec![],
            other => vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Pipeline type '{}' is not a local runner type", other),
                step: None,
            }],
        }
    }
}

struct PipelineNameRule;
impl LintRule for PipelineNameRule {
    fn name(&self) -> &str { "pipeline_name" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        if pipeline.name.trim().is_empty() {
            vec![error(self.name(), "Pipeline has no name".into(), None)]
        } else {
            vec![]
        }
    }
}

struct StepsPresentRule;
impl LintRule for StepsPresentRule {
    fn name(&self) -> &str { "steps_present" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        if pipeline.steps.is_empty() {
            vec![error(
                self.name(),
                format!("Pipeline '{}' declares no steps", pipeline.name),
                None,
            )]
        } else {
            vec![]
        }
    }
}

/// Step and service names must be non-empty and unique across both lists.
struct UniqueNameRule;
impl LintRule for UniqueNameRule {
    fn name(&self) -> &str { "unique_names" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        let mut diags = Vec::new();
        for def in pipeline.services.iter().chain(pipeline.steps.iter()) {
            if def.name.trim().is_empty() {
                diags.push(error(self.name(), "Step or service has an empty name".into(), None));
            } else if !seen.insert(def.name.as_str()) {
                diags.push(error(
                    self.name(),
                    format!("Duplicate step name '{}'", def.name),
                    Some(&def.name),
                ));
            }
        }
        diags
    }
}

struct ImageRule;
impl LintRule for ImageRule {
    fn name(&self) -> &str { "image" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        pipeline
            .services
            .iter()
            .chain(pipeline.steps.iter())
            .filter(|d| d.image.trim().is_empty())
            .map(|d| {
                error(
                    self.name(),
                    format!("Step '{}' has no image", d.name),
                    Some(&d.name),
                )
            })
            .collect()
    }
}

fn builtin_rules() -> Vec<Box<dyn LintRule>> {
    vec![
        Box::new(KindRule),
        Box::new(TypeRule),
        Box::new(PipelineNameRule),
        Box::new(StepsPresentRule),
        Box::new(UniqueNameRule),
        Box::new(ImageRule),
    ]
}

/// Run every built-in rule and collect the diagnostics.
pub fn lint(pipeline: &Pipeline) -> Vec<Diagnostic> {
    builtin_rules()
        .iter()
        .flat_map(|rule| rule.apply(pipeline))
        .collect()
}

/// Like [`lint`], but returns `Err` if any diagnostic has `Error` severity.
/// Warnings are logged and returned.
pub fn lint_or_raise(pipeline: &Pipeline) -> Result<Vec<Diagnostic>> {
    let diags = lint(pipeline);
    let errors: Vec<&str> = diags
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.as_str())
        .collect();
    if !errors.is_empty() {
        return Err(ConveyorError::LintError(errors.join("; ")));
    }
    for diag in &diags {
        tracing::warn!(rule = %diag.rule, "{}", diag.message);
    }
    Ok(diags)
}
