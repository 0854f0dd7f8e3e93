//! Step selection: include/exclude/resume-at directives become run policies.
//!
//! Steps are never removed. A deselected step keeps its place in the compiled
//! list with [`RunPolicy::Never`] so later consumers still see every step.

use std::collections::BTreeSet;
use std::path::Path;

use conveyor_types::{
    CompiledSpec, ConveyorError, ErrPolicy, Result, RunPolicy, Stage, StageStep, Step,
};

pub const LABEL_PIPELINE_FILE: &str = "io.conveyor.pipeline.file";
pub const LABEL_INCLUDES: &str = "io.conveyor.pipeline.includes";
pub const LABEL_EXCLUDES: &str = "io.conveyor.pipeline.excludes";
pub const LABEL_SERVICE: &str = "io.conveyor.pipeline.service";
pub const LABEL_STAGE_NAME: &str = "io.conveyor.stage.name";
pub const LABEL_STEP_NAME: &str = "io.conveyor.step.name";
pub const LABEL_STEP_NUMBER: &str = "io.conveyor.step.number";

/// Include/exclude/resume-at directives for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
    pub resume_at: Option<String>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn resume_at(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.resume_at = if name.is_empty() { None } else { Some(name) };
        self
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty() && self.resume_at.is_none()
    }

    /// Mark deselected steps [`RunPolicy::Never`].
    ///
    /// Phases run in order over the whole list: include, exclude, then
    /// resume-at. `clone` is exempt from all three. Fails without touching any
    /// step when the resume-at target is not in the list.
    pub fn apply(&self, steps: &mut [Step]) -> Result<()> {
        if let Some(ref target) = self.resume_at {
            if !steps.iter().any(|s| &s.name == target) {
                return Err(ConveyorError::ResumeTargetNotFound {
                    name: target.clone(),
                });
            }
        }

        if !self.include.is_empty() {
            for step in steps.iter_mut().filter(|s| !s.is_clone()) {
                if !self.include.contains(&step.name) {
                    step.run_policy = RunPolicy::Never;
                }
            }
        }

        if !self.exclude.is_empty() {
            for step in steps.iter_mut().filter(|s| !s.is_clone()) {
                if self.exclude.contains(&step.name) {
                    step.run_policy = RunPolicy::Never;
                }
            }
        }

        if let Some(ref target) = self.resume_at {
            for step in steps.iter_mut() {
                if &step.name == target {
                    break;
                }
                if step.is_clone() {
                    continue;
                }
                if self.exclude.contains(&step.name) {
                    step.run_policy = RunPolicy::Never;
                }
            }
        }

        let skipped = steps.iter().filter(|s| s.is_skipped()).count();
        tracing::debug!(total = steps.len(), skipped, "Step selection applied");
        Ok(())
    }
}

/// Attach the lookup labels every compiled step carries.
pub fn label_steps(
    spec: &mut CompiledSpec,
    stage_name: &str,
    selection: &Selection,
    pipeline_file: &Path,
) {
    let includes = join(&selection.include);
    let excludes = join(&selection.exclude);
    let file = pipeline_file.display().to_string();

    for (i, step) in spec.steps.iter_mut().enumerate() {
        let labels = &mut step.labels;
        labels.insert(LABEL_PIPELINE_FILE.into(), file.clone());
        labels.insert(LABEL_STAGE_NAME.into(), stage_name.trim().to_string());
        labels.insert(LABEL_STEP_NAME.into(), step.name.trim().to_string());
        labels.insert(LABEL_STEP_NUMBER.into(), i.to_string());
        if let Some(ref includes) = includes {
            labels.insert(LABEL_INCLUDES.into(), includes.clone());
        }
        if let Some(ref excludes) = excludes {
            labels.insert(LABEL_EXCLUDES.into(), excludes.clone());
        }
        if spec.services.iter().any(|svc| svc == &step.name) {
            labels.insert(LABEL_SERVICE.into(), "true".into());
        }
        tracing::trace!(step = %step.name, labels = ?step.labels, "Step labelled");
    }
}

fn join(names: &BTreeSet<String>) -> Option<String> {
    if names.is_empty() {
        None
    } else {
        Some(names.iter().cloned().collect::<Vec<_>>().join(","))
    }
}

/// Build the run roster: one entry per step that will run, numbered from 1.
pub fn build_roster(stage_name: &str, spec: &CompiledSpec) -> Stage {
    let mut stage = Stage::new(stage_name);
    stage.services = spec.services.clone();
    for step in spec.steps.iter().filter(|s| !s.is_skipped()) {
        let number = stage.steps.len() + 1;
        stage.steps.push(StageStep::new(
            number,
            step.name.clone(),
            step.err_policy == ErrPolicy::Ignore,
        ));
    }
    stage
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::PipelineResource;

    fn steps(names: &[&str]) -> Vec<Step> {
        names
            .iter()
            .enumerate()
            .map(|(i, n)| Step::new(*n, i, "alpine"))
            .collect()
    }

    fn runs(steps: &[Step]) -> Vec<(&str, bool)> {
        steps
            .iter()
            .map(|s| (s.name.as_str(), !s.is_skipped()))
            .collect()
    }

    #[test]
    fn empty_selection_runs_everything() {
        let mut list = steps(&["clone", "build", "test"]);
        Selection::new().apply(&mut list).unwrap();
        assert!(list.iter().all(|s| s.run_policy == RunPolicy::Always));
    }

    #[test]
    fn include_skips_unlisted_steps_but_not_clone() {
        let mut list = steps(&["clone", "build", "test"]);
        Selection::new().include(["build"]).apply(&mut list).unwrap();
        assert_eq!(
            runs(&list),
            vec![("clone", true), ("build", true), ("test", false)]
        );
    }

    #[test]
    fn exclude_skips_listed_steps() {
        let mut list = steps(&["clone", "build", "test"]);
        Selection::new().exclude(["test"]).apply(&mut list).unwrap();
        assert_eq!(
            runs(&list),
            vec![("clone", true), ("build", true), ("test", false)]
        );
    }

    #[test]
    fn clone_cannot_be_excluded() {
        let mut list = steps(&["clone", "build"]);
        Selection::new().exclude(["clone"]).apply(&mut list).unwrap();
        assert_eq!(runs(&list), vec![("clone", true), ("build", true)]);
    }

    #[test]
    fn exclude_wins_over_include() {
        let mut list = steps(&["clone", "build", "test"]);
        Selection::new()
            .include(["build", "test"])
            .exclude(["build"])
            .apply(&mut list)
            .unwrap();
        assert_eq!(
            runs(&list),
            vec![("clone", true), ("build", false), ("test", true)]
        );
    }

    #[test]
    fn resume_at_with_exclude() {
        let mut list = steps(&["clone", "build", "test", "deploy"]);
        Selection::new()
            .exclude(["build"])
            .resume_at("test")
            .apply(&mut list)
            .unwrap();
        assert_eq!(
            runs(&list),
            vec![
                ("clone", true),
                ("build", false),
                ("test", true),
                ("deploy", true)
            ]
        );
    }

    #[test]
    fn unknown_resume_target_is_an_error_and_changes_nothing() {
        let mut list = steps(&["clone", "build", "test"]);
        let err = Selection::new()
            .exclude(["build"])
            .resume_at("nope")
            .apply(&mut list)
            .unwrap_err();
        assert!(matches!(err, ConveyorError::ResumeTargetNotFound { ref name } if name == "nope"));
        assert!(err.is_setup_error());
        assert!(list.iter().all(|s| s.run_policy == RunPolicy::Always));
    }

    #[test]
    fn empty_resume_at_is_ignored() {
        let sel = Selection::new().resume_at("");
        assert!(sel.resume_at.is_none());
        assert!(sel.is_empty());
    }

    #[test]
    fn steps_keep_their_order() {
        let mut list = steps(&["clone", "a", "b", "c"]);
        Selection::new().include(["c"]).apply(&mut list).unwrap();
        let names: Vec<_> = list.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["clone", "a", "b", "c"]);
    }

    fn spec(names: &[&str], services: &[&str]) -> CompiledSpec {
        CompiledSpec {
            pipeline: PipelineResource {
                kind: "pipeline".into(),
                pipeline_type: "docker".into(),
                name: "default".into(),
            },
            steps: steps(names),
            services: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn labels_are_attached() {
        let mut spec = spec(&["db", "build"], &["db"]);
        let sel = Selection::new().include(["build", "db"]).exclude(["lint"]);
        label_steps(&mut spec, " default ", &sel, Path::new("/src/.drone.yml"));

        let db = &spec.steps[0].labels;
        assert_eq!(db[LABEL_STAGE_NAME], "default");
        assert_eq!(db[LABEL_STEP_NAME], "db");
        assert_eq!(db[LABEL_STEP_NUMBER], "0");
        assert_eq!(db[LABEL_INCLUDES], "build,db");
        assert_eq!(db[LABEL_EXCLUDES], "lint");
        assert_eq!(db[LABEL_SERVICE], "true");
        assert_eq!(db[LABEL_PIPELINE_FILE], "/src/.drone.yml");

        let build = &spec.steps[1].labels;
        assert_eq!(build[LABEL_STEP_NUMBER], "1");
        assert!(!build.contains_key(LABEL_SERVICE));
    }

    #[test]
    fn no_selection_labels_without_directives() {
        let mut spec = spec(&["build"], &[]);
        label_steps(&mut spec, "default", &Selection::new(), Path::new("p.yml"));
        assert!(!spec.steps[0].labels.contains_key(LABEL_INCLUDES));
        assert!(!spec.steps[0].labels.contains_key(LABEL_EXCLUDES));
    }

    #[test]
    fn roster_numbers_running_steps_from_one() {
        let mut spec = spec(&["clone", "build", "test", "deploy"], &[]);
        spec.steps[3].err_policy = ErrPolicy::Ignore;
        Selection::new().exclude(["build"]).apply(&mut spec.steps).unwrap();

        let stage = build_roster("default", &spec);
        let roster: Vec<_> = stage
            .steps
            .iter()
            .map(|s| (s.number, s.name.as_str(), s.err_ignore))
            .collect();
        assert_eq!(
            roster,
            vec![(1, "clone", false), (2, "test", false), (3, "deploy", true)]
        );
        assert!(stage.step("build").is_none());
    }
}
