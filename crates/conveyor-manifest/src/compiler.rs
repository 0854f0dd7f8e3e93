//! Compiles a linted [`Pipeline`] into the ordered step list the runner executes.

use std::collections::BTreeMap;

use conveyor_types::{
    CompiledSpec, ConveyorError, ErrPolicy, PipelineResource, Result, RunPolicy, Step,
};

use crate::resource::{Pipeline, StepDef};

/// Compiler settings applied to every step.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    /// Environment shared by every step; step-level values win.
    pub environ: BTreeMap<String, String>,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Services are compiled first as detached steps, then steps in declared
    /// order. `number` is the zero-based position in the resulting list.
    pub fn compile(&self, pipeline: &Pipeline) -> Result<CompiledSpec> {
        let global_env = convert_environment(&pipeline.environment, "pipeline")?;

        let mut steps = Vec::with_capacity(pipeline.services.len() + pipeline.steps.len());
        for def in &pipeline.services {
            let mut step = self.compile_step(def, steps.len(), &global_env)?;
            step.detach = true;
            steps.push(step);
        }
        for def in &pipeline.steps {
            let step = self.compile_step(def, steps.len(), &global_env)?;
            steps.push(step);
        }

        tracing::debug!(pipeline = %pipeline.name, steps = steps.len(), "Pipeline compiled");
        Ok(CompiledSpec {
            pipeline: PipelineResource {
                kind: pipeline.kind.clone(),
                pipeline_type: pipeline.pipeline_type.clone(),
                name: pipeline.name.clone(),
            },
            steps,
            services: pipeline.services.iter().map(|s| s.name.clone()).collect(),
        })
    }

    fn compile_step(
        &self,
        def: &StepDef,
        number: usize,
        global_env: &BTreeMap<String, String>,
    ) -> Result<Step> {
        let mut environment = self.environ.clone();
        environment.extend(global_env.clone());
        environment.extend(convert_environment(&def.environment, &def.name)?);

        Ok(Step {
            name: def.name.clone(),
            number,
            image: def.image.clone(),
            commands: def.commands.clone(),
            environment,
            run_policy: RunPolicy::Always,
            err_policy: if def.ignores_failure() {
                ErrPolicy::Ignore
            } else {
                ErrPolicy::Fail
            },
            detach: def.detach,
            labels: BTreeMap::new(),
        })
    }
}

/// Scalars become strings; anything else (e.g. `from_secret` mappings) is rejected.
fn convert_environment(
    env: &BTreeMap<String, serde_yaml::Value>,
    owner: &str,
) -> Result<BTreeMap<String, String>> {
    env.iter()
        .map(|(key, value)| {
            let s = match value {
                serde_yaml::Value::String(s) => s.clone(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Null => String::new(),
                _ => {
                    return Err(ConveyorError::CompileError(format!(
                        "{}: environment variable '{}' must be a scalar",
                        owner, key
                    )))
                }
            };
            Ok((key.clone(), s))
        })
        .collect()
}
