use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One YAML document of a manifest. Non-pipeline kinds deserialize too and
/// are skipped by [`Manifest::lookup`](crate::Manifest::lookup).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Pipeline {
    pub kind: String,
    #[serde(rename = "type")]
    pub pipeline_type: String,
    pub name: String,
    pub steps: Vec<StepDef>,
    pub services: Vec<StepDef>,
    pub environment: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDef {
    pub name: String,
    pub image: String,
    pub commands: Vec<String>,
    pub environment: BTreeMap<String, serde_yaml::Value>,
    /// `ignore` keeps a non-zero exit from failing the stage.
    pub failure: Option<String>,
    pub detach: bool,
}

impl StepDef {
    pub fn ignores_failure(&self) -> bool {
        self.failure.as_deref() == Some("ignore")
    }
}
