use serde::Deserialize;

use conveyor_types::{ConveyorError, Result};

use crate::resource::Pipeline;

/// All documents of a multi-document manifest, in file order.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub resources: Vec<Pipeline>,
}

impl Manifest {
    /// Find the pipeline named `name`. Only `kind: pipeline` documents match.
    pub fn lookup(&self, name: &str) -> Result<&Pipeline> {
        self.resources
            .iter()
            .find(|r| r.kind == "pipeline" && r.name == name)
            .ok_or_else(|| ConveyorError::StageNotFound {
                name: name.to_string(),
            })
    }

    pub fn pipeline_names(&self) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|r| r.kind == "pipeline")
            .map(|r| r.name.as_str())
            .collect()
    }
}

/// Parse a `---`-separated YAML manifest. Empty documents are ignored.
pub fn parse(source: &str) -> Result<Manifest> {
    let mut resources = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(source).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| ConveyorError::ManifestParse(format!("document {}: {}", index + 1, e)))?;
        if value.is_null() {
            continue;
        }
        let resource: Pipeline = serde_yaml::from_value(value)
            .map_err(|e| ConveyorError::ManifestParse(format!("document {}: {}", index + 1, e)))?;
        resources.push(resource);
    }
    tracing::debug!(documents = resources.len(), "Manifest parsed");
    Ok(Manifest { resources })
}
