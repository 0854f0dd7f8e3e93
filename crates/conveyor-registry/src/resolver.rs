use std::collections::HashMap;

use async_trait::async_trait;

use conveyor_types::{ConveyorError, Result};

// ---------------------------------------------------------------------------
// DigestResolver
// ---------------------------------------------------------------------------

/// Resolves an image reference to the hex content digest of its manifest.
#[async_trait]
pub trait DigestResolver: Send + Sync {
    /// Returns the lowercase hex sha256 digest, without the `sha256:` prefix.
    async fn resolve(&self, image: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// StaticResolver
// ---------------------------------------------------------------------------

/// In-memory resolver keyed by the image string exactly as written in the step.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    digests: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, image: impl Into<String>, hex: impl Into<String>) -> Self {
        self.digests.insert(image.into(), hex.into());
        self
    }
}

#[async_trait]
impl DigestResolver for StaticResolver {
    async fn resolve(&self, image: &str) -> Result<String> {
        self.digests
            .get(image)
            .cloned()
            .ok_or_else(|| ConveyorError::RegistryError {
                registry: "static".into(),
                reference: image.to_string(),
                status: 404,
                message: "image not known".into(),
            })
    }
}
