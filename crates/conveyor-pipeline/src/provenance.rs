//! Build provenance: an in-toto statement with a SLSA v0.2 predicate.
//!
//! The statement is written next to the pipeline file and never fails the
//! run. Materials are resolved best-effort, one per compiled step, in
//! declared order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use conveyor_registry::DigestResolver;
use conveyor_types::{Build, PipelineResource, Result, Step};

pub const STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v0.1";
pub const PREDICATE_TYPE: &str = "https://slsa.dev/provenance/v0.2";
pub const BUILDER_ID: &str = "https://conveyor.dev/attestations/local-runner";

/// Upper bound for one image digest lookup.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Algorithm name to hex digest.
pub type DigestSet = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    pub statement_type: String,
    pub predicate_type: String,
    pub subject: Vec<Subject>,
    pub predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
    pub digest: DigestSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    pub build_type: String,
    pub builder: Builder,
    pub metadata: Metadata,
    pub invocation: Invocation,
    pub build_config: BuildConfig,
    pub materials: Vec<Material>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Builder {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub build_invocation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    pub uri: String,
    pub digest: DigestSet,
}

impl Material {
    /// `hex` is empty when the image could not be resolved.
    pub fn new(image: &str, hex: &str) -> Self {
        let uri = if hex.is_empty() {
            format!("pkg:{}", image)
        } else {
            format!("pkg:{}@sha256:{}", image, hex)
        };
        let mut digest = DigestSet::new();
        digest.insert("sha256".to_string(), hex.to_string());
        Self { uri, digest }
    }

    pub fn sha256(&self) -> &str {
        self.digest.get("sha256").map(String::as_str).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

/// Build the statement for `steps`, which should be the full compiled list,
/// skipped steps included.
pub async fn assemble(
    pipeline: &PipelineResource,
    build: &Build,
    steps: &[Step],
    resolver: &dyn DigestResolver,
) -> Statement {
    Statement {
        statement_type: STATEMENT_TYPE.to_string(),
        predicate_type: PREDICATE_TYPE.to_string(),
        subject: Vec::new(),
        predicate: Predicate {
            build_type: pipeline.build_type(),
            builder: Builder {
                id: BUILDER_ID.to_string(),
            },
            metadata: Metadata {
                build_invocation_id: build.id.to_string(),
            },
            invocation: Invocation {
                parameters: build.params.clone(),
            },
            build_config: BuildConfig {
                steps: steps.to_vec(),
            },
            materials: materials(steps, resolver).await,
        },
    }
}

/// One material per step. Each distinct image is looked up once.
pub async fn materials(steps: &[Step], resolver: &dyn DigestResolver) -> Vec<Material> {
    materials_within(steps, resolver, LOOKUP_TIMEOUT).await
}

/// Like [`materials`], giving up on a lookup after `limit`. A lookup that
/// times out counts as unresolved.
pub async fn materials_within(
    steps: &[Step],
    resolver: &dyn DigestResolver,
    limit: Duration,
) -> Vec<Material> {
    let mut resolved: BTreeMap<&str, String> = BTreeMap::new();
    let mut out = Vec::with_capacity(steps.len());
    for step in steps {
        if !resolved.contains_key(step.image.as_str()) {
            let hex = match tokio::time::timeout(limit, resolver.resolve(&step.image)).await {
                Ok(Ok(hex)) => hex,
                Ok(Err(e)) => {
                    tracing::warn!(step = %step.name, image = %step.image, error = %e, "Could not resolve image digest");
                    String::new()
                }
                Err(_) => {
                    tracing::warn!(step = %step.name, image = %step.image, timeout = ?limit, "Image digest lookup timed out");
                    String::new()
                }
            };
            resolved.insert(step.image.as_str(), hex);
        }
        let hex = resolved.get(step.image.as_str()).map(String::as_str).unwrap_or_default();
        out.push(Material::new(&step.image, hex));
    }
    out
}

/// `<dir>/<file name>-provenance.json` for the pipeline file at `source`.
pub fn provenance_path(source: &Path) -> PathBuf {
    let dir = source
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pipeline".to_string());
    dir.join(format!("{}-provenance.json", name))
}

fn write_to(statement: &Statement, path: &Path) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(statement)?;
    json.push(b'\n');
    std::fs::write(path, json)?;
    Ok(())
}

/// Write the statement next to `source`. Failures are logged and swallowed.
pub fn write_statement(statement: &Statement, source: &Path) -> Option<PathBuf> {
    let path = provenance_path(source);
    match write_to(statement, &path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), materials = statement.predicate.materials.len(), "Provenance written");
            Some(path)
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Error generating provenance");
            None
        }
    }
}
