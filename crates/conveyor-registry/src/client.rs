use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};

use conveyor_types::{ConveyorError, Result};

use crate::reference::{digest_hex, Reference};
use crate::resolver::DigestResolver;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.v2+json";

const CONTENT_DIGEST: &str = "docker-content-digest";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// Resolves digests against an OCI distribution (v2) registry using
/// anonymous bearer tokens when the registry challenges for them.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
}

impl RegistryClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("conveyor/", env!("CARGO_PKG_VERSION")))
                .timeout(REQUEST_TIMEOUT)
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    async fn head(&self, url: &str, token: Option<&str>) -> Result<reqwest::Response> {
        let mut req = self.client.head(url).header(ACCEPT, MANIFEST_ACCEPT);
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        req.send().await.map_err(|e| transport_error(url, e))
    }

    async fn get(&self, url: &str, token: Option<&str>) -> Result<reqwest::Response> {
        let mut req = self.client.get(url).header(ACCEPT, MANIFEST_ACCEPT);
        if let Some(token) = token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        req.send().await.map_err(|e| transport_error(url, e))
    }

    async fn fetch_token(&self, reference: &Reference, challenge: &BearerChallenge) -> Result<String> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(ref service) = challenge.service {
            query.push(("service", service.clone()));
        }
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", reference.repository));
        query.push(("scope", scope));

        let resp = self
            .client
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await
            .map_err(|e| transport_error(&challenge.realm, e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| transport_error(&challenge.realm, e))?;
        if !status.is_success() {
            return Err(registry_error(reference, status, &body));
        }
        parse_token(&body).ok_or_else(|| ConveyorError::RegistryError {
            registry: reference.registry.clone(),
            reference: reference.to_string(),
            status: status.as_u16(),
            message: "token response carried no token".into(),
        })
    }

    /// Resolve `image` to the hex sha256 digest of its manifest (or index).
    pub async fn digest(&self, image: &str) -> Result<String> {
        let reference = Reference::parse(image)?;
        if let Some(hex) = reference.digest.as_deref().and_then(digest_hex) {
            return Ok(hex.to_string());
        }

        let url = reference.manifest_url();
        let mut token = None;
        let mut resp = self.head(&url, None).await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            let challenge = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_challenge)
                .ok_or_else(|| registry_error(&reference, StatusCode::UNAUTHORIZED, "no bearer challenge"))?;
            tracing::debug!(realm = %challenge.realm, image, "Fetching registry token");
            token = Some(self.fetch_token(&reference, &challenge).await?);
            resp = self.head(&url, token.as_deref()).await?;
        }

        let status = resp.status();
        if !status.is_success() {
            return Err(registry_error(&reference, status, "manifest lookup failed"));
        }
        if let Some(hex) = header_digest(resp.headers()) {
            return Ok(hex);
        }

        // Some registries omit the digest header on HEAD; hash the body instead.
        let resp = self.get(&url, token.as_deref()).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(registry_error(&reference, status, "manifest fetch failed"));
        }
        if let Some(hex) = header_digest(resp.headers()) {
            return Ok(hex);
        }
        let body = resp.bytes().await.map_err(|e| transport_error(&url, e))?;
        Ok(hex::encode(Sha256::digest(&body)))
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DigestResolver for RegistryClient {
    async fn resolve(&self, image: &str) -> Result<String> {
        self.digest(image).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
pub fn parse_challenge(header: &str) -> Option<BearerChallenge> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("static regex"));

    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let fields: HashMap<&str, &str> = re
        .captures_iter(params)
        .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
        .collect();

    Some(BearerChallenge {
        realm: fields.get("realm")?.to_string(),
        service: fields.get("service").map(|s| s.to_string()),
        scope: fields.get("scope").map(|s| s.to_string()),
    })
}

/// Token endpoints answer with `token`, `access_token`, or both.
fn parse_token(body: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    json["token"]
        .as_str()
        .or_else(|| json["access_token"].as_str())
        .filter(|t| !t.is_empty())
        .map(String::from)
}

fn header_digest(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_DIGEST)
        .and_then(|v| v.to_str().ok())
        .and_then(digest_hex)
        .map(String::from)
}

fn registry_error(reference: &Reference, status: StatusCode, message: &str) -> ConveyorError {
    ConveyorError::RegistryError {
        registry: reference.registry.clone(),
        reference: reference.to_string(),
        status: status.as_u16(),
        message: message.to_string(),
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> ConveyorError {
    ConveyorError::RegistryError {
        registry: url.to_string(),
        reference: url.to_string(),
        status: 0,
        message: err.to_string(),
    }
}
