//! Container image reference parsing and registry digest resolution.
//!
//! Provides the `DigestResolver` trait, an OCI distribution `RegistryClient`,
//! and a `StaticResolver` for offline use.

mod client;
mod reference;
mod resolver;

pub use client::{parse_challenge, BearerChallenge, RegistryClient};
pub use reference::{digest_hex, Reference, DOCKER_HUB};
pub use resolver::{DigestResolver, StaticResolver};
