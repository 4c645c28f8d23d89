//! Image reference resolution through the container tool.
//!
//! Pulling is idempotent: the container tool's own store deduplicates
//! layers, so resolving an already-present reference costs one inspect.

use crate::cache::ImageId;
use crate::error::{Error, Result};
use crate::process;
use serde::Deserialize;
use std::process::Command;

/// An image reference resolved to its content digest.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// Content digest of the image configuration.
    pub id: ImageId,
    /// Repository portion of the reference.
    pub repository: String,
    /// Tag portion of the reference.
    pub tag: String,
    /// Unpacked image size in bytes, as reported by the container tool.
    pub size: u64,
}

/// Resolves user-supplied references to content-addressed images.
pub trait ImageResolver {
    fn resolve(&self, reference: &str) -> Result<ResolvedImage>;
}

/// Resolver backed by the `podman` CLI.
#[derive(Debug, Default)]
pub struct PodmanResolver;

#[derive(Deserialize)]
struct InspectRecord {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,
}

impl ImageResolver for PodmanResolver {
    fn resolve(&self, reference: &str) -> Result<ResolvedImage> {
        tracing::info!(reference, "pulling image");
        let mut pull = Command::new("podman");
        pull.arg("pull").arg(reference);
        let status = process::run_streaming(pull, "podman pull")
            .map_err(|e| Error::image_resolve(reference, e.to_string()))?;
        if !status.success() {
            return Err(Error::image_resolve(
                reference,
                format!("podman pull exited with {status}"),
            ));
        }

        let output = Command::new("podman")
            .args(["image", "inspect", reference])
            .output()
            .map_err(|e| Error::image_resolve(reference, e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::image_resolve(reference, stderr.trim().to_string()));
        }

        let records: Vec<InspectRecord> = serde_json::from_slice(&output.stdout)?;
        let record = records
            .into_iter()
            .next()
            .ok_or_else(|| Error::image_resolve(reference, "inspect returned no records"))?;

        let digest = record.id.strip_prefix("sha256:").unwrap_or(&record.id);
        let id: ImageId = digest
            .parse()
            .map_err(|e: Error| Error::image_resolve(reference, e.to_string()))?;

        let (repository, tag) = split_reference(reference, &record.repo_tags);

        tracing::debug!(id = %id.short(), repository, tag, "image resolved");

        Ok(ResolvedImage {
            id,
            repository,
            tag,
            size: record.size,
        })
    }
}

/// Split a reference into repository and tag, preferring the tool's own
/// normalized RepoTags (which carry the implied registry and `latest`).
fn split_reference(reference: &str, repo_tags: &[String]) -> (String, String) {
    let candidate = repo_tags
        .iter()
        .find(|t| t.ends_with(reference) || reference.ends_with(t.as_str()))
        .map(String::as_str)
        .unwrap_or(reference);

    // A colon after the last slash separates the tag; a colon before it
    // is a registry port.
    let split_at = candidate
        .rfind(':')
        .filter(|&i| i > candidate.rfind('/').unwrap_or(0));
    match split_at {
        Some(i) => (candidate[..i].to_string(), candidate[i + 1..].to_string()),
        None => (candidate.to_string(), "latest".to_string()),
    }
}
