//! Container image references of the form `registry/repo:tag@sha`.

use std::fmt;
use std::str::FromStr;

use crate::error::{HydrosError, Result};

/// A parsed image reference. Equality and hashing cover all four fields.
///
/// Use [`DockerImageRef::same_image`] when the digest must be ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DockerImageRef {
    /// Empty for Docker Hub short names such as `nginx:1.25`.
    pub registry: String,
    pub repo: String,
    pub tag: String,
    /// Digest including its algorithm prefix, e.g. `sha256:...`.
    pub sha: String,
}

impl DockerImageRef {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() || input.chars().any(char::is_whitespace) {
            return Err(HydrosError::InvalidImageRef(input.to_string()));
        }

        let (name_and_tag, sha) = match input.split_once('@') {
            Some((rest, sha)) if !sha.is_empty() => (rest, sha.to_string()),
            Some(_) => return Err(HydrosError::InvalidImageRef(input.to_string())),
            None => (input, String::new()),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a registry port.
        let last_slash = name_and_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_and_tag[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name_and_tag[..split], name_and_tag[split + 1..].to_string())
            }
            None => (name_and_tag, String::new()),
        };

        let (registry, repo) = match name.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first.to_string(), rest.to_string()),
            _ => (String::new(), name.to_string()),
        };

        if repo.is_empty() || repo.starts_with('/') || repo.ends_with('/') {
            return Err(HydrosError::InvalidImageRef(input.to_string()));
        }

        Ok(Self {
            registry,
            repo,
            tag,
            sha,
        })
    }

    /// `registry/repo` without tag or digest.
    pub fn name(&self) -> String {
        if self.registry.is_empty() {
            self.repo.clone()
        } else {
            format!("{}/{}", self.registry, self.repo)
        }
    }

    /// The full reference, omitting empty parts.
    pub fn url(&self) -> String {
        let mut url = self.name();
        if !self.tag.is_empty() {
            url.push(':');
            url.push_str(&self.tag);
        }
        if !self.sha.is_empty() {
            url.push('@');
            url.push_str(&self.sha);
        }
        url
    }

    /// Same registry, repo and tag; the digest is not compared.
    pub fn same_image(&self, other: &DockerImageRef) -> bool {
        self.registry == other.registry && self.repo == other.repo && self.tag == other.tag
    }

    pub fn without_sha(&self) -> Self {
        Self {
            sha: String::new(),
            ..self.clone()
        }
    }

    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..self.clone()
        }
    }

    pub fn with_sha(&self, sha: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            ..self.clone()
        }
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

impl fmt::Display for DockerImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

impl FromStr for DockerImageRef {
    type Err = HydrosError;

    fn from_str(s: &str) -> Result<Self> {
        DockerImageRef::parse(s)
    }
}
