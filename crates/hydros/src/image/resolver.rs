//! Registry resolver interface and hostname-based backend selection.

use regex::Regex;

use super::policy::Strategy;
use super::reference::DockerImageRef;
use crate::error::{HydrosError, Result};

/// Host used for matching references without an explicit registry.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Maps a tagged reference to the same reference with its digest filled in.
pub trait Resolver: Send {
    fn resolve(&self, image: &DockerImageRef, strategy: Strategy) -> Result<DockerImageRef>;

    /// Other tags that currently point at `image`'s digest, in registry order.
    fn tags_for_digest(&self, _image: &DockerImageRef) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Resolvers keyed by a hostname pattern. The first match wins.
#[derive(Default)]
pub struct ResolverSet {
    entries: Vec<(Regex, Box<dyn Resolver>)>,
}

impl ResolverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: &str, resolver: Box<dyn Resolver>) -> Result<()> {
        let regex = Regex::new(pattern).map_err(|e| {
            HydrosError::Validation(format!("invalid registry pattern '{}': {}", pattern, e))
        })?;
        self.entries.push((regex, resolver));
        Ok(())
    }

    pub fn with(mut self, pattern: &str, resolver: Box<dyn Resolver>) -> Result<Self> {
        self.register(pattern, resolver)?;
        Ok(self)
    }

    pub fn resolver_for(&self, image: &DockerImageRef) -> Result<&dyn Resolver> {
        let host = registry_host(image);
        self.entries
            .iter()
            .find(|(pattern, _)| pattern.is_match(host))
            .map(|(_, resolver)| resolver.as_ref())
            .ok_or_else(|| HydrosError::NoResolver(host.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for ResolverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(p, _)| p.as_str()))
            .finish()
    }
}

/// Builds fresh resolvers for each reconcile pass so caches never outlive it.
pub trait ResolverFactory: Send + Sync {
    fn create(&self) -> Result<ResolverSet>;
}

impl<F> ResolverFactory for F
where
    F: Fn() -> Result<ResolverSet> + Send + Sync,
{
    fn create(&self) -> Result<ResolverSet> {
        self()
    }
}

pub fn registry_host(image: &DockerImageRef) -> &str {
    if image.registry.is_empty() {
        DEFAULT_REGISTRY
    } else {
        &image.registry
    }
}
