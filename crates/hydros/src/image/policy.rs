//! Per-image pinning strategy and digest resolution for one reconcile pass.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::reference::DockerImageRef;
use super::resolver::ResolverSet;
use crate::error::{HydrosError, Result};

/// Tags never chosen as a human-readable display tag.
pub const EXCLUDED_DISPLAY_TAGS: [&str; 5] = ["latest", "live", "prod", "dev", "staging"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    /// Retag with the source commit, then resolve.
    SourceCommit,
    /// Resolve the tag as written.
    MutableTag,
    /// Resolve the newest tag sharing the written tag as a prefix.
    LatestTagPrefix,
    /// Not pinned.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::SourceCommit => "sourceCommit",
            Strategy::MutableTag => "mutableTag",
            Strategy::LatestTagPrefix => "latestTagPrefix",
            Strategy::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoMatchType {
    Include,
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRepoMatch {
    /// Repository names, either `repo` or `registry/repo`.
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(rename = "type")]
    pub match_type: RepoMatchType,
}

impl ImageRepoMatch {
    fn holds_for(&self, image: &DockerImageRef) -> bool {
        let name = image.name();
        let listed = self.repos.iter().any(|r| *r == image.repo || *r == name);
        match self.match_type {
            RepoMatchType::Include => listed,
            RepoMatchType::Exclude => !listed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinningRule {
    pub tags: Vec<String>,
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repo_match: Option<ImageRepoMatch>,
}

impl PinningRule {
    pub fn matches(&self, image: &DockerImageRef) -> bool {
        self.tags.iter().any(|t| *t == image.tag)
            && self
                .image_repo_match
                .as_ref()
                .is_none_or(|m| m.holds_for(image))
    }
}

/// The strategy of the first rule matching `image`, in declaration order.
pub fn resolve_strategy(rules: &[PinningRule], image: &DockerImageRef) -> Strategy {
    rules
        .iter()
        .find(|rule| rule.matches(image))
        .map(|rule| rule.strategy)
        .unwrap_or(Strategy::Unknown)
}

/// First tag outside [`EXCLUDED_DISPLAY_TAGS`].
pub fn pick_display_tag(tags: &[String]) -> Option<&str> {
    tags.iter()
        .map(String::as_str)
        .find(|t| !t.is_empty() && !EXCLUDED_DISPLAY_TAGS.contains(t))
}

/// Strategy evaluation and resolution, cached for the lifetime of one pass.
pub struct ImageTagPolicy<'a> {
    rules: &'a [PinningRule],
    resolvers: &'a ResolverSet,
    source_commit: String,
    cache: HashMap<DockerImageRef, Option<DockerImageRef>>,
}

impl<'a> ImageTagPolicy<'a> {
    pub fn new(
        rules: &'a [PinningRule],
        resolvers: &'a ResolverSet,
        source_commit: impl Into<String>,
    ) -> Self {
        Self {
            rules,
            resolvers,
            source_commit: source_commit.into(),
            cache: HashMap::new(),
        }
    }

    pub fn strategy(&self, image: &DockerImageRef) -> Strategy {
        resolve_strategy(self.rules, image)
    }

    /// Resolves one image. `Ok(None)` means no rule applies and it stays unpinned.
    pub fn resolve(&mut self, image: &DockerImageRef) -> Result<Option<DockerImageRef>> {
        if let Some(cached) = self.cache.get(image) {
            return Ok(cached.clone());
        }

        let strategy = self.strategy(image);
        let resolved = match strategy {
            Strategy::Unknown => None,
            Strategy::SourceCommit => {
                let target = image.with_tag(self.source_commit.clone()).without_sha();
                let resolver = self.resolvers.resolver_for(&target)?;
                Some(resolver.resolve(&target, strategy)?)
            }
            Strategy::MutableTag => {
                let target = image.without_sha();
                let resolver = self.resolvers.resolver_for(&target)?;
                let resolved = resolver.resolve(&target, strategy)?;
                Some(with_display_tag(resolver.tags_for_digest(&resolved), resolved))
            }
            Strategy::LatestTagPrefix => {
                let target = image.without_sha();
                let resolver = self.resolvers.resolver_for(&target)?;
                Some(resolver.resolve(&target, strategy)?)
            }
        };

        if let Some(ref r) = resolved {
            log::debug!("Resolved {} ({}) to {}", image, strategy, r);
        }
        self.cache.insert(image.clone(), resolved.clone());
        Ok(resolved)
    }

    /// Resolves every image, attempting all before reporting failures together.
    ///
    /// Unpinned images are left out of the result.
    pub fn resolve_all<'i, I>(&mut self, images: I) -> Result<Vec<(DockerImageRef, DockerImageRef)>>
    where
        I: IntoIterator<Item = &'i DockerImageRef>,
    {
        let mut pinned = Vec::new();
        let mut failures = Vec::new();

        for image in images {
            match self.resolve(image) {
                Ok(Some(resolved)) => pinned.push((image.clone(), resolved)),
                Ok(None) => log::debug!("No pinning rule for {}, leaving it as is", image),
                Err(e) => {
                    log::warn!("Failed to resolve {}: {}", image, e);
                    failures.push(format!("{}: {}", image, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(pinned)
        } else {
            Err(HydrosError::ImageResolution { failures })
        }
    }
}

// The digest stays authoritative; a failed tag lookup keeps the written tag.
fn with_display_tag(tags: Result<Vec<String>>, resolved: DockerImageRef) -> DockerImageRef {
    match tags {
        Ok(tags) => match pick_display_tag(&tags) {
            Some(tag) => resolved.with_tag(tag),
            None => resolved,
        },
        Err(e) => {
            log::warn!("Could not list tags for {}: {}", resolved, e);
            resolved
        }
    }
}
