//! Kubernetes-style resources consumed by the engine.

pub mod loader;
pub mod manifest_sync;
pub mod selector;
pub mod validation;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use loader::{load_manifest_sync_file, load_manifest_syncs, parse_documents};
pub use manifest_sync::{
    FunctionRef, GitHubRepo, ImageResource, ImageSpec, ManifestSync, ManifestSyncSpec,
    ManifestSyncStatus, PinnedImage, RendererResource, RendererSpec, RepoConfigResource,
    RepoConfigSpec,
};
pub use selector::{LabelSelector, LabelSelectorRequirement, SelectorOperator};
pub use validation::{validate_manifest_sync, validate_renderer, validate_repo_config};

/// The API version shared by every hydros resource.
pub const API_VERSION: &str = "hydros.dev/v1alpha1";

/// Pauses syncing until an RFC 3339 time or for a duration such as `2h`.
pub const PAUSE_ANNOTATION: &str = "hydros.dev/pause";

/// `"true"` ignores an active pause and records a new one from the pause annotation.
pub const TAKEOVER_ANNOTATION: &str = "hydros.dev/takeover";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    ManifestSync,
    Renderer,
    RepoConfig,
    Image,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::ManifestSync => "ManifestSync",
            ResourceKind::Renderer => "Renderer",
            ResourceKind::RepoConfig => "RepoConfig",
            ResourceKind::Image => "Image",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ManifestSync" => Ok(ResourceKind::ManifestSync),
            "Renderer" => Ok(ResourceKind::Renderer),
            "RepoConfig" => Ok(ResourceKind::RepoConfig),
            "Image" => Ok(ResourceKind::Image),
            _ => Err(format!("Unknown resource kind: {}", s)),
        }
    }
}

/// Resource metadata. Maps are ordered so serialized output is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// A resource envelope: `apiVersion`, `kind`, `metadata`, `spec`, optional `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource<T, S = ()> {
    pub api_version: String,
    pub kind: ResourceKind,
    pub metadata: ObjectMeta,
    pub spec: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<S>,
}

impl<T, S> Resource<T, S> {
    pub fn new(kind: ResourceKind, name: impl Into<String>, spec: T) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind,
            metadata: ObjectMeta::new(name),
            spec,
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// The fields read before deciding how to deserialize a document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHeader {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
}

/// A resource along with the file it was loaded from.
#[derive(Debug, Clone)]
pub struct ResourceWithPath<T> {
    pub resource: T,
    pub path: std::path::PathBuf,
}

impl<T> ResourceWithPath<T> {
    pub fn new(resource: T, path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            resource,
            path: path.into(),
        }
    }
}
