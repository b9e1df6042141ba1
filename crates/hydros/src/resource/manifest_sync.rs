//! ManifestSync, Renderer, RepoConfig and Image resources.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::selector::LabelSelector;
use super::Resource;
use crate::image::policy::PinningRule;

/// One repository branch on the hosting platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GitHubRepo {
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub branch: String,
}

impl GitHubRepo {
    pub fn new(org: impl Into<String>, repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    /// `org/repo`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }

    pub fn web_url(&self) -> String {
        format!("https://github.com/{}/{}", self.org, self.repo)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRef {
    /// Directory (relative to the source repo root) holding function documents.
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSyncSpec {
    pub source_repo: GitHubRepo,
    pub fork_repo: GitHubRepo,
    pub dest_repo: GitHubRepo,

    #[serde(default)]
    pub source_path: String,

    #[serde(default)]
    pub dest_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    /// Deprecated: kustomization annotations that must all be present.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_tags_to_pin: Vec<PinningRule>,

    /// Registries whose images are pinned. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_registries: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pr_labels: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_dirs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinnedImage {
    /// The reference as written in the overlay.
    pub image: String,
    /// The resolved reference including its digest.
    pub pinned_image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSyncStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_commit: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_url: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned_images: Vec<PinnedImage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_until: Option<DateTime<Utc>>,
}

impl ManifestSyncStatus {
    /// The pinned images as a map from source reference to pinned reference.
    pub fn pinned_map(&self) -> BTreeMap<String, String> {
        self.pinned_images
            .iter()
            .map(|p| (p.image.clone(), p.pinned_image.clone()))
            .collect()
    }

    pub fn set_pinned_map(&mut self, pinned: &BTreeMap<String, String>) {
        self.pinned_images = pinned
            .iter()
            .map(|(image, pinned_image)| PinnedImage {
                image: image.clone(),
                pinned_image: pinned_image.clone(),
            })
            .collect();
    }
}

pub type ManifestSync = Resource<ManifestSyncSpec, ManifestSyncStatus>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererSpec {
    pub repo: GitHubRepo,

    /// Branch pushed to for the pull request.
    pub fork_branch: String,

    /// Directory rendered in place.
    #[serde(default)]
    pub path: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pr_labels: Vec<String>,
}

pub type RendererResource = Resource<RendererSpec>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoConfigSpec {
    pub repo: GitHubRepo,

    /// Glob patterns, relative to the repo root, locating ManifestSync files.
    #[serde(default)]
    pub globs: Vec<String>,
}

pub type RepoConfigResource = Resource<RepoConfigSpec>;

/// A container image built from the source repo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// `registry/repo` without a tag.
    pub image: String,

    /// Build context, relative to the directory of the Image document.
    #[serde(default = "default_context")]
    pub context: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
}

fn default_context() -> String {
    ".".to_string()
}

pub type ImageResource = Resource<ImageSpec>;
