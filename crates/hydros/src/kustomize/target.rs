//! Mapping a kustomization file to its hydrated output directory.

use std::path::{Component, Path, PathBuf};

use crate::error::{HydrosError, Result};

/// Where an overlay's output lands, relative to the destination path.
///
/// The overlay directory name is dropped, so `apps/api/dev` and `apps/api/prod`
/// both hydrate into `apps/api`; only one of them may be selected per sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TargetPath {
    pub dir: String,
    pub overlay_name: String,
}

/// Computes the [`TargetPath`] of `kustomization` relative to `source_base`.
///
/// With at least three segments, the second-to-last is the overlay name and
/// the ones before it form the directory. With exactly two there is no overlay.
pub fn generate_target_path(source_base: &Path, kustomization: &Path) -> Result<TargetPath> {
    let relative = kustomization.strip_prefix(source_base).map_err(|_| HydrosError::TargetPath {
        path: kustomization.to_path_buf(),
        message: format!("not under {}", source_base.display()),
    })?;

    let segments: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    match segments.len() {
        0 | 1 => Err(HydrosError::TargetPath {
            path: kustomization.to_path_buf(),
            message: format!(
                "expected <dir>/kustomization.yaml or <dir>/<overlay>/kustomization.yaml, got {} segment(s)",
                segments.len()
            ),
        }),
        2 => Ok(TargetPath {
            dir: segments[0].clone(),
            overlay_name: String::new(),
        }),
        n => Ok(TargetPath {
            dir: segments[..n - 2].join("/"),
            overlay_name: segments[n - 2].clone(),
        }),
    }
}

impl TargetPath {
    pub fn dir_path(&self) -> PathBuf {
        PathBuf::from(&self.dir)
    }
}
