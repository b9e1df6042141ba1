//! The `.lastsync.yaml` file: last published state and diffing baseline.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{HydrosError, Result};
use crate::resource::ManifestSync;

pub const STATUS_FILE_NAME: &str = ".lastsync.yaml";

pub fn status_path(dest_root: &Path) -> PathBuf {
    dest_root.join(STATUS_FILE_NAME)
}

/// The last published ManifestSync, or `None` when never synced.
pub fn read_last_sync(path: &Path) -> Result<Option<ManifestSync>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(HydrosError::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    serde_yaml::from_str(&content)
        .map(Some)
        .map_err(|e| HydrosError::ParseYaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

pub fn write_last_sync(path: &Path, sync: &ManifestSync) -> Result<()> {
    let content =
        serde_yaml::to_string(sync).map_err(|e| HydrosError::SerializeYaml(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| HydrosError::WriteFile {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    fs::write(path, content).map_err(|e| HydrosError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Pinned references in `current` that are new or differ from `last`.
///
/// Both maps go from source reference to pinned reference; the result is
/// ordered by source reference.
pub fn changed_images(
    last: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> Vec<String> {
    current
        .iter()
        .filter(|(image, pinned)| last.get(*image) != Some(*pinned))
        .map(|(_, pinned)| pinned.clone())
        .collect()
}
