//! Loading resources from multi-document YAML files.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use walkdir::WalkDir;

use super::manifest_sync::ManifestSync;
use super::validation::validate_manifest_sync;
use super::{ResourceHeader, ResourceKind, ResourceWithPath, API_VERSION};
use crate::error::{HydrosError, Result};

/// Splits a YAML stream into its documents, dropping empty ones.
pub fn parse_documents(content: &str, path: &Path) -> Result<Vec<serde_yaml::Value>> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| HydrosError::ParseYaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

pub fn is_yaml_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// True when any component of `path` below `root` starts with a dot.
pub fn is_hidden(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .any(|c| c.as_os_str().to_str().is_some_and(|s| s.starts_with('.')))
}

/// Every YAML file under `root`, skipping hidden paths, in a stable order.
pub fn yaml_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Err(HydrosError::ReadDirectory {
            path: root.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "directory not found"),
        });
    }

    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| p.is_file() && is_yaml_file(p) && !is_hidden(root, p))
        .collect();
    files.sort();
    Ok(files)
}

/// Reads the documents of `kind` from one file. Other kinds are skipped.
pub fn load_kind_from_file<T: DeserializeOwned>(path: &Path, kind: ResourceKind) -> Result<Vec<T>> {
    let content = fs::read_to_string(path).map_err(|e| HydrosError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut resources = Vec::new();
    for document in parse_documents(&content, path)? {
        let header: ResourceHeader = match serde_yaml::from_value(document.clone()) {
            Ok(h) => h,
            Err(_) => continue,
        };
        if header.kind != kind.to_string() {
            continue;
        }
        if header.api_version != API_VERSION {
            return Err(HydrosError::InvalidApiVersion {
                version: header.api_version,
                expected: API_VERSION.to_string(),
            });
        }
        let resource = serde_yaml::from_value(document).map_err(|e| HydrosError::InvalidResource {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        resources.push(resource);
    }
    Ok(resources)
}

/// Loads every `kind` document under `root` along with its relative path.
pub fn load_kind<T: DeserializeOwned>(
    root: &Path,
    kind: ResourceKind,
) -> Result<Vec<ResourceWithPath<T>>> {
    let mut loaded = Vec::new();
    for path in yaml_files(root)? {
        let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        for resource in load_kind_from_file(&path, kind)? {
            loaded.push(ResourceWithPath::new(resource, relative.clone()));
        }
    }
    Ok(loaded)
}

/// ManifestSync documents in one file, each validated.
pub fn load_manifest_sync_file(path: &Path) -> Result<Vec<ManifestSync>> {
    let syncs: Vec<ManifestSync> = load_kind_from_file(path, ResourceKind::ManifestSync)?;
    for sync in &syncs {
        validate_manifest_sync(sync)?;
    }
    Ok(syncs)
}

/// Loads, de-duplicates and validates every ManifestSync under `dir`.
pub fn load_manifest_syncs(dir: &Path) -> Result<Vec<ResourceWithPath<ManifestSync>>> {
    let loaded: Vec<ResourceWithPath<ManifestSync>> = load_kind(dir, ResourceKind::ManifestSync)?;

    let mut seen = HashSet::new();
    let mut problems = Vec::new();
    for item in &loaded {
        let name = item.resource.name();
        if !seen.insert(name.to_string()) {
            return Err(HydrosError::DuplicateName {
                kind: ResourceKind::ManifestSync.to_string(),
                name: name.to_string(),
            });
        }
        if let Err(HydrosError::Validation(message)) = validate_manifest_sync(&item.resource) {
            problems.push(format!("{}: {}", item.path.display(), message));
        }
    }

    if !problems.is_empty() {
        return Err(HydrosError::Validation(problems.join("; ")));
    }

    log::info!("Loaded {} ManifestSync resource(s) from {}", loaded.len(), dir.display());
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SYNC: &str = r#"
apiVersion: hydros.dev/v1alpha1
kind: ManifestSync
metadata:
  name: NAME
spec:
  sourceRepo: {org: acme, repo: manifests, branch: main}
  forkRepo: {org: acme-bot, repo: hydrated, branch: hydros/NAME}
  destRepo: {org: acme, repo: hydrated, branch: main}
  selector:
    matchLabels: {env: dev}
"#;

    fn sync(name: &str) -> String {
        SYNC.replace("NAME", name)
    }

    #[test]
    fn test_multi_document_file_keeps_only_manifest_syncs() {
        let dir = TempDir::new().unwrap();
        let content = format!(
            "{}\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: other\n---\n{}",
            sync("one"),
            sync("two")
        );
        fs::write(dir.path().join("syncs.yaml"), content).unwrap();

        let loaded = load_manifest_syncs(dir.path()).unwrap();
        let names: Vec<&str> = loaded.iter().map(|l| l.resource.name()).collect();
        assert_eq!(names, vec!["one", "two"]);
        assert_eq!(loaded[0].path, PathBuf::from("syncs.yaml"));
    }

    #[test]
    fn test_hidden_paths_are_skipped() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/sync.yaml"), sync("hidden")).unwrap();
        fs::write(dir.path().join(".lastsync.yaml"), sync("status")).unwrap();
        fs::write(dir.path().join("visible.yml"), sync("visible")).unwrap();

        let loaded = load_manifest_syncs(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].resource.name(), "visible");
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.yaml"), sync("dup")).unwrap();
        fs::write(dir.path().join("b.yaml"), sync("dup")).unwrap();

        let err = load_manifest_syncs(dir.path()).unwrap_err();
        assert!(matches!(err, HydrosError::DuplicateName { .. }));
    }

    #[test]
    fn test_wrong_api_version_rejected() {
        let dir = TempDir::new().unwrap();
        let content = sync("old").replace("hydros.dev/v1alpha1", "hydros.dev/v0");
        fs::write(dir.path().join("a.yaml"), content).unwrap();

        let err = load_manifest_syncs(dir.path()).unwrap_err();
        assert!(matches!(err, HydrosError::InvalidApiVersion { .. }));
    }

    #[test]
    fn test_invalid_resources_reported_together() {
        let dir = TempDir::new().unwrap();
        let no_selector = sync("a").replace("  selector:\n    matchLabels: {env: dev}\n", "");
        let no_branch = sync("b").replace("branch: main}", "branch: \"\"}");
        fs::write(dir.path().join("a.yaml"), no_selector).unwrap();
        fs::write(dir.path().join("b.yaml"), no_branch).unwrap();

        let err = load_manifest_syncs(dir.path()).unwrap_err().to_string();
        assert!(err.contains("a.yaml"));
        assert!(err.contains("b.yaml"));
    }

    #[test]
    fn test_missing_directory() {
        let err = load_manifest_syncs(Path::new("/nonexistent/hydros/manifests")).unwrap_err();
        assert!(matches!(err, HydrosError::ReadDirectory { .. }));
    }
}
