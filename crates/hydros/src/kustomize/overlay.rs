//! Discovery, selection and image rewriting of kustomization files.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use walkdir::WalkDir;

use crate::error::{HydrosError, Result};
use crate::image::DockerImageRef;
use crate::resource::LabelSelector;

pub const KUSTOMIZATION_FILE_NAMES: [&str; 3] =
    ["kustomization.yaml", "kustomization.yml", "Kustomization"];

/// One `images:` entry of a kustomization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub name: String,
    pub new_name: Option<String>,
    pub new_tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageEntry {
    fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_mapping()?;
        let get = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
        Some(Self {
            name: get("name")?,
            new_name: get("newName"),
            new_tag: get("newTag"),
            digest: get("digest"),
        })
    }

    /// The image this entry substitutes in, before pinning. Entries without a tag are skipped.
    pub fn source_ref(&self) -> Option<Result<DockerImageRef>> {
        let tag = self.new_tag.as_deref().filter(|t| !t.is_empty())?;
        let name = self.new_name.as_deref().unwrap_or(&self.name);
        Some(DockerImageRef::parse(&format!("{}:{}", name, tag)))
    }
}

/// A discovered kustomization file.
#[derive(Debug, Clone)]
pub struct KustomizationDoc {
    pub path: PathBuf,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub images: Vec<ImageEntry>,
    document: Value,
}

impl KustomizationDoc {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| HydrosError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;
        let document: Value = serde_yaml::from_str(&content).map_err(|e| HydrosError::ParseYaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let metadata = document.get("metadata");
        let images = document
            .get("images")
            .and_then(Value::as_sequence)
            .map(|seq| seq.iter().filter_map(ImageEntry::from_value).collect())
            .unwrap_or_default();

        Ok(Self {
            path: path.to_path_buf(),
            labels: string_map(metadata.and_then(|m| m.get("labels"))),
            annotations: string_map(metadata.and_then(|m| m.get("annotations"))),
            images,
            document,
        })
    }

    /// The overlay directory (the file's parent).
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }

    /// Selector first; the legacy annotation match only when no selector is set.
    pub fn is_selected(
        &self,
        selector: Option<&LabelSelector>,
        match_annotations: &BTreeMap<String, String>,
    ) -> bool {
        match selector {
            Some(selector) => selector.matches(&self.labels),
            None if !match_annotations.is_empty() => match_annotations
                .iter()
                .all(|(k, v)| self.annotations.get(k) == Some(v)),
            None => false,
        }
    }

    /// Images referenced by this overlay's `images:` entries.
    pub fn image_refs(&self) -> Result<Vec<DockerImageRef>> {
        self.images
            .iter()
            .filter_map(ImageEntry::source_ref)
            .collect()
    }

    /// Points every entry found in `pinned` (keyed by source url) at its resolved image.
    ///
    /// Returns whether anything changed. The file is not written.
    pub fn pin_images(&mut self, pinned: &BTreeMap<String, DockerImageRef>) -> Result<bool> {
        let Some(seq) = self
            .document
            .get_mut("images")
            .and_then(Value::as_sequence_mut)
        else {
            return Ok(false);
        };

        let mut changed = false;
        for entry_value in seq.iter_mut() {
            let Some(entry) = ImageEntry::from_value(entry_value) else {
                continue;
            };
            let Some(source) = entry.source_ref().transpose()? else {
                continue;
            };
            let Some(resolved) = pinned.get(&source.url()) else {
                continue;
            };
            if let Some(map) = entry_value.as_mapping_mut() {
                changed |= set(map, "newName", &resolved.name());
                if !resolved.tag.is_empty() {
                    changed |= set(map, "newTag", &resolved.tag);
                }
                if !resolved.sha.is_empty() {
                    changed |= set(map, "digest", &resolved.sha);
                }
            }
        }

        if changed {
            self.images = seq.iter().filter_map(ImageEntry::from_value).collect();
        }
        Ok(changed)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml::to_string(&self.document)
            .map_err(|e| HydrosError::SerializeYaml(e.to_string()))?;
        fs::write(&self.path, content).map_err(|e| HydrosError::WriteFile {
            path: self.path.clone(),
            source: e,
        })
    }
}

fn set(map: &mut Mapping, key: &str, value: &str) -> bool {
    let key = Value::String(key.to_string());
    let value = Value::String(value.to_string());
    if map.get(&key) == Some(&value) {
        return false;
    }
    map.insert(key, value);
    true
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_mapping)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        Value::Bool(b) => b.to_string(),
                        Value::Number(n) => n.to_string(),
                        _ => return None,
                    };
                    Some((k.as_str()?.to_string(), value))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Compiled `excludeDirs`: plain relative dirs act as prefixes, others as globs.
#[derive(Debug, Default)]
pub struct ExcludeDirs {
    prefixes: Vec<PathBuf>,
    patterns: Vec<glob::Pattern>,
}

impl ExcludeDirs {
    pub fn new(entries: &[String]) -> Result<Self> {
        let mut exclude = Self::default();
        for entry in entries {
            let entry = entry.trim().trim_end_matches('/');
            if entry.is_empty() {
                continue;
            }
            if entry.contains(['*', '?', '[']) {
                let pattern = glob::Pattern::new(entry).map_err(|e| {
                    HydrosError::Validation(format!("invalid excludeDirs pattern '{}': {}", entry, e))
                })?;
                exclude.patterns.push(pattern);
            } else {
                exclude.prefixes.push(PathBuf::from(entry));
            }
        }
        Ok(exclude)
    }

    pub fn is_excluded(&self, relative_dir: &Path) -> bool {
        self.prefixes.iter().any(|p| relative_dir.starts_with(p))
            || self.patterns.iter().any(|p| p.matches_path(relative_dir))
    }
}

/// Finds every kustomization under `root`, skipping hidden and excluded dirs.
pub fn discover_kustomizations(root: &Path, exclude: &ExcludeDirs) -> Result<Vec<KustomizationDoc>> {
    if !root.is_dir() {
        return Err(HydrosError::ReadDirectory {
            path: root.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "directory not found"),
        });
    }

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if relative.as_os_str().is_empty() {
                return true;
            }
            let hidden = entry
                .file_name()
                .to_str()
                .is_some_and(|s| s.starts_with('.'));
            !(hidden || (entry.file_type().is_dir() && exclude.is_excluded(relative)))
        });

    let mut docs = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| HydrosError::FileOperation(e.to_string()))?;
        let is_kustomization = entry.file_type().is_file()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|n| KUSTOMIZATION_FILE_NAMES.contains(&n));
        if is_kustomization {
            docs.push(KustomizationDoc::load(entry.path())?);
        }
    }
    Ok(docs)
}
