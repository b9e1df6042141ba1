//! The YAML documents of a hydrated tree, read once and written back once.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value;

use crate::error::{HydrosError, Result};
use crate::resource::loader::{parse_documents, yaml_files};

/// One document of one file, addressed relative to the tree root.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: PathBuf,
    pub index: usize,
    pub value: Value,
}

impl Document {
    pub fn kind(&self) -> Option<&str> {
        self.value.get("kind").and_then(Value::as_str)
    }

    pub fn is_under(&self, dir: &Path) -> bool {
        dir.as_os_str().is_empty() || self.path.starts_with(dir)
    }
}

/// Every document below `root`. Hidden files (the status file included) are skipped.
#[derive(Debug)]
pub struct DocumentSet {
    root: PathBuf,
    documents: Vec<Document>,
    originals: BTreeMap<PathBuf, Vec<Value>>,
}

impl DocumentSet {
    pub fn read(root: &Path) -> Result<Self> {
        let mut documents = Vec::new();
        let mut originals = BTreeMap::new();

        for file in yaml_files(root)? {
            let content = fs::read_to_string(&file).map_err(|e| HydrosError::ReadFile {
                path: file.clone(),
                source: e,
            })?;
            let values = parse_documents(&content, &file)?;
            let relative = file.strip_prefix(root).unwrap_or(&file).to_path_buf();

            for (index, value) in values.iter().enumerate() {
                documents.push(Document {
                    path: relative.clone(),
                    index,
                    value: value.clone(),
                });
            }
            originals.insert(relative, values);
        }

        Ok(Self {
            root: root.to_path_buf(),
            documents,
            originals,
        })
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn take(&mut self) -> Vec<Document> {
        std::mem::take(&mut self.documents)
    }

    pub fn replace(&mut self, documents: Vec<Document>) {
        self.documents = documents;
    }

    /// Writes files whose documents changed. A file left with none is removed.
    ///
    /// Returns the number of files touched.
    pub fn write(&self) -> Result<usize> {
        let mut by_file: BTreeMap<&Path, Vec<&Document>> = BTreeMap::new();
        for document in &self.documents {
            by_file.entry(document.path.as_path()).or_default().push(document);
        }

        let mut touched = 0;
        for (path, original) in &self.originals {
            if !by_file.contains_key(path.as_path()) {
                let full = self.root.join(path);
                fs::remove_file(&full).map_err(|e| HydrosError::WriteFile {
                    path: full.clone(),
                    source: e,
                })?;
                log::debug!("Removed {} ({} documents dropped)", path.display(), original.len());
                touched += 1;
            }
        }

        for (path, mut documents) in by_file {
            documents.sort_by_key(|d| d.index);
            let values: Vec<&Value> = documents.iter().map(|d| &d.value).collect();
            let unchanged = self
                .originals
                .get(path)
                .is_some_and(|original| original.iter().eq(values.iter().copied()));
            if unchanged {
                continue;
            }

            let full = self.root.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).map_err(|e| HydrosError::WriteFile {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
            fs::write(&full, render(&values)?).map_err(|e| HydrosError::WriteFile {
                path: full.clone(),
                source: e,
            })?;
            touched += 1;
        }

        Ok(touched)
    }
}

/// Serializes documents as one YAML stream.
pub fn render(values: &[&Value]) -> Result<String> {
    let mut out = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push_str("---\n");
        }
        out.push_str(
            &serde_yaml::to_string(value).map_err(|e| HydrosError::SerializeYaml(e.to_string()))?,
        );
    }
    Ok(out)
}
