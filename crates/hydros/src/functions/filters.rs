//! Transformation functions and how each one rewrites a list of documents.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::error::{HydrosError, Result};
use crate::process::{describe, run_with_timeout};
use crate::resource::loader::parse_documents;

/// API version of the built-in functions.
pub const FUNCTIONS_API_VERSION: &str = "fns.hydros.dev/v1alpha1";

/// Annotation declaring an exec function, as used by KRM function runners.
pub const FUNCTION_ANNOTATION: &str = "config.kubernetes.io/function";

/// `"true"` applies the function inside ConfigMap payloads instead of top-level documents.
pub const WRAP_ANNOTATION: &str = "hydros.dev/wrap-configmaps";

const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "PersistentVolume",
    "StorageClass",
    "PriorityClass",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
    "APIService",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageMapping {
    pub src: String,
    pub dest: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionKind {
    SetLabels(Mapping),
    SetAnnotations(Mapping),
    SetNamespace(String),
    ImagePrefix(Vec<ImageMapping>),
    Exec(PathBuf),
}

#[derive(Debug, Deserialize)]
struct ExecAnnotation {
    exec: ExecSpec,
}

#[derive(Debug, Deserialize)]
struct ExecSpec {
    path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct BuiltinSpec {
    labels: Mapping,
    annotations: Mapping,
    namespace: String,
    image_mappings: Vec<ImageMapping>,
}

impl FunctionKind {
    /// Interprets a document found in a function directory.
    ///
    /// Documents that are not functions yield `Ok(None)`.
    pub fn from_document(document: &Value, dir: &Path, file: &Path) -> Result<Option<Self>> {
        if let Some(declaration) = annotation(document, FUNCTION_ANNOTATION) {
            let parsed: ExecAnnotation =
                serde_yaml::from_str(declaration).map_err(|e| HydrosError::Function {
                    path: file.to_path_buf(),
                    message: format!("invalid {} annotation: {}", FUNCTION_ANNOTATION, e),
                })?;
            let path = Path::new(&parsed.exec.path);
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                dir.join(path)
            };
            return Ok(Some(FunctionKind::Exec(path)));
        }

        if document.get("apiVersion").and_then(Value::as_str) != Some(FUNCTIONS_API_VERSION) {
            return Ok(None);
        }

        let spec: BuiltinSpec = match document.get("spec") {
            Some(spec) => serde_yaml::from_value(spec.clone()).map_err(|e| HydrosError::Function {
                path: file.to_path_buf(),
                message: format!("invalid spec: {}", e),
            })?,
            None => BuiltinSpec::default(),
        };

        let kind = document.get("kind").and_then(Value::as_str).unwrap_or_default();
        let function = match kind {
            "SetLabels" => FunctionKind::SetLabels(spec.labels),
            "SetAnnotations" => FunctionKind::SetAnnotations(spec.annotations),
            "SetNamespace" if !spec.namespace.is_empty() => {
                FunctionKind::SetNamespace(spec.namespace)
            }
            "SetNamespace" => {
                return Err(HydrosError::Function {
                    path: file.to_path_buf(),
                    message: "SetNamespace needs spec.namespace".to_string(),
                })
            }
            "ImagePrefix" => FunctionKind::ImagePrefix(spec.image_mappings),
            other => {
                return Err(HydrosError::Function {
                    path: file.to_path_buf(),
                    message: format!("unknown function kind '{}'", other),
                })
            }
        };
        Ok(Some(function))
    }

    pub fn name(&self) -> &'static str {
        match self {
            FunctionKind::SetLabels(_) => "SetLabels",
            FunctionKind::SetAnnotations(_) => "SetAnnotations",
            FunctionKind::SetNamespace(_) => "SetNamespace",
            FunctionKind::ImagePrefix(_) => "ImagePrefix",
            FunctionKind::Exec(_) => "Exec",
        }
    }
}

/// Settings for functions that run external programs.
#[derive(Debug, Clone)]
pub struct FunctionRuntime {
    pub allow_exec: bool,
    pub exec_timeout: Duration,
}

impl FunctionRuntime {
    /// Applies `kind` to `documents`. `config` is handed to exec functions as `functionConfig`.
    pub fn apply(
        &self,
        kind: &FunctionKind,
        config: &Value,
        documents: Vec<Value>,
    ) -> Result<Vec<Value>> {
        match kind {
            FunctionKind::SetLabels(labels) => Ok(map_resources(documents, |doc| {
                merge_metadata(doc, "labels", labels)
            })),
            FunctionKind::SetAnnotations(annotations) => Ok(map_resources(documents, |doc| {
                merge_metadata(doc, "annotations", annotations)
            })),
            FunctionKind::SetNamespace(namespace) => Ok(map_resources(documents, |doc| {
                let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default();
                if !CLUSTER_SCOPED_KINDS.contains(&kind) {
                    if let Some(metadata) = metadata_mut(doc) {
                        metadata.insert(Value::from("namespace"), Value::from(namespace.as_str()));
                    }
                }
            })),
            FunctionKind::ImagePrefix(mappings) => Ok(map_resources(documents, |doc| {
                rewrite_images(doc, mappings)
            })),
            FunctionKind::Exec(path) => self.exec(path, config, documents),
        }
    }

    /// Applies `kind` to the resources embedded in ConfigMap data values.
    pub fn apply_wrapped(
        &self,
        kind: &FunctionKind,
        config: &Value,
        documents: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(documents.len());
        for mut document in documents {
            if document.get("kind").and_then(Value::as_str) == Some("ConfigMap") {
                if let Some(Value::Mapping(data)) = document.get_mut("data") {
                    for (_, payload) in data.iter_mut() {
                        if let Value::String(text) = payload {
                            if let Some(rewritten) = self.apply_to_payload(kind, config, text)? {
                                *text = rewritten;
                            }
                        }
                    }
                }
            }
            out.push(document);
        }
        Ok(out)
    }

    fn apply_to_payload(
        &self,
        kind: &FunctionKind,
        config: &Value,
        text: &str,
    ) -> Result<Option<String>> {
        let embedded = match parse_documents(text, Path::new("<configmap>")) {
            Ok(docs) if !docs.is_empty() && docs.iter().all(is_resource) => docs,
            _ => return Ok(None),
        };
        let transformed = self.apply(kind, config, embedded)?;
        let refs: Vec<&Value> = transformed.iter().collect();
        super::document::render(&refs).map(Some)
    }

    fn exec(&self, path: &Path, config: &Value, documents: Vec<Value>) -> Result<Vec<Value>> {
        if !self.allow_exec {
            return Err(HydrosError::Function {
                path: path.to_path_buf(),
                message: "exec functions are disabled (functions.allowExec)".to_string(),
            });
        }

        let mut list = Mapping::new();
        list.insert("apiVersion".into(), "config.kubernetes.io/v1".into());
        list.insert("kind".into(), "ResourceList".into());
        list.insert("items".into(), Value::Sequence(documents));
        list.insert("functionConfig".into(), config.clone());
        let input = serde_yaml::to_string(&Value::Mapping(list))
            .map_err(|e| HydrosError::SerializeYaml(e.to_string()))?;

        let mut cmd = Command::new(path);
        if let Some(dir) = path.parent() {
            cmd.current_dir(dir);
        }
        let output = run_with_timeout(&cmd, Some(input.into_bytes()), self.exec_timeout)?;
        if !output.success() {
            return Err(HydrosError::Function {
                path: path.to_path_buf(),
                message: format!(
                    "{} exited with {}: {}",
                    describe(&cmd),
                    output.status,
                    output.stderr.trim()
                ),
            });
        }

        let result: Value = serde_yaml::from_str(&output.stdout).map_err(|e| HydrosError::Function {
            path: path.to_path_buf(),
            message: format!("output is not a ResourceList: {}", e),
        })?;
        check_results(path, &result)?;

        match result.get("items") {
            Some(Value::Sequence(items)) => Ok(items.clone()),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(_) => Err(HydrosError::Function {
                path: path.to_path_buf(),
                message: "ResourceList items must be a list".to_string(),
            }),
        }
    }
}

/// Fails on any `results` entry with severity `error`.
fn check_results(path: &Path, list: &Value) -> Result<()> {
    let Some(Value::Sequence(results)) = list.get("results") else {
        return Ok(());
    };
    let errors: Vec<String> = results
        .iter()
        .filter(|r| r.get("severity").and_then(Value::as_str) == Some("error"))
        .map(|r| {
            r.get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified error")
                .to_string()
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(HydrosError::Function {
            path: path.to_path_buf(),
            message: errors.join("; "),
        })
    }
}

pub fn annotation<'a>(document: &'a Value, key: &str) -> Option<&'a str> {
    document
        .get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(key))
        .and_then(Value::as_str)
}

/// Function declarations are configuration, never pipeline input.
pub fn is_function_document(document: &Value) -> bool {
    document.get("apiVersion").and_then(Value::as_str) == Some(FUNCTIONS_API_VERSION)
        || annotation(document, FUNCTION_ANNOTATION).is_some()
}

fn is_resource(value: &Value) -> bool {
    value.is_mapping() && value.get("kind").is_some_and(Value::is_string)
}

fn map_resources(documents: Vec<Value>, mut f: impl FnMut(&mut Value)) -> Vec<Value> {
    documents
        .into_iter()
        .map(|mut doc| {
            if is_resource(&doc) {
                f(&mut doc);
            }
            doc
        })
        .collect()
}

fn metadata_mut(document: &mut Value) -> Option<&mut Mapping> {
    let root = document.as_mapping_mut()?;
    let metadata = root
        .entry(Value::from("metadata"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    metadata.as_mapping_mut()
}

fn merge_metadata(document: &mut Value, field: &str, entries: &Mapping) {
    let Some(metadata) = metadata_mut(document) else {
        return;
    };
    let target = metadata
        .entry(Value::from(field))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if target.is_null() {
        *target = Value::Mapping(Mapping::new());
    }
    if let Some(target) = target.as_mapping_mut() {
        for (key, value) in entries {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Rewrites every string under an `image` key whose prefix matches a mapping.
fn rewrite_images(value: &mut Value, mappings: &[ImageMapping]) {
    match value {
        Value::Mapping(map) => {
            for (key, child) in map.iter_mut() {
                if key.as_str() == Some("image") {
                    if let Value::String(image) = child {
                        if let Some(m) = mappings.iter().find(|m| image.starts_with(&m.src)) {
                            *image = format!("{}{}", m.dest, &image[m.src.len()..]);
                        }
                        continue;
                    }
                }
                rewrite_images(child, mappings);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                rewrite_images(item, mappings);
            }
        }
        _ => {}
    }
}
