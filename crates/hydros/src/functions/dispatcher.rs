//! Deciding which functions run against which hydrated directories, and in what order.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde_yaml::{Mapping, Value};
use tracing::info_span;

use super::document::{Document, DocumentSet};
use super::filters::{
    annotation, is_function_document, FunctionKind, FunctionRuntime, WRAP_ANNOTATION,
};
use crate::config::FunctionsConfig;
use crate::error::{HydrosError, Result};
use crate::kustomize::TargetPath;
use crate::resource::loader::{parse_documents, yaml_files};
use crate::resource::FunctionRef;

pub const SOURCE_DIR_ANNOTATION: &str = "hydros.dev/source-dir";
pub const TARGET_DIR_ANNOTATION: &str = "hydros.dev/target-dir";

/// Where a document came from, stamped on everything handed to a function.
pub const PATH_ANNOTATION: &str = "config.kubernetes.io/path";
pub const INDEX_ANNOTATION: &str = "config.kubernetes.io/index";
pub const INTERNAL_PATH_ANNOTATION: &str = "internal.config.kubernetes.io/path";
pub const INTERNAL_INDEX_ANNOTATION: &str = "internal.config.kubernetes.io/index";

const ADDRESS_ANNOTATIONS: [&str; 4] = [
    PATH_ANNOTATION,
    INDEX_ANNOTATION,
    INTERNAL_PATH_ANNOTATION,
    INTERNAL_INDEX_ANNOTATION,
];

/// A function document discovered in the source tree.
#[derive(Debug, Clone)]
pub struct Function {
    /// Directory holding the declaration, relative to the source repository root.
    pub source_dir: PathBuf,
    pub source_file: PathBuf,
    pub config: Value,
    pub kind: FunctionKind,
    pub wrap_configmaps: bool,
    /// Directory the function applies to, relative to the hydrated root.
    pub target_dir: PathBuf,
}

impl Function {
    fn annotate(&mut self) {
        let source_dir = path_string(&self.source_dir);
        let target_dir = path_string(&self.target_dir);
        if let Some(annotations) = annotations_mut(&mut self.config) {
            annotations.insert(SOURCE_DIR_ANNOTATION.into(), source_dir.into());
            annotations.insert(TARGET_DIR_ANNOTATION.into(), target_dir.into());
        }
    }
}

/// `metadata.annotations` of a mapping document, created when missing.
fn annotations_mut(value: &mut Value) -> Option<&mut Mapping> {
    let metadata = value
        .as_mapping_mut()?
        .entry(Value::from("metadata"))
        .or_insert_with(|| Value::Mapping(Default::default()))
        .as_mapping_mut()?;
    metadata
        .entry(Value::from("annotations"))
        .or_insert_with(|| Value::Mapping(Default::default()))
        .as_mapping_mut()
}

/// Collects function documents below each declared directory of `source_root`.
///
/// A document reachable from two declared directories is returned once.
pub fn discover_functions(source_root: &Path, refs: &[FunctionRef]) -> Result<Vec<Function>> {
    let mut seen = HashSet::new();
    let mut functions = Vec::new();

    for function_ref in refs {
        let root = source_root.join(&function_ref.path);
        if !root.is_dir() {
            return Err(HydrosError::Function {
                path: root,
                message: "function directory does not exist".to_string(),
            });
        }

        for file in yaml_files(&root)? {
            if !seen.insert(file.clone()) {
                continue;
            }
            let content = fs::read_to_string(&file).map_err(|e| HydrosError::ReadFile {
                path: file.clone(),
                source: e,
            })?;
            let dir = file.parent().unwrap_or(&root).to_path_buf();
            let source_dir = dir.strip_prefix(source_root).unwrap_or(&dir).to_path_buf();

            for document in parse_documents(&content, &file)? {
                let Some(kind) = FunctionKind::from_document(&document, &dir, &file)? else {
                    continue;
                };
                let wrap_configmaps = annotation(&document, WRAP_ANNOTATION) == Some("true");
                functions.push(Function {
                    source_dir: source_dir.clone(),
                    source_file: file.clone(),
                    config: document,
                    kind,
                    wrap_configmaps,
                    target_dir: PathBuf::new(),
                });
            }
        }
    }

    Ok(functions)
}

/// Deepest declaration first. Equal depths keep discovery order.
pub fn order_functions(functions: &mut [Function]) {
    functions.sort_by_key(|f| std::cmp::Reverse(f.source_dir.as_os_str().len()));
}

/// Where a function declared in `function_dir` lands in the hydrated tree.
///
/// `function_dir` is relative to the source base. The longest hydrated
/// directory enclosing it wins; without one the directory is mirrored.
pub fn function_target_dir(function_dir: &Path, hydrated: &[TargetPath]) -> PathBuf {
    hydrated
        .iter()
        .map(TargetPath::dir_path)
        .filter(|dir| function_dir.starts_with(dir))
        .max_by_key(|dir| dir.as_os_str().len())
        .unwrap_or_else(|| function_dir.to_path_buf())
}

/// Input of one dispatch over a hydrated tree.
#[derive(Debug, Clone, Copy)]
pub struct DispatchPlan<'a> {
    /// Root of the source checkout; function paths are relative to it.
    pub source_root: &'a Path,
    /// Base of the overlays that were hydrated (`sourcePath`).
    pub source_base: &'a Path,
    pub functions: &'a [FunctionRef],
    pub hydrated: &'a [TargetPath],
    pub dest_root: &'a Path,
}

#[derive(Debug, Clone)]
pub struct FunctionDispatcher {
    runtime: FunctionRuntime,
}

impl FunctionDispatcher {
    pub fn new(config: &FunctionsConfig) -> Self {
        Self {
            runtime: FunctionRuntime {
                allow_exec: config.allow_exec,
                exec_timeout: Duration::from_secs(config.exec_timeout_secs),
            },
        }
    }

    /// Discovers, orders and runs every function. Nothing is written unless all succeed.
    ///
    /// Returns the number of files rewritten.
    pub fn dispatch(&self, plan: &DispatchPlan<'_>) -> Result<usize> {
        if plan.functions.is_empty() {
            return Ok(0);
        }
        let _span = info_span!("functions", dest = %plan.dest_root.display()).entered();

        let mut functions = discover_functions(plan.source_root, plan.functions)?;
        let base = plan
            .source_base
            .strip_prefix(plan.source_root)
            .unwrap_or(Path::new(""));
        for function in &mut functions {
            function.target_dir = match function.source_dir.strip_prefix(base) {
                Ok(relative) => function_target_dir(relative, plan.hydrated),
                Err(_) => PathBuf::new(),
            };
            function.annotate();
        }
        order_functions(&mut functions);

        self.run(&functions, plan.dest_root)
    }

    /// Runs `functions` in order as one pipeline over the documents under `root`.
    pub fn run(&self, functions: &[Function], root: &Path) -> Result<usize> {
        let mut documents = DocumentSet::read(root)?;
        log::info!(
            "Running {} function(s) over {} document(s) in {}",
            functions.len(),
            documents.len(),
            root.display()
        );

        for function in functions {
            let mut rest = Vec::new();
            let mut stamps = HashMap::new();
            let mut values = Vec::new();
            for mut document in documents.take() {
                if !document.is_under(&function.target_dir) || is_function_document(&document.value)
                {
                    rest.push(document);
                    continue;
                }
                match stamp(&mut document) {
                    Some(stamp) => {
                        stamps.insert((document.path, document.index), stamp);
                        values.push(document.value);
                    }
                    None => rest.push(document),
                }
            }

            log::debug!(
                "{} from {} on {} ({} documents)",
                function.kind.name(),
                function.source_file.display(),
                path_string(&function.target_dir),
                values.len()
            );
            let result = if function.wrap_configmaps {
                self.runtime
                    .apply_wrapped(&function.kind, &function.config, values)
            } else {
                self.runtime.apply(&function.kind, &function.config, values)
            };
            let transformed = result.map_err(|e| match e {
                HydrosError::Function { .. } => e,
                other => HydrosError::Function {
                    path: function.source_file.clone(),
                    message: other.to_string(),
                },
            })?;

            documents.replace(reattach(rest, &stamps, transformed, function)?);
        }

        documents.write()
    }
}

/// What a document looked like before its address was stamped on it.
#[derive(Debug, Clone, Copy)]
struct Stamp {
    had_metadata: bool,
    had_annotations: bool,
}

/// Records the file and position of `document` in its own annotations.
///
/// Returns `None` for documents that cannot carry annotations.
fn stamp(document: &mut Document) -> Option<Stamp> {
    let metadata = document.value.get("metadata");
    let stamp = Stamp {
        had_metadata: metadata.is_some(),
        had_annotations: metadata.and_then(|m| m.get("annotations")).is_some(),
    };
    let path = path_string(&document.path);
    let index = document.index.to_string();
    let annotations = annotations_mut(&mut document.value)?;
    annotations.insert(PATH_ANNOTATION.into(), path.as_str().into());
    annotations.insert(INDEX_ANNOTATION.into(), index.as_str().into());
    annotations.insert(INTERNAL_PATH_ANNOTATION.into(), path.into());
    annotations.insert(INTERNAL_INDEX_ANNOTATION.into(), index.into());
    Some(stamp)
}

/// Removes the address annotations from `value` and returns the address they named.
///
/// The internal keys win over the legacy ones.
fn unstamp(value: &mut Value) -> Option<(String, String)> {
    let annotations = value
        .get_mut("metadata")
        .and_then(|m| m.get_mut("annotations"))
        .and_then(Value::as_mapping_mut)?;
    let mut found: HashMap<&str, String> = HashMap::new();
    for key in ADDRESS_ANNOTATIONS {
        if let Some(Value::String(v)) = annotations.remove(key) {
            found.insert(key, v);
        }
    }
    let path = found
        .remove(INTERNAL_PATH_ANNOTATION)
        .or_else(|| found.remove(PATH_ANNOTATION))?;
    let index = found
        .remove(INTERNAL_INDEX_ANNOTATION)
        .or_else(|| found.remove(INDEX_ANNOTATION))?;
    Some((path, index))
}

/// Drops the `annotations` and `metadata` maps that stamping created and left empty.
fn restore_shape(value: &mut Value, stamp: Stamp) {
    let Some(metadata) = value.get_mut("metadata").and_then(Value::as_mapping_mut) else {
        return;
    };
    let annotations_empty = metadata
        .get("annotations")
        .and_then(Value::as_mapping)
        .is_some_and(Mapping::is_empty);
    if annotations_empty && !stamp.had_annotations {
        metadata.remove("annotations");
    }
    if metadata.is_empty() && !stamp.had_metadata {
        if let Some(root) = value.as_mapping_mut() {
            root.remove("metadata");
        }
    }
}

/// Puts a function's output back in the files its address annotations name.
///
/// Documents the function dropped are gone; a file left with none is removed
/// on write. Documents without an address are new and go to a generated file
/// in the function's target directory.
fn reattach(
    mut rest: Vec<Document>,
    stamps: &HashMap<(PathBuf, usize), Stamp>,
    transformed: Vec<Value>,
    function: &Function,
) -> Result<Vec<Document>> {
    let generated = function.target_dir.join("generated.yaml");
    let mut next_generated = rest.iter().filter(|d| d.path == generated).count();

    for mut value in transformed {
        let address = match unstamp(&mut value) {
            Some((path, index)) => Some(parse_address(&path, &index).ok_or_else(|| {
                HydrosError::Function {
                    path: function.source_file.clone(),
                    message: format!("invalid document address {}:{}", path, index),
                }
            })?),
            None => None,
        };

        let (path, index) = match address {
            Some(address) => {
                if let Some(stamp) = stamps.get(&address) {
                    restore_shape(&mut value, *stamp);
                }
                address
            }
            None => {
                next_generated += 1;
                (generated.clone(), next_generated - 1)
            }
        };
        rest.push(Document { path, index, value });
    }

    rest.sort_by(|a, b| a.path.cmp(&b.path).then(a.index.cmp(&b.index)));
    Ok(rest)
}

/// A relative path that stays inside the tree, and a numeric index.
fn parse_address(path: &str, index: &str) -> Option<(PathBuf, usize)> {
    let path = PathBuf::from(path);
    let contained = path.components().next().is_some()
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if !contained {
        return None;
    }
    Some((path, index.parse().ok()?))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
