//! ManifestSync validation. All problems are collected into one error.

use std::path::{Component, Path};

use super::manifest_sync::{GitHubRepo, ManifestSync, RendererResource, RepoConfigResource};
use crate::error::{HydrosError, Result};
use crate::image::policy::Strategy;

pub fn validate_manifest_sync(sync: &ManifestSync) -> Result<()> {
    let problems = manifest_sync_problems(sync);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(HydrosError::Validation(format!(
            "ManifestSync '{}': {}",
            sync.metadata.name,
            problems.join("; ")
        )))
    }
}

pub fn manifest_sync_problems(sync: &ManifestSync) -> Vec<String> {
    let mut problems = Vec::new();
    let spec = &sync.spec;

    if sync.metadata.name.trim().is_empty() {
        problems.push("metadata.name is required".to_string());
    }

    check_repo("sourceRepo", &spec.source_repo, &mut problems);
    check_repo("forkRepo", &spec.fork_repo, &mut problems);
    check_repo("destRepo", &spec.dest_repo, &mut problems);

    match &spec.selector {
        Some(selector) => problems.extend(selector.problems()),
        None if spec.match_annotations.is_empty() => {
            problems.push("one of selector or matchAnnotations is required".to_string())
        }
        None => {}
    }

    for (i, rule) in spec.image_tags_to_pin.iter().enumerate() {
        if rule.strategy == Strategy::Unknown {
            problems.push(format!("imageTagsToPin[{}]: unknown strategy", i));
        }
        if rule.tags.is_empty() {
            problems.push(format!("imageTagsToPin[{}]: tags must not be empty", i));
        }
    }

    for pattern in &spec.exclude_dirs {
        if let Err(e) = glob::Pattern::new(pattern) {
            problems.push(format!("excludeDirs: invalid pattern '{}': {}", pattern, e));
        }
    }

    if spec.image_registries.iter().any(|r| r.trim().is_empty()) {
        problems.push("imageRegistries must not contain empty entries".to_string());
    }

    check_relative("sourcePath", &spec.source_path, &mut problems);
    check_relative("destPath", &spec.dest_path, &mut problems);
    for (i, function) in spec.functions.iter().enumerate() {
        if function.path.trim().is_empty() {
            problems.push(format!("functions[{}].path is required", i));
        } else {
            check_relative(&format!("functions[{}].path", i), &function.path, &mut problems);
        }
    }

    problems
}

pub fn validate_renderer(renderer: &RendererResource) -> Result<()> {
    let spec = &renderer.spec;
    let mut problems = Vec::new();
    if renderer.metadata.name.trim().is_empty() {
        problems.push("metadata.name is required".to_string());
    }
    check_repo("repo", &spec.repo, &mut problems);
    if spec.fork_branch.trim().is_empty() {
        problems.push("forkBranch is required".to_string());
    } else if spec.fork_branch == spec.repo.branch {
        problems.push("forkBranch must differ from repo.branch".to_string());
    }
    if spec.functions.is_empty() {
        problems.push("at least one function directory is required".to_string());
    }
    check_relative("path", &spec.path, &mut problems);
    for (i, function) in spec.functions.iter().enumerate() {
        check_relative(&format!("functions[{}].path", i), &function.path, &mut problems);
    }
    into_result("Renderer", &renderer.metadata.name, problems)
}

pub fn validate_repo_config(config: &RepoConfigResource) -> Result<()> {
    let mut problems = Vec::new();
    if config.metadata.name.trim().is_empty() {
        problems.push("metadata.name is required".to_string());
    }
    check_repo("repo", &config.spec.repo, &mut problems);
    if config.spec.globs.is_empty() {
        problems.push("at least one glob is required".to_string());
    }
    for pattern in &config.spec.globs {
        if let Err(e) = glob::Pattern::new(pattern) {
            problems.push(format!("globs: invalid pattern '{}': {}", pattern, e));
        }
        check_relative("globs", pattern, &mut problems);
    }
    into_result("RepoConfig", &config.metadata.name, problems)
}

fn into_result(kind: &str, name: &str, problems: Vec<String>) -> Result<()> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(HydrosError::Validation(format!(
            "{} '{}': {}",
            kind,
            name,
            problems.join("; ")
        )))
    }
}

fn check_repo(field: &str, repo: &GitHubRepo, problems: &mut Vec<String>) {
    for (name, value) in [
        ("org", &repo.org),
        ("repo", &repo.repo),
        ("branch", &repo.branch),
    ] {
        if value.trim().is_empty() {
            problems.push(format!("{}.{} is required", field, name));
        }
    }
}

/// Paths are relative to a checkout and must stay inside it.
fn check_relative(field: &str, value: &str, problems: &mut Vec<String>) {
    let path = Path::new(value);
    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        problems.push(format!("{} must be a relative path inside the repository", field));
    }
}
