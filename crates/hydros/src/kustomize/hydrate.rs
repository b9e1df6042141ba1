//! Rendering overlays through the external build tool.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use super::target::{generate_target_path, TargetPath};
use crate::config::KustomizeConfig;
use crate::error::{HydrosError, Result};
use crate::process::{describe, run_with_timeout};

/// Renders one overlay directory into an output directory.
pub trait Hydrator: Send + Sync {
    fn build(&self, overlay_dir: &Path, output_dir: &Path) -> Result<()>;
}

/// Runs `<command> build <overlay> -o <output>`.
#[derive(Debug, Clone)]
pub struct KustomizeCli {
    command: String,
    timeout: Duration,
}

impl KustomizeCli {
    pub fn new(config: &KustomizeConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl Hydrator for KustomizeCli {
    fn build(&self, overlay_dir: &Path, output_dir: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("build").arg(overlay_dir).arg("-o").arg(output_dir);

        log::debug!("Running {}", describe(&cmd));
        let output = run_with_timeout(&cmd, None, self.timeout)?;
        if !output.success() {
            return Err(HydrosError::BuildTool {
                command: describe(&cmd),
                message: format!("exit {}: {}", output.status, output.stderr.trim()),
            });
        }
        Ok(())
    }
}

/// Hydrated output dir for each selected overlay, checked for collisions.
///
/// Fails before anything is written if two overlays share a target directory.
pub fn plan_targets(
    source_base: &Path,
    kustomizations: &[PathBuf],
) -> Result<BTreeMap<String, (PathBuf, TargetPath)>> {
    let mut targets: BTreeMap<String, (PathBuf, TargetPath)> = BTreeMap::new();
    for kustomization in kustomizations {
        let target = generate_target_path(source_base, kustomization)?;
        if let Some((first, _)) = targets.get(&target.dir) {
            return Err(HydrosError::OverlayCollision {
                dir: target.dir_path(),
                first: first.clone(),
                second: kustomization.clone(),
            });
        }
        targets.insert(target.dir.clone(), (kustomization.clone(), target));
    }
    Ok(targets)
}

/// Replaces `dest_root` with freshly rendered output of every overlay.
pub fn hydrate_overlays(
    hydrator: &dyn Hydrator,
    source_base: &Path,
    kustomizations: &[PathBuf],
    dest_root: &Path,
) -> Result<Vec<TargetPath>> {
    let targets = plan_targets(source_base, kustomizations)?;

    clear_dir(dest_root)?;

    let mut hydrated = Vec::with_capacity(targets.len());
    for (kustomization, target) in targets.into_values() {
        let overlay_dir = kustomization.parent().unwrap_or(source_base);
        let output_dir = dest_root.join(target.dir_path());
        fs::create_dir_all(&output_dir).map_err(|e| HydrosError::WriteFile {
            path: output_dir.clone(),
            source: e,
        })?;

        log::info!(
            "Hydrating {} into {}",
            overlay_dir.display(),
            output_dir.display()
        );
        hydrator.build(overlay_dir, &output_dir)?;
        hydrated.push(target);
    }
    Ok(hydrated)
}

/// Empties `dir`, creating it if needed. A `.git` entry survives so the
/// destination may be the checkout root.
fn clear_dir(dir: &Path) -> Result<()> {
    let write_error = |path: &Path, e| HydrosError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    };
    fs::create_dir_all(dir).map_err(|e| write_error(dir, e))?;

    for entry in fs::read_dir(dir).map_err(|e| write_error(dir, e))? {
        let entry = entry.map_err(|e| write_error(dir, e))?;
        if entry.file_name() == ".git" {
            continue;
        }
        let path = entry.path();
        let removed = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| write_error(&path, e))?;
    }
    Ok(())
}
