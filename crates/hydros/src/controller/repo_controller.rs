//! Keeps one Syncer per ManifestSync declared in a config repository.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};
use tracing::info_span;

use super::reconciler::{ReconcileEvent, Reconciler};
use crate::config::EngineConfig;
use crate::error::{HydrosError, Result};
use crate::git::{remote_url, GitRepository};
use crate::resource::{
    load_manifest_sync_file, validate_repo_config, ManifestSync, RepoConfigResource,
    ResourceKind,
};
use crate::sync::{Collaborators, Syncer};

pub struct RepoController {
    resource: RepoConfigResource,
    config: Arc<EngineConfig>,
    collaborators: Collaborators,
    checkout: GitRepository,
    /// Doubles as the pass lock.
    syncers: Mutex<BTreeMap<String, Arc<Syncer>>>,
}

impl RepoController {
    pub fn new(
        resource: RepoConfigResource,
        config: Arc<EngineConfig>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        validate_repo_config(&resource)?;
        let checkout = GitRepository::new(
            config.work_dir.join(resource.name()).join("config"),
            &config.git,
        );
        Ok(Self {
            resource,
            config,
            collaborators,
            checkout,
            syncers: Mutex::new(BTreeMap::new()),
        })
    }

    /// Names of the ManifestSyncs found by the last pass.
    pub fn sync_names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Refreshes the config checkout, reconciles the Syncer set and runs each once.
    pub fn run_once(&self) -> Result<()> {
        let mut syncers = match self.syncers.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::WouldBlock) => {
                info!(
                    "Repo controller {} skipped: another pass is already in progress",
                    self.resource.name()
                );
                return Ok(());
            }
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let _span = info_span!("repo", name = %self.resource.name()).entered();

        let repo = &self.resource.spec.repo;
        self.checkout
            .ensure_initialized(&remote_url(&self.config.git.url_template, repo))?;
        self.checkout.sync_branch(&repo.branch)?;

        let desired = self.load_desired()?;
        let mut failures = Vec::new();

        let stale: Vec<String> = syncers
            .keys()
            .filter(|name| !desired.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            info!("ManifestSync {} removed", name);
            syncers.remove(&name);
        }

        for (name, sync) in desired {
            let unchanged = syncers.get(&name).is_some_and(|s| *s.manifest() == sync);
            if unchanged {
                continue;
            }
            match Syncer::new(sync, Arc::clone(&self.config), self.collaborators.clone()) {
                Ok(syncer) => {
                    info!("ManifestSync {} loaded", name);
                    syncers.insert(name, Arc::new(syncer));
                }
                Err(e) => {
                    syncers.remove(&name);
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        let total = syncers.len() + failures.len();
        for (name, syncer) in syncers.iter() {
            match syncer.run_once(false) {
                Ok(outcome) => info!("Sync of {}: {}", name, outcome),
                Err(e) => {
                    warn!("Sync of {} failed: {}", name, e);
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HydrosError::Reconcile { total, failures })
        }
    }

    /// Every ManifestSync matched by the globs, keyed by name.
    fn load_desired(&self) -> Result<BTreeMap<String, ManifestSync>> {
        let mut files = BTreeSet::new();
        for pattern in &self.resource.spec.globs {
            for file in self.glob_files(pattern)? {
                files.insert(file);
            }
        }

        let mut desired = BTreeMap::new();
        for file in files {
            for sync in load_manifest_sync_file(&file)? {
                let name = sync.name().to_string();
                if desired.insert(name.clone(), sync).is_some() {
                    return Err(HydrosError::DuplicateName {
                        kind: ResourceKind::ManifestSync.to_string(),
                        name,
                    });
                }
            }
        }
        Ok(desired)
    }

    fn glob_files(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let full = self.checkout.path().join(pattern);
        let full = full.to_string_lossy();
        let paths = glob::glob(&full).map_err(|e| {
            HydrosError::Validation(format!("invalid glob '{}': {}", pattern, e))
        })?;

        let mut files = Vec::new();
        for entry in paths {
            let path = entry.map_err(|e| HydrosError::FileOperation(e.to_string()))?;
            if path.is_file() {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Syncer>>> {
        self.syncers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Reconciler for RepoController {
    fn name(&self) -> &str {
        self.resource.name()
    }

    fn run(&self, _event: &ReconcileEvent) -> Result<()> {
        self.run_once()
    }
}
