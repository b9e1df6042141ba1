//! The per-ManifestSync state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tracing::info_span;

use super::pause::{is_takeover, PauseState};
use super::publish::{publish, settle_existing, Publication, PublishTarget};
use super::status::{changed_images, read_last_sync, status_path, write_last_sync};
use super::Collaborators;
use crate::build::{build_missing, discover_builds};
use crate::config::EngineConfig;
use crate::controller::{ReconcileEvent, Reconciler};
use crate::error::{HydrosError, Result};
use crate::functions::{DispatchPlan, FunctionDispatcher};
use crate::git::{remote_url, GitRepository};
use crate::github::{hydration_message, CheckConclusion, CheckRun, PullRequest};
use crate::image::resolver::registry_host;
use crate::image::{DockerImageRef, ImageTagPolicy};
use crate::kustomize::{discover_kustomizations, hydrate_overlays, ExcludeDirs, KustomizationDoc};
use crate::resource::{validate_manifest_sync, ManifestSync, ManifestSyncStatus};

/// Name of the check run reported on the source commit.
pub const CHECK_NAME: &str = "hydros";

const UPSTREAM: &str = "upstream";

/// How one pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another pass of the same syncer was running.
    Skipped,
    Paused { until: DateTime<Utc> },
    /// Source commit and pinned images match the last published status.
    UpToDate,
    /// Hydration produced the tree already on the destination branch.
    NoChanges,
    /// A pull request was opened and left for review, or closed by someone else.
    Published { pr: PullRequest },
    Merged { pr: PullRequest },
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Skipped => write!(f, "skipped, a pass is already running"),
            SyncOutcome::Paused { until } => write!(f, "paused until {}", until.to_rfc3339()),
            SyncOutcome::UpToDate => write!(f, "up to date"),
            SyncOutcome::NoChanges => write!(f, "no changes to publish"),
            SyncOutcome::Published { pr } => write!(f, "opened pull request #{} {}", pr.number, pr.url),
            SyncOutcome::Merged { pr } => write!(f, "merged pull request #{} {}", pr.number, pr.url),
        }
    }
}

/// Reconciles one ManifestSync.
///
/// Keeps two working copies under `<workDir>/<name>`: `source` on the source
/// branch and `dest`, whose `origin` is the fork and whose `upstream` is the
/// destination repository.
pub struct Syncer {
    sync: ManifestSync,
    config: Arc<EngineConfig>,
    collaborators: Collaborators,
    source: GitRepository,
    dest: GitRepository,
    dispatcher: FunctionDispatcher,
    /// Also serializes passes: a pass holds this lock from start to end.
    pause: Mutex<PauseState>,
}

impl Syncer {
    /// Fails on an invalid ManifestSync before anything touches git or the network.
    pub fn new(
        sync: ManifestSync,
        config: Arc<EngineConfig>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        validate_manifest_sync(&sync)?;

        let workspace = config.work_dir.join(sync.name());
        let source = GitRepository::new(workspace.join("source"), &config.git);
        let dest = GitRepository::new(workspace.join("dest"), &config.git);
        let dispatcher = FunctionDispatcher::new(&config.functions);

        Ok(Self {
            sync,
            config,
            collaborators,
            source,
            dest,
            dispatcher,
            pause: Mutex::new(PauseState::default()),
        })
    }

    pub fn manifest(&self) -> &ManifestSync {
        &self.sync
    }

    /// `sourcePath` inside the source working copy.
    pub fn source_base(&self) -> PathBuf {
        self.source.path().join(&self.sync.spec.source_path)
    }

    /// `destPath` inside the destination working copy.
    pub fn dest_root(&self) -> PathBuf {
        self.dest.path().join(&self.sync.spec.dest_path)
    }

    /// One pass. `force` hydrates and publishes even when nothing changed.
    pub fn run_once(&self, force: bool) -> Result<SyncOutcome> {
        let mut pause = match self.pause.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                info!(
                    "Sync of {} skipped: another pass is already in progress",
                    self.sync.name()
                );
                return Ok(SyncOutcome::Skipped);
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("Previous pass of {} panicked", self.sync.name());
                poisoned.into_inner()
            }
        };

        let _span = info_span!("sync", name = %self.sync.name(), force).entered();
        self.pass(&mut pause, force)
    }

    fn pass(&self, pause: &mut PauseState, force: bool) -> Result<SyncOutcome> {
        let spec = &self.sync.spec;
        let annotations = &self.sync.metadata.annotations;
        let now = Utc::now();
        let takeover = is_takeover(annotations);
        pause.observe(annotations, now)?;

        settle_existing(
            self.collaborators.pull_requests.as_ref(),
            &spec.dest_repo,
            &spec.fork_repo,
            Duration::from_secs(self.config.existing_pr_timeout_secs),
        )?;

        let commit = self.refresh_checkouts()?;
        info!("Source {} is at {}", spec.source_repo.full_name(), commit);

        self.build_images(&commit)?;

        let last_status = read_last_sync(&status_path(&self.dest_root()))?
            .and_then(|last| last.status)
            .unwrap_or_default();

        if pause.is_active(now) {
            if takeover {
                info!("Takeover requested, ignoring the active pause");
            } else if let Some(until) = pause.until() {
                info!("Paused until {}", until.to_rfc3339());
                return Ok(SyncOutcome::Paused { until });
            }
        }

        let mut overlays = self.selected_overlays()?;
        let pinned = self.resolve_images(&overlays, &commit)?;
        let current: BTreeMap<String, String> = pinned
            .iter()
            .map(|(source, resolved)| (source.clone(), resolved.url()))
            .collect();

        if !force && last_status.source_commit == commit && last_status.pinned_map() == current {
            info!("Source commit and pinned images unchanged since the last sync");
            return Ok(SyncOutcome::UpToDate);
        }

        let check = self.open_check(&commit);
        let result = self.hydrate_and_publish(
            &mut overlays,
            &pinned,
            &current,
            &last_status,
            &commit,
            pause.until(),
        );
        self.close_check(check, &result);
        result
    }

    /// Fetches and resets both working copies. Returns the source commit.
    fn refresh_checkouts(&self) -> Result<String> {
        let spec = &self.sync.spec;
        let template = &self.config.git.url_template;

        self.source
            .ensure_initialized(&remote_url(template, &spec.source_repo))?;
        self.source.sync_branch(&spec.source_repo.branch)?;
        let commit = self.source.head_commit()?;

        self.dest
            .ensure_initialized(&remote_url(template, &spec.fork_repo))?;
        self.dest
            .set_remote(UPSTREAM, &remote_url(template, &spec.dest_repo))?;
        if !self.dest.fetch(UPSTREAM, &spec.dest_repo.branch)? {
            return Err(HydrosError::GitOperation(format!(
                "branch '{}' not found in {}",
                spec.dest_repo.branch,
                spec.dest_repo.full_name()
            )));
        }
        self.dest.discard_local_changes()?;
        self.dest
            .checkout_remote_branch(UPSTREAM, &spec.dest_repo.branch, &spec.fork_repo.branch)?;

        Ok(commit)
    }

    fn build_images(&self, commit: &str) -> Result<()> {
        let Some(builder) = &self.collaborators.builder else {
            return Ok(());
        };
        let requests = discover_builds(&self.source_base(), commit, &self.config.builder.floating_tag)?;
        if requests.is_empty() {
            return Ok(());
        }
        let report = build_missing(builder.as_ref(), requests, self.config.builder.parallelism)?;
        info!(
            "{} image(s) already built, {} built now",
            report.present.len(),
            report.built.len()
        );
        Ok(())
    }

    fn selected_overlays(&self) -> Result<Vec<KustomizationDoc>> {
        let spec = &self.sync.spec;
        let exclude = ExcludeDirs::new(&spec.exclude_dirs)?;
        let discovered = discover_kustomizations(&self.source_base(), &exclude)?;
        let total = discovered.len();

        let selected: Vec<_> = discovered
            .into_iter()
            .filter(|k| k.is_selected(spec.selector.as_ref(), &spec.match_annotations))
            .collect();
        info!("Selected {} of {} overlay(s)", selected.len(), total);
        Ok(selected)
    }

    /// Resolves every eligible image of the selected overlays, keyed by source url.
    fn resolve_images(
        &self,
        overlays: &[KustomizationDoc],
        commit: &str,
    ) -> Result<BTreeMap<String, DockerImageRef>> {
        let spec = &self.sync.spec;

        let mut images = BTreeMap::new();
        for overlay in overlays {
            for image in overlay.image_refs()? {
                if is_eligible(&spec.image_registries, &image) {
                    images.entry(image.url()).or_insert(image);
                } else {
                    debug!("{} is not in an eligible registry", image);
                }
            }
        }

        let resolvers = self.collaborators.resolvers.create()?;
        let mut policy = ImageTagPolicy::new(&spec.image_tags_to_pin, &resolvers, commit);
        let resolved = policy.resolve_all(images.values())?;

        Ok(resolved
            .into_iter()
            .map(|(source, resolved)| (source.url(), resolved))
            .collect())
    }

    fn hydrate_and_publish(
        &self,
        overlays: &mut [KustomizationDoc],
        pinned: &BTreeMap<String, DockerImageRef>,
        current: &BTreeMap<String, String>,
        last_status: &ManifestSyncStatus,
        commit: &str,
        pause_until: Option<DateTime<Utc>>,
    ) -> Result<SyncOutcome> {
        let spec = &self.sync.spec;

        for overlay in overlays.iter_mut() {
            if overlay.pin_images(pinned)? {
                overlay.save()?;
            }
        }

        let source_base = self.source_base();
        let dest_root = self.dest_root();
        let kustomizations: Vec<PathBuf> = overlays.iter().map(|o| o.path.clone()).collect();
        let hydrated = hydrate_overlays(
            self.collaborators.hydrator.as_ref(),
            &source_base,
            &kustomizations,
            &dest_root,
        )?;

        self.dispatcher.dispatch(&DispatchPlan {
            source_root: self.source.path(),
            source_base: &source_base,
            functions: &spec.functions,
            hydrated: &hydrated,
            dest_root: &dest_root,
        })?;

        let mut status = ManifestSyncStatus {
            source_commit: commit.to_string(),
            source_url: spec.source_repo.web_url(),
            pause_until,
            ..Default::default()
        };
        status.set_pinned_map(current);
        let mut record = self.sync.clone();
        record.status = Some(status);
        write_last_sync(&status_path(&dest_root), &record)?;

        let changed = changed_images(&last_status.pinned_map(), current);
        let message = hydration_message(&spec.dest_repo.branch, &spec.source_repo, commit, &changed);
        let target = PublishTarget {
            dest: &spec.dest_repo,
            fork: &spec.fork_repo,
            labels: &spec.pr_labels,
            merge_timeout: self
                .config
                .auto_merge
                .then(|| Duration::from_secs(self.config.merge_timeout_secs)),
        };

        let publication = publish(
            &self.dest,
            self.collaborators.pull_requests.as_ref(),
            &target,
            &message,
        )?;
        Ok(match publication {
            Publication::NoChanges => SyncOutcome::NoChanges,
            Publication::Opened(pr) => SyncOutcome::Published { pr },
            Publication::Merged(pr) => SyncOutcome::Merged { pr },
        })
    }

    fn open_check(&self, commit: &str) -> Option<CheckRun> {
        if !self.config.report_checks {
            return None;
        }
        let pulls = &self.collaborators.pull_requests;
        match pulls.create_check(&self.sync.spec.source_repo, commit, CHECK_NAME) {
            Ok(check) => Some(check),
            Err(e) => {
                warn!("Could not create check run on {}: {}", commit, e);
                None
            }
        }
    }

    fn close_check(&self, check: Option<CheckRun>, result: &Result<SyncOutcome>) {
        let Some(check) = check else {
            return;
        };
        let (conclusion, summary) = match result {
            Ok(outcome) => (CheckConclusion::Success, outcome.to_string()),
            Err(e) => (CheckConclusion::Failure, e.to_string()),
        };
        let pulls = &self.collaborators.pull_requests;
        if let Err(e) =
            pulls.complete_check(&self.sync.spec.source_repo, &check, conclusion, &summary)
        {
            warn!("Could not complete check run {}: {}", check.id, e);
        }
    }
}

impl Reconciler for Syncer {
    fn name(&self) -> &str {
        self.sync.name()
    }

    fn run(&self, event: &ReconcileEvent) -> Result<()> {
        if let Some(reason) = &event.reason {
            debug!("Sync of {} triggered: {}", self.sync.name(), reason);
        }
        let outcome = self.run_once(false)?;
        info!("Sync of {}: {}", self.sync.name(), outcome);
        Ok(())
    }
}

/// An empty list makes every registry eligible.
///
/// Entries match the registry host or a prefix of the image name.
fn is_eligible(registries: &[String], image: &DockerImageRef) -> bool {
    registries.is_empty()
        || registries.iter().any(|entry| {
            registry_host(image) == entry.as_str() || image.name().starts_with(entry.as_str())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{MergeState, NewPullRequest, PullRequestService};
    use crate::image::ResolverSet;
    use crate::kustomize::Hydrator;
    use crate::resource::{GitHubRepo, LabelSelector, ManifestSyncSpec, ResourceKind};
    use std::path::Path;
    use tempfile::TempDir;

    struct NoHydrator;

    impl Hydrator for NoHydrator {
        fn build(&self, _overlay_dir: &Path, _output_dir: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct NoPulls;

    impl PullRequestService for NoPulls {
        fn find_open(&self, _dest: &GitHubRepo, _fork: &GitHubRepo) -> Result<Option<PullRequest>> {
            Ok(None)
        }

        fn create(&self, _request: &NewPullRequest<'_>) -> Result<PullRequest> {
            Err(HydrosError::Platform("unexpected".to_string()))
        }

        fn merge_and_wait(
            &self,
            _repo: &GitHubRepo,
            _pr: &PullRequest,
            _timeout: Duration,
        ) -> Result<MergeState> {
            Ok(MergeState::Merged)
        }

        fn create_check(&self, _repo: &GitHubRepo, _head_sha: &str, _name: &str) -> Result<CheckRun> {
            Err(HydrosError::Platform("unexpected".to_string()))
        }

        fn complete_check(
            &self,
            _repo: &GitHubRepo,
            _check: &CheckRun,
            _conclusion: CheckConclusion,
            _summary: &str,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn collaborators() -> Collaborators {
        Collaborators {
            resolvers: Arc::new(|| -> Result<ResolverSet> { Ok(ResolverSet::new()) }),
            hydrator: Arc::new(NoHydrator),
            pull_requests: Arc::new(NoPulls),
            builder: None,
        }
    }

    fn manifest(name: &str) -> ManifestSync {
        ManifestSync::new(
            ResourceKind::ManifestSync,
            name,
            ManifestSyncSpec {
                source_repo: GitHubRepo::new("acme", "manifests", "main"),
                fork_repo: GitHubRepo::new("acme", "hydrated", "hydros/dev"),
                dest_repo: GitHubRepo::new("acme", "hydrated", "main"),
                selector: Some(LabelSelector {
                    match_labels: [("env".to_string(), "dev".to_string())].into_iter().collect(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    fn config(work_dir: &Path) -> Arc<EngineConfig> {
        Arc::new(EngineConfig {
            work_dir: work_dir.to_path_buf(),
            ..Default::default()
        })
    }

    #[test]
    fn test_invalid_manifest_is_rejected_up_front() {
        let dir = TempDir::new().unwrap();
        let mut sync = manifest("dev");
        sync.spec.dest_repo.branch.clear();
        let err = Syncer::new(sync, config(dir.path()), collaborators())
            .err()
            .unwrap();
        assert!(matches!(err, HydrosError::Validation(_)));
        assert!(!dir.path().join("dev").exists());
    }

    #[test]
    fn test_working_copies_live_under_the_sync_name() {
        let dir = TempDir::new().unwrap();
        let mut sync = manifest("dev");
        sync.spec.source_path = "apps".to_string();
        sync.spec.dest_path = "clusters/dev".to_string();
        let syncer = Syncer::new(sync, config(dir.path()), collaborators()).unwrap();
        assert_eq!(syncer.source_base(), dir.path().join("dev/source/apps"));
        assert_eq!(syncer.dest_root(), dir.path().join("dev/dest/clusters/dev"));
    }

    #[test]
    fn test_concurrent_pass_is_skipped() {
        let dir = TempDir::new().unwrap();
        let syncer = Syncer::new(manifest("dev"), config(dir.path()), collaborators()).unwrap();
        let _held = syncer.pause.lock().unwrap();
        assert_eq!(syncer.run_once(false).unwrap(), SyncOutcome::Skipped);
    }

    #[test]
    fn test_eligible_registries() {
        let image = DockerImageRef::parse("ghcr.io/acme/api:latest").unwrap();
        assert!(is_eligible(&[], &image));
        assert!(is_eligible(&["ghcr.io".to_string()], &image));
        assert!(is_eligible(&["ghcr.io/acme".to_string()], &image));
        assert!(!is_eligible(&["quay.io".to_string()], &image));

        let hub = DockerImageRef::parse("nginx:1.25").unwrap();
        assert!(is_eligible(&["docker.io".to_string()], &hub));
    }

    #[test]
    fn test_outcome_display() {
        let pr = PullRequest {
            number: 7,
            url: "https://github.com/acme/hydrated/pull/7".to_string(),
        };
        assert_eq!(
            SyncOutcome::Merged { pr }.to_string(),
            "merged pull request #7 https://github.com/acme/hydrated/pull/7"
        );
        assert_eq!(SyncOutcome::UpToDate.to_string(), "up to date");
    }
}
