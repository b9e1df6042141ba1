//! Runs functions in place over a directory of one repository.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use tracing::info_span;

use super::reconciler::{ReconcileEvent, Reconciler};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::functions::{DispatchPlan, FunctionDispatcher};
use crate::git::{remote_url, GitRepository};
use crate::github::render_message;
use crate::resource::{validate_renderer, GitHubRepo, RendererResource};
use crate::sync::{publish, settle_existing, Collaborators, Publication, PublishTarget, SyncOutcome};

pub struct Renderer {
    resource: RendererResource,
    config: Arc<EngineConfig>,
    collaborators: Collaborators,
    checkout: GitRepository,
    dispatcher: FunctionDispatcher,
    running: Mutex<()>,
}

impl Renderer {
    pub fn new(
        resource: RendererResource,
        config: Arc<EngineConfig>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        validate_renderer(&resource)?;
        let checkout = GitRepository::new(
            config.work_dir.join(resource.name()).join("repo"),
            &config.git,
        );
        let dispatcher = FunctionDispatcher::new(&config.functions);
        Ok(Self {
            resource,
            config,
            collaborators,
            checkout,
            dispatcher,
            running: Mutex::new(()),
        })
    }

    /// The branch pull requests are opened from.
    pub fn fork(&self) -> GitHubRepo {
        GitHubRepo {
            branch: self.resource.spec.fork_branch.clone(),
            ..self.resource.spec.repo.clone()
        }
    }

    pub fn render_root(&self) -> PathBuf {
        self.checkout.path().join(&self.resource.spec.path)
    }

    pub fn run_once(&self) -> Result<SyncOutcome> {
        let _guard = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!(
                    "Render of {} skipped: another pass is already in progress",
                    self.resource.name()
                );
                return Ok(SyncOutcome::Skipped);
            }
        };
        let _span = info_span!("render", name = %self.resource.name()).entered();

        let spec = &self.resource.spec;
        let fork = self.fork();
        let pulls = self.collaborators.pull_requests.as_ref();

        settle_existing(
            pulls,
            &spec.repo,
            &fork,
            Duration::from_secs(self.config.existing_pr_timeout_secs),
        )?;

        self.checkout
            .ensure_initialized(&remote_url(&self.config.git.url_template, &spec.repo))?;
        self.checkout.sync_branch(&spec.repo.branch)?;
        let commit = self.checkout.head_commit()?;

        let root = self.render_root();
        let rewritten = self.dispatcher.dispatch(&DispatchPlan {
            source_root: self.checkout.path(),
            source_base: &root,
            functions: &spec.functions,
            hydrated: &[],
            dest_root: &root,
        })?;
        info!("Functions rewrote {} file(s)", rewritten);

        let message = render_message(&spec.repo, &spec.path, &commit);
        let target = PublishTarget {
            dest: &spec.repo,
            fork: &fork,
            labels: &spec.pr_labels,
            merge_timeout: self
                .config
                .auto_merge
                .then(|| Duration::from_secs(self.config.merge_timeout_secs)),
        };
        Ok(match publish(&self.checkout, pulls, &target, &message)? {
            Publication::NoChanges => SyncOutcome::NoChanges,
            Publication::Opened(pr) => SyncOutcome::Published { pr },
            Publication::Merged(pr) => SyncOutcome::Merged { pr },
        })
    }
}

impl Reconciler for Renderer {
    fn name(&self) -> &str {
        self.resource.name()
    }

    fn run(&self, _event: &ReconcileEvent) -> Result<()> {
        let outcome = self.run_once()?;
        info!("Render of {}: {}", self.resource.name(), outcome);
        Ok(())
    }
}
