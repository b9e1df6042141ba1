//! The sync engine: one ManifestSync reconciled per pass.

pub mod pause;
pub mod publish;
pub mod status;
pub mod syncer;

use std::sync::Arc;

use crate::build::{DockerCliBuilder, ImageBuilder};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::github::{GitHubClient, PullRequestService};
use crate::image::{default_resolvers, ResolverFactory};
use crate::kustomize::{Hydrator, KustomizeCli};

pub use pause::{is_takeover, parse_duration, parse_pause, PauseState};
pub use publish::{publish, settle_existing, Publication, PublishTarget};
pub use status::{changed_images, read_last_sync, status_path, write_last_sync, STATUS_FILE_NAME};
pub use syncer::{SyncOutcome, Syncer};

/// External collaborators shared by every reconciler of one engine.
#[derive(Clone)]
pub struct Collaborators {
    /// Creates fresh registry backends for each pass.
    pub resolvers: Arc<dyn ResolverFactory>,
    pub hydrator: Arc<dyn Hydrator>,
    pub pull_requests: Arc<dyn PullRequestService>,
    /// Present only when image building is enabled.
    pub builder: Option<Arc<dyn ImageBuilder>>,
}

impl Collaborators {
    /// The production set: OCI registries, kustomize, GitHub and docker.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let credentials = config.registries.clone();
        let resolvers: Arc<dyn ResolverFactory> =
            Arc::new(move || default_resolvers(&credentials));

        let builder: Option<Arc<dyn ImageBuilder>> = if config.builder.enabled {
            Some(Arc::new(DockerCliBuilder::new(&config.builder)))
        } else {
            None
        };

        Ok(Self {
            resolvers,
            hydrator: Arc::new(KustomizeCli::new(&config.kustomize)),
            pull_requests: Arc::new(GitHubClient::new(&config.github)?),
            builder,
        })
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("builder", &self.builder.is_some())
            .finish_non_exhaustive()
    }
}
