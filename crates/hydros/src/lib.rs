pub mod build;
pub mod config;
pub mod controller;
pub mod error;
pub mod functions;
pub mod git;
pub mod github;
pub mod image;
pub mod kustomize;
pub mod logging;
pub mod process;
pub mod resource;
pub mod secrets;
pub mod sync;

pub use config::{EngineConfig, FailurePolicyKind};
pub use controller::{
    DelayQueue, FailurePolicy, Manager, ManagerOptions, ReconcileEvent, Reconciler, Renderer,
    RepoController,
};
pub use error::{HydrosError, ManagerError, Result};
pub use image::{DockerImageRef, ImageTagPolicy, PinningRule, Strategy};
pub use kustomize::{generate_target_path, TargetPath};
pub use logging::LogFormat;
pub use resource::{load_manifest_syncs, validate_manifest_sync, ManifestSync};
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError, SecretSource};
pub use sync::{Collaborators, SyncOutcome, Syncer};
