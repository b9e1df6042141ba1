//! Scheduling: the reconciler capability, the delay queue and the manager.

pub mod manager;
pub mod queue;
pub mod reconciler;
pub mod renderer;
pub mod repo_controller;

pub use manager::{FailurePolicy, Manager, ManagerOptions};
pub use queue::DelayQueue;
pub use reconciler::{ReconcileEvent, Reconciler};
pub use renderer::Renderer;
pub use repo_controller::RepoController;
