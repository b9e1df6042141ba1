//! The capability the manager schedules: a name and a `run`.

use crate::error::Result;

/// Why a reconciler is being run. No reason means a periodic resync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileEvent {
    pub reason: Option<String>,
}

impl ReconcileEvent {
    pub fn resync() -> Self {
        Self::default()
    }

    pub fn triggered(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
        }
    }

    pub fn is_resync(&self) -> bool {
        self.reason.is_none()
    }
}

/// Implemented by the syncer, renderer and repo controller.
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &str;

    /// One reconcile pass. Errors are scoped to this pass.
    fn run(&self, event: &ReconcileEvent) -> Result<()>;
}
