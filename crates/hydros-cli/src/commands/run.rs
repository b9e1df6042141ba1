//! `hydros run`: the long-running reconciliation manager.

use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use anyhow::Context;
use clap::Args;
use hydros::resource::loader::load_kind;
use hydros::resource::{RendererResource, RepoConfigResource, ResourceKind};
use hydros::{
    load_manifest_syncs, Collaborators, Manager, ManagerOptions, Reconciler, Renderer,
    RepoController, Syncer,
};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Engine configuration file.
    #[arg(short, long, env = "HYDROS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory of ManifestSync, Renderer and RepoConfig resources.
    #[arg(short, long)]
    pub manifests: PathBuf,
}

pub fn execute(args: RunArgs) -> anyhow::Result<()> {
    let config = Arc::new(super::load_config(args.config.as_deref())?);
    let collaborators = Collaborators::from_config(&config)?;

    let mut reconcilers: Vec<Arc<dyn Reconciler>> = Vec::new();
    for loaded in load_manifest_syncs(&args.manifests)? {
        let syncer = Syncer::new(loaded.resource, Arc::clone(&config), collaborators.clone())
            .with_context(|| format!("loading {}", loaded.path.display()))?;
        reconcilers.push(Arc::new(syncer));
    }
    for loaded in load_kind::<RendererResource>(&args.manifests, ResourceKind::Renderer)? {
        let renderer = Renderer::new(loaded.resource, Arc::clone(&config), collaborators.clone())
            .with_context(|| format!("loading {}", loaded.path.display()))?;
        reconcilers.push(Arc::new(renderer));
    }
    for loaded in load_kind::<RepoConfigResource>(&args.manifests, ResourceKind::RepoConfig)? {
        let controller =
            RepoController::new(loaded.resource, Arc::clone(&config), collaborators.clone())
                .with_context(|| format!("loading {}", loaded.path.display()))?;
        reconcilers.push(Arc::new(controller));
    }

    if reconcilers.is_empty() {
        anyhow::bail!("no resources found under {}", args.manifests.display());
    }

    let manager = Manager::new(ManagerOptions::from_config(&config));
    for reconciler in reconcilers {
        manager.add(reconciler)?;
    }

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("installing the Ctrl-C handler")?;

    manager.start()?;
    log::info!("Reconciling {}", manager.names().join(", "));

    let _ = stop_rx.recv();
    log::info!("Interrupted, waiting for running passes to finish");
    manager.shutdown();
    Ok(())
}
