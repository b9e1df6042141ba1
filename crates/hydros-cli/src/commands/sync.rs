//! `hydros sync`: one pass of one ManifestSync.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use hydros::resource::load_manifest_sync_file;
use hydros::{Collaborators, Syncer};

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Engine configuration file.
    #[arg(short, long, env = "HYDROS_CONFIG")]
    pub config: Option<PathBuf>,

    /// File containing the ManifestSync.
    #[arg(short, long)]
    pub file: PathBuf,

    /// Which ManifestSync to run when the file holds several.
    #[arg(short, long)]
    pub name: Option<String>,

    /// Hydrate and publish even when nothing changed.
    #[arg(long)]
    pub force: bool,
}

pub fn execute(args: SyncArgs) -> anyhow::Result<()> {
    let config = Arc::new(super::load_config(args.config.as_deref())?);

    let mut syncs = load_manifest_sync_file(&args.file)?;
    let sync = match &args.name {
        Some(name) => syncs
            .into_iter()
            .find(|s| s.name() == name.as_str())
            .ok_or_else(|| anyhow::anyhow!("no ManifestSync named '{}' in {}", name, args.file.display()))?,
        None if syncs.len() == 1 => syncs.remove(0),
        None if syncs.is_empty() => {
            anyhow::bail!("no ManifestSync in {}", args.file.display())
        }
        None => anyhow::bail!(
            "{} holds {} ManifestSyncs, pick one with --name",
            args.file.display(),
            syncs.len()
        ),
    };

    let collaborators = Collaborators::from_config(&config)?;
    let syncer = Syncer::new(sync, config, collaborators)?;
    let outcome = syncer.run_once(args.force)?;
    println!("{}: {}", syncer.manifest().name(), outcome);
    Ok(())
}
