//! `hydros validate`: report every problem in ManifestSync files.

use std::path::PathBuf;

use clap::Args;
use hydros::resource::loader::{load_kind_from_file, yaml_files};
use hydros::resource::validation::manifest_sync_problems;
use hydros::resource::ResourceKind;
use hydros::ManifestSync;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// A ManifestSync file, or a directory searched recursively.
    #[arg(short, long)]
    pub file: PathBuf,
}

pub fn execute(args: ValidateArgs) -> anyhow::Result<()> {
    let files = if args.file.is_dir() {
        yaml_files(&args.file)?
    } else {
        vec![args.file.clone()]
    };

    let mut checked = 0;
    let mut invalid = 0;
    for file in &files {
        let syncs: Vec<ManifestSync> = load_kind_from_file(file, ResourceKind::ManifestSync)?;
        for sync in syncs {
            checked += 1;
            let problems = manifest_sync_problems(&sync);
            if problems.is_empty() {
                println!("ok    {} ({})", sync.name(), file.display());
            } else {
                invalid += 1;
                println!("error {} ({})", sync.name(), file.display());
                for problem in problems {
                    println!("      - {}", problem);
                }
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{} of {} ManifestSync(s) invalid", invalid, checked);
    }
    if checked == 0 {
        anyhow::bail!("no ManifestSync found in {}", args.file.display());
    }
    Ok(())
}
