//! CLI command definitions and dispatch.

pub mod run;
pub mod sync;
pub mod validate;

use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hydros::{EngineConfig, LogFormat};

/// hydros: GitOps reconciliation engine.
#[derive(Parser, Debug)]
#[command(name = "hydros", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log output format: text or json.
    #[arg(long, global = true, default_value = "text", env = "HYDROS_LOG_FORMAT")]
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Reconcile every resource under a directory until interrupted.
    Run(run::RunArgs),
    /// Run one pass of one ManifestSync.
    Sync(sync::SyncArgs),
    /// Check ManifestSync files without touching git or the network.
    Validate(validate::ValidateArgs),
}

pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run(args) => run::execute(args),
        Command::Sync(args) => sync::execute(args),
        Command::Validate(args) => validate::execute(args),
    }
}

/// The engine configuration at `path`, or the defaults.
pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading engine configuration {}", path.display())),
        None => {
            let mut config = EngineConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}
