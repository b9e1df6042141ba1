//! `hydros`: pin images, hydrate overlays and publish them as pull requests.

mod commands;

use clap::Parser;

use crate::commands::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    hydros::logging::init(cli.log_format);
    commands::execute(cli)
}
