// SPDX-FileCopyrightText: © 2025 Siphon Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! `siphond`: loads a pipeline config, runs it, and shuts it down cleanly
//! on ctrl-c.

use clap::{Parser, Subcommand};
use siphon_core::plugin::PluginRegistry;
use siphon_engine::ConfigLoader;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

mod logging;
mod settings;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the pipeline configuration file
    #[arg(short, long, default_value = "siphond.toml")]
    config: PathBuf,

    /// Path to the daemon settings file (globals, logging)
    #[arg(short, long)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline (the default)
    Run,
    /// Print the default daemon settings as TOML
    DefaultSettings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Commands::DefaultSettings)) {
        print!("{}", toml::to_string_pretty(&settings::Settings::default())?);
        return Ok(());
    }

    let settings = settings::Settings::load(cli.settings.as_deref())?;
    logging::init_logging(&settings.log)?;

    let mut registry = PluginRegistry::new();
    siphon_plugins::register_builtins(&mut registry);

    let globals = Arc::new(settings.pipeline_globals());
    let loader = ConfigLoader::new(Arc::new(registry), Arc::clone(&globals));
    let pipeline = loader.load_file(&cli.config)?;

    info!(config = %cli.config.display(), "starting pipeline");
    let handle = pipeline.start().await;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received");
    handle.shutdown().await;
    Ok(())
}
