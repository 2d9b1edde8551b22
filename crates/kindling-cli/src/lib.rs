//! kindling CLI library

pub mod cluster;
pub mod commands;
pub mod config;
pub mod error;
pub mod installer;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::CliConfig;

/// kindling - local kind clusters with pull-through registry mirrors
#[derive(Parser, Debug)]
#[command(name = "kindling")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// State directory (default: ~/.kindling)
    #[arg(long, global = true, env = "KINDLING_HOME")]
    pub state_dir: Option<PathBuf>,

    /// Container engine CLI (docker or podman)
    #[arg(long, global = true, env = "KINDLING_ENGINE", default_value = "docker")]
    pub engine: String,

    /// kind binary
    #[arg(long, global = true, env = "KINDLING_KIND", default_value = "kind")]
    pub kind: String,

    /// Maximum concurrent provisioning tasks (0 picks a default from CPU count)
    #[arg(long, global = true, default_value_t = 0)]
    pub concurrency: usize,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a kind cluster with registry mirrors
    Create(commands::create::CreateArgs),
    /// Delete a cluster and its registries
    Delete(commands::delete::DeleteArgs),
    /// Reconcile a cluster's mirrors with a new mirror set
    Update(commands::update::UpdateArgs),
    /// List managed registries and their health
    Registries(commands::registries::RegistriesArgs),
    /// Install or remove Helm charts
    #[command(subcommand)]
    Chart(commands::chart::ChartCommand),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let config = CliConfig::resolve(&self.global)?;

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                on_signal.cancel();
            }
        });

        match self.command {
            Commands::Create(args) => commands::create::run(args, &config, &cancel).await,
            Commands::Delete(args) => commands::delete::run(args, &config).await,
            Commands::Update(args) => commands::update::run(args, &config, &cancel).await,
            Commands::Registries(args) => commands::registries::run(args, &config, &cancel).await,
            Commands::Chart(cmd) => commands::chart::run(cmd, &config, &cancel).await,
        }
    }
}
