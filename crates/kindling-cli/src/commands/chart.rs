//! Chart command - install, remove and inspect Helm releases on a cluster

use std::collections::BTreeMap;

use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::kind_utils;
use crate::config::CliConfig;
use crate::installer::{ChartInstaller, ChartSpec, HelmInstaller};
use crate::{Error, Result};

/// Chart operations
#[derive(Subcommand, Debug)]
pub enum ChartCommand {
    /// Install or upgrade a chart release
    Install(ChartArgs),
    /// Remove a chart release
    Uninstall(ReleaseArgs),
    /// Print the images a chart would pull
    Images(ChartArgs),
}

/// Target cluster
#[derive(Args, Debug, Clone)]
pub struct ClusterTarget {
    /// Cluster name
    #[arg(long, default_value = "kind")]
    pub cluster: String,
}

impl ClusterTarget {
    /// kubeconfig context kind writes for this cluster
    pub fn kube_context(&self) -> String {
        format!("kind-{}", self.cluster)
    }
}

/// A chart and its parameters
#[derive(Args, Debug, Clone)]
pub struct ChartArgs {
    #[command(flatten)]
    pub target: ClusterTarget,

    /// Release name
    #[arg(long)]
    pub release: String,

    /// Chart name within the repository
    #[arg(long)]
    pub chart: String,

    /// Target namespace
    #[arg(long, default_value = "default")]
    pub namespace: String,

    /// Chart repository URL (https:// or oci://)
    #[arg(long = "repo")]
    pub repo_url: String,

    /// Chart version
    #[arg(long)]
    pub version: Option<String>,

    /// Chart value as KEY=VALUE
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub values: Vec<String>,
}

impl ChartArgs {
    /// Chart spec these flags describe
    pub fn chart_spec(&self) -> Result<ChartSpec> {
        Ok(ChartSpec {
            release: self.release.clone(),
            chart: self.chart.clone(),
            namespace: self.namespace.clone(),
            repo_url: self.repo_url.clone(),
            version: self.version.clone(),
            values: parse_values(&self.values)?,
        })
    }
}

/// A release to remove
#[derive(Args, Debug, Clone)]
pub struct ReleaseArgs {
    #[command(flatten)]
    pub target: ClusterTarget,

    /// Release name
    #[arg(long)]
    pub release: String,

    /// Release namespace
    #[arg(long, default_value = "default")]
    pub namespace: String,
}

/// Parse `--set KEY=VALUE` pairs; the last value for a key wins.
pub fn parse_values(values: &[String]) -> Result<BTreeMap<String, String>> {
    values
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(Error::validation(format!(
                "--set expects KEY=VALUE, got '{pair}'"
            ))),
        })
        .collect()
}

impl ChartCommand {
    fn target(&self) -> &ClusterTarget {
        match self {
            Self::Install(args) | Self::Images(args) => &args.target,
            Self::Uninstall(args) => &args.target,
        }
    }
}

pub async fn run(cmd: ChartCommand, config: &CliConfig, cancel: &CancellationToken) -> Result<()> {
    let target = cmd.target().clone();

    // Rendering images needs no cluster
    if !matches!(cmd, ChartCommand::Images(_))
        && !kind_utils::cluster_exists(config, &target.cluster).await?
    {
        return Err(Error::ClusterNotFound {
            name: target.cluster,
        });
    }

    let installer = HelmInstaller::new(Some(target.kube_context()));
    for line in dispatch(&installer, cmd, cancel).await? {
        println!("{line}");
    }
    Ok(())
}

/// Run `cmd` against `installer`, returning lines to print.
pub async fn dispatch(
    installer: &dyn ChartInstaller,
    cmd: ChartCommand,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    match cmd {
        ChartCommand::Install(args) => {
            let chart = args.chart_spec()?;
            installer.install(cancel, &chart).await?;
            info!(cluster = %args.target.cluster, release = %chart.release, "Release ready");
            Ok(Vec::new())
        }
        ChartCommand::Uninstall(args) => {
            installer.uninstall(&args.release, &args.namespace).await?;
            Ok(Vec::new())
        }
        ChartCommand::Images(args) => installer.list_images(cancel, &args.chart_spec()?).await,
    }
}
