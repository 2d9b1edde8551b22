//! Create command - kind cluster with pull-through registry mirrors
//!
//! Order matters here:
//! 1. Network, registries, network attachment and readiness
//! 2. kind cluster on the same network
//! 3. hosts.toml fragments written into the running nodes
//! 4. Snapshot of the creation-time spec

use std::time::Duration;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kindling_common::DEFAULT_NETWORK;
use kindling_registry::MirrorSpec;

use super::kind_utils;
use crate::cluster::{merge_credentials, parse_host_values, ClusterSpec, DEFAULT_REGISTRY_PORT_BASE};
use crate::config::CliConfig;
use crate::{Error, Result};

/// Create a kind cluster with registry mirrors
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Cluster name
    #[arg(long, default_value = "kind")]
    pub name: String,

    /// Registry mirror as HOST[=UPSTREAM]; a bare host is a local registry
    #[arg(long = "mirror", value_name = "HOST[=UPSTREAM]")]
    pub mirrors: Vec<MirrorSpec>,

    /// Upstream username for a mirror as HOST=VALUE (may use ${VAR})
    #[arg(long = "registry-username", value_name = "HOST=VALUE")]
    pub registry_usernames: Vec<String>,

    /// Upstream password for a mirror as HOST=VALUE (may use ${VAR})
    #[arg(long = "registry-password", value_name = "HOST=VALUE")]
    pub registry_passwords: Vec<String>,

    /// Container network shared by nodes and registries
    #[arg(long, default_value = DEFAULT_NETWORK)]
    pub network: String,

    /// Subnet for the network if it has to be created
    #[arg(long)]
    pub network_cidr: Option<String>,

    /// kind node image
    #[arg(long)]
    pub node_image: Option<String>,

    /// First loopback port handed to registries
    #[arg(long, default_value_t = DEFAULT_REGISTRY_PORT_BASE)]
    pub registry_port_base: u16,

    /// Seconds to wait for the control plane
    #[arg(long, default_value = "120")]
    pub wait_secs: u64,
}

impl CreateArgs {
    /// Build the cluster spec these flags describe
    pub fn cluster_spec(&self) -> Result<ClusterSpec> {
        let mut spec = ClusterSpec::new(
            &self.name,
            &self.network,
            self.registry_port_base,
            self.mirrors.clone(),
        )?;
        spec.network_cidr = self.network_cidr.clone();
        spec.node_image = self.node_image.clone();
        spec.credentials = merge_credentials(
            parse_host_values(&self.registry_usernames, "registry-username")?,
            parse_host_values(&self.registry_passwords, "registry-password")?,
        );

        if let Some(unknown) = spec
            .credentials
            .keys()
            .find(|host| !spec.mirrors.iter().any(|m| &m.host == *host))
        {
            return Err(Error::validation(format!(
                "credentials given for {unknown}, which is not a --mirror host"
            )));
        }
        Ok(spec)
    }
}

pub async fn run(args: CreateArgs, config: &CliConfig, cancel: &CancellationToken) -> Result<()> {
    let spec = args.cluster_spec()?;
    let configs = spec.registry_configs()?;

    if kind_utils::cluster_exists(config, &spec.name).await? {
        return Err(Error::ClusterAlreadyExists {
            name: spec.name.clone(),
        });
    }

    info!(cluster = %spec.name, network = %spec.network, mirrors = configs.len(), "Creating cluster");

    let orchestrator = config.orchestrator()?;
    let registries = orchestrator
        .prepare(cancel, &spec.network, spec.network_cidr.as_deref(), &configs)
        .await?;

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    kind_utils::create_kind_cluster(config, &spec, Duration::from_secs(args.wait_secs)).await?;

    if let Err(e) = orchestrator
        .configure_nodes(cancel, &spec.name, &registries)
        .await
    {
        warn!(cluster = %spec.name, error = %e, "Cluster created but mirror configuration failed; run `kindling update` to retry");
        return Err(e.into());
    }

    config.state_store().save_cluster_spec(&spec.name, &spec)?;

    for registry in &registries {
        info!(
            registry = %registry.host(),
            endpoint = %format!("127.0.0.1:{}", registry.port()),
            "Mirror ready"
        );
    }
    info!(cluster = %spec.name, "Cluster created");
    Ok(())
}
