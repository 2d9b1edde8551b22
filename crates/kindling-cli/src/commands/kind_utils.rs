//! Shared utilities for kind cluster operations

use std::time::Duration;

use serde::Serialize;
use tracing::info;

use kindling_registry::mirror::CONTAINERD_CERTS_DIR;

use super::run_tool;
use crate::cluster::ClusterSpec;
use crate::config::CliConfig;
use crate::Result;

/// Network kind attaches node containers to
pub const KIND_NETWORK_ENV: &str = "KIND_EXPERIMENTAL_DOCKER_NETWORK";

/// Selects kind's podman provider
pub const KIND_PROVIDER_ENV: &str = "KIND_EXPERIMENTAL_PROVIDER";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KindConfig {
    kind: &'static str,
    api_version: &'static str,
    name: String,
    nodes: Vec<KindNode>,
    containerd_config_patches: Vec<String>,
}

#[derive(Serialize)]
struct KindNode {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
}

/// Containerd patch pointing registry host lookup at per-host hosts.toml files.
pub fn containerd_config_patch() -> String {
    format!(
        "[plugins.\"io.containerd.grpc.v1.cri\".registry]\n  config_path = \"{CONTAINERD_CERTS_DIR}\"\n"
    )
}

/// Render the kind cluster config for `spec`.
pub fn render_kind_config(spec: &ClusterSpec) -> Result<String> {
    let config = KindConfig {
        kind: "Cluster",
        api_version: "kind.x-k8s.io/v1alpha4",
        name: spec.name.clone(),
        nodes: vec![KindNode {
            role: "control-plane",
            image: spec.node_image.clone(),
        }],
        containerd_config_patches: vec![containerd_config_patch()],
    };
    Ok(serde_yaml::to_string(&config)?)
}

/// Environment for kind child processes. Never set on our own process.
pub fn kind_env(config: &CliConfig, network: Option<&str>) -> Vec<(&'static str, String)> {
    let mut env = Vec::new();
    if let Some(network) = network {
        env.push((KIND_NETWORK_ENV, network.to_string()));
    }
    if config.is_podman() {
        env.push((KIND_PROVIDER_ENV, "podman".to_string()));
    }
    env
}

/// Whether kind knows a cluster called `name`
pub async fn cluster_exists(config: &CliConfig, name: &str) -> Result<bool> {
    let out = run_tool(
        &config.kind,
        &["get", "clusters"],
        &kind_env(config, None),
        None,
    )
    .await?;
    Ok(out.lines().any(|line| line.trim() == name))
}

/// Create a kind cluster on the cluster spec's network and wait for its control plane
pub async fn create_kind_cluster(config: &CliConfig, spec: &ClusterSpec, wait: Duration) -> Result<()> {
    info!(cluster = %spec.name, network = %spec.network, "Creating kind cluster");

    let kind_config = render_kind_config(spec)?;
    let wait = format!("{}s", wait.as_secs());
    run_tool(
        &config.kind,
        &[
            "create",
            "cluster",
            "--name",
            spec.name.as_str(),
            "--config",
            "-",
            "--wait",
            wait.as_str(),
        ],
        &kind_env(config, Some(&spec.network)),
        Some(kind_config.as_bytes()),
    )
    .await?;
    Ok(())
}

/// Delete a kind cluster
pub async fn delete_kind_cluster(config: &CliConfig, name: &str) -> Result<()> {
    info!(cluster = %name, "Deleting kind cluster");
    run_tool(
        &config.kind,
        &["delete", "cluster", "--name", name],
        &kind_env(config, None),
        None,
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(engine: &str) -> CliConfig {
        CliConfig {
            state_root: PathBuf::from("/tmp/state"),
            engine: engine.to_string(),
            kind: "kind".to_string(),
            concurrency: 0,
        }
    }

    #[test]
    fn kind_config_enables_containerd_config_path() {
        let mut spec = ClusterSpec::new("dev", "kind", 5001, vec![]).unwrap();
        spec.node_image = Some("kindest/node:v1.31.0".to_string());

        let rendered = render_kind_config(&spec).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();

        assert_eq!(value["kind"], "Cluster");
        assert_eq!(value["apiVersion"], "kind.x-k8s.io/v1alpha4");
        assert_eq!(value["name"], "dev");
        assert_eq!(value["nodes"][0]["role"], "control-plane");
        assert_eq!(value["nodes"][0]["image"], "kindest/node:v1.31.0");
        let patch = value["containerdConfigPatches"][0].as_str().unwrap();
        assert!(patch.contains("config_path = \"/etc/containerd/certs.d\""));
    }

    #[test]
    fn node_image_is_omitted_when_unset() {
        let spec = ClusterSpec::new("dev", "kind", 5001, vec![]).unwrap();
        let rendered = render_kind_config(&spec).unwrap();
        assert!(!rendered.contains("image"));
    }

    #[test]
    fn network_env_is_only_for_the_child() {
        let env = kind_env(&config("docker"), Some("kindling-net"));
        assert_eq!(env, vec![(KIND_NETWORK_ENV, "kindling-net".to_string())]);
    }

    #[test]
    fn podman_selects_kind_provider() {
        let env = kind_env(&config("podman"), None);
        assert_eq!(env, vec![(KIND_PROVIDER_ENV, "podman".to_string())]);
    }
}
