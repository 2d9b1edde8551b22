//! Mirror orchestration
//!
//! Sequences network creation, registry setup, network attachment and
//! readiness before writing containerd `hosts.toml` fragments into the
//! cluster's running nodes. Fragments are written into live nodes rather
//! than the kind config so mirrors can change without recreating a cluster.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use kindling_common::{
    task, Error, ParallelExecutor, Result, ResultExt, Results, Task, KIND_CLUSTER_LABEL,
};

use crate::config::{RegistryConfig, RegistryInfo};
use crate::manager::{RegistryManager, REGISTRY_CONTAINER_PORT};

/// Directory containerd reads per-registry host configuration from
pub const CONTAINERD_CERTS_DIR: &str = "/etc/containerd/certs.d";

/// Path of the hosts.toml fragment for `host` inside a node.
pub fn hosts_toml_path(host: &str) -> String {
    format!("{CONTAINERD_CERTS_DIR}/{host}/hosts.toml")
}

/// Render the containerd hosts.toml fragment redirecting pulls for a
/// registry host to its mirror container.
///
/// Output depends only on `info`, so rewriting it is byte-identical.
pub fn render_hosts_toml(info: &RegistryInfo) -> String {
    let endpoint = format!(
        "http://{}:{}",
        info.container_name(),
        REGISTRY_CONTAINER_PORT
    );
    let server = info.upstream().unwrap_or(&endpoint);
    format!(
        "server = \"{server}\"\n\n[host.\"{endpoint}\"]\n  capabilities = [\"pull\", \"resolve\"]\n"
    )
}

/// Drives registry setup and node configuration for one cluster.
pub struct MirrorOrchestrator {
    manager: RegistryManager,
    executor: ParallelExecutor,
}

impl MirrorOrchestrator {
    /// Orchestrator running per-registry and per-node work on `executor`
    pub fn new(manager: RegistryManager, executor: ParallelExecutor) -> Self {
        Self { manager, executor }
    }

    /// The underlying registry manager
    pub fn manager(&self) -> &RegistryManager {
        &self.manager
    }

    /// Create `network`, then set up and attach every registry in parallel,
    /// then wait for all of them to become ready.
    ///
    /// Returned registries follow the order of `configs`.
    pub async fn prepare(
        &self,
        cancel: &CancellationToken,
        network: &str,
        cidr: Option<&str>,
        configs: &[RegistryConfig],
    ) -> Result<Vec<RegistryInfo>> {
        self.manager.ensure_network_exists(network, cidr).await?;
        if configs.is_empty() {
            return Ok(Vec::new());
        }

        let results: Arc<Results<(usize, RegistryInfo)>> = Arc::new(Results::new());
        let tasks: Vec<Task> = configs
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, config)| {
                let manager = self.manager.clone();
                let results = Arc::clone(&results);
                let network = network.to_string();
                task(move |token| async move {
                    let mut info = manager.setup_registry(&config).await?;
                    if token.is_cancelled() {
                        return Err(Error::TaskAborted {
                            message: format!(
                                "cancelled before attaching registry {} to network {network}",
                                config.host
                            ),
                        });
                    }
                    manager.connect_registry_to_network(&mut info, &network).await?;
                    results.add((index, info));
                    Ok(())
                })
            })
            .collect();

        self.executor.execute(cancel, tasks).await?;

        let mut indexed = results.values();
        indexed.sort_by_key(|(index, _)| *index);
        let mut infos: Vec<RegistryInfo> = indexed.into_iter().map(|(_, info)| info).collect();

        self.manager
            .wait_for_registries_ready(cancel, &mut infos)
            .await?;

        info!(network = %network, count = infos.len(), "Registries ready");
        Ok(infos)
    }

    /// Write a hosts.toml fragment for every registry into every running node
    /// of `cluster`, one task per node. Returns the number of nodes configured.
    ///
    /// Every registry must already be ready: the fragments reference
    /// container hostnames that have to resolve and answer from the first pull.
    pub async fn configure_nodes(
        &self,
        cancel: &CancellationToken,
        cluster: &str,
        registries: &[RegistryInfo],
    ) -> Result<usize> {
        if let Some(pending) = registries.iter().find(|r| !r.is_ready()) {
            return Err(Error::validation(format!(
                "registry {} is {:?}; nodes can only be pointed at ready registries",
                pending.host(),
                pending.state()
            )));
        }
        if registries.is_empty() {
            return Ok(0);
        }

        let fragments = registries
            .iter()
            .map(|r| (hosts_toml_path(r.host()), render_hosts_toml(r)))
            .collect();
        let nodes = self.write_fragments(cancel, cluster, fragments).await?;

        info!(
            cluster = %cluster,
            nodes,
            registries = registries.len(),
            "Configured node registry mirrors"
        );
        Ok(nodes)
    }

    /// Blank the hosts.toml fragments for `hosts` in every running node of
    /// `cluster`, sending pulls for them back to the real registry.
    pub async fn clear_nodes(
        &self,
        cancel: &CancellationToken,
        cluster: &str,
        hosts: &[String],
    ) -> Result<usize> {
        if hosts.is_empty() {
            return Ok(0);
        }
        let fragments = hosts
            .iter()
            .map(|host| (hosts_toml_path(host), String::new()))
            .collect();
        let nodes = self.write_fragments(cancel, cluster, fragments).await?;
        info!(cluster = %cluster, nodes, hosts = ?hosts, "Cleared node registry mirrors");
        Ok(nodes)
    }

    async fn write_fragments(
        &self,
        cancel: &CancellationToken,
        cluster: &str,
        fragments: Vec<(String, String)>,
    ) -> Result<usize> {
        let nodes: Vec<String> = self
            .manager
            .engine()
            .list_containers(vec![(KIND_CLUSTER_LABEL.to_string(), cluster.to_string())])
            .await
            .context(format!("list nodes of cluster {cluster}"))?
            .into_iter()
            .filter(|node| node.running)
            .map(|node| node.name)
            .collect();
        if nodes.is_empty() {
            return Err(Error::not_found("cluster nodes", cluster));
        }

        let fragments = Arc::new(fragments);
        let tasks: Vec<Task> = nodes
            .iter()
            .map(|node| {
                let engine = Arc::clone(self.manager.engine());
                let fragments = Arc::clone(&fragments);
                let node = node.clone();
                task(move |token| async move {
                    for (path, contents) in fragments.iter() {
                        if token.is_cancelled() {
                            return Err(Error::TaskAborted {
                                message: format!("cancelled before writing {path} on node {node}"),
                            });
                        }
                        engine
                            .write_file(&node, path, contents)
                            .await
                            .context(format!("write {path} on node {node}"))?;
                        debug!(node = %node, path = %path, "Wrote registry host config");
                    }
                    Ok(())
                })
            })
            .collect();

        self.executor.execute(cancel, tasks).await?;
        Ok(nodes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::config::{MirrorSpec, RegistryState};
    use crate::engine::{ContainerSummary, MockContainerEngine};
    use crate::health::tests::{fast_config, serve_status};

    fn config(host: &str, upstream: Option<&str>, port: u16) -> RegistryConfig {
        let spec = MirrorSpec {
            host: host.to_string(),
            upstream: upstream.map(String::from),
        };
        RegistryConfig::for_mirror("dev", "kind", port, &spec)
    }

    fn ready(host: &str, upstream: Option<&str>) -> RegistryInfo {
        let mut info = RegistryInfo::from_config(
            &config(host, upstream, 5001),
            "id",
            5001,
            vec!["kind".to_string()],
            RegistryState::NetworkAttached,
        );
        info.set_state(RegistryState::Ready);
        info
    }

    fn node(name: &str, running: bool) -> ContainerSummary {
        ContainerSummary {
            id: format!("id-{name}"),
            name: name.to_string(),
            running,
            ..Default::default()
        }
    }

    fn orchestrator(engine: MockContainerEngine) -> MirrorOrchestrator {
        let manager = RegistryManager::new(Arc::new(engine))
            .unwrap()
            .with_health_config(fast_config());
        MirrorOrchestrator::new(manager, ParallelExecutor::new(4))
    }

    #[test]
    fn pull_through_fragment_points_server_at_upstream() {
        let rendered = render_hosts_toml(&ready("docker.io", Some("https://registry-1.docker.io")));
        assert_eq!(
            rendered,
            "server = \"https://registry-1.docker.io\"\n\n\
             [host.\"http://kindling-dev-docker-io:5000\"]\n  capabilities = [\"pull\", \"resolve\"]\n"
        );
    }

    #[test]
    fn local_registry_fragment_points_server_at_itself() {
        let rendered = render_hosts_toml(&ready("localhost:5001", None));
        assert!(rendered.starts_with("server = \"http://kindling-dev-localhost-5001:5000\"\n"));
    }

    #[test]
    fn fragment_path_is_per_host() {
        assert_eq!(
            hosts_toml_path("quay.io"),
            "/etc/containerd/certs.d/quay.io/hosts.toml"
        );
    }

    #[tokio::test]
    async fn fragments_are_written_to_every_running_node() {
        let writes: Arc<Mutex<Vec<(String, String, String)>>> = Arc::default();
        let mut engine = MockContainerEngine::new();
        engine
            .expect_list_containers()
            .withf(|labels| labels == &vec![(KIND_CLUSTER_LABEL.to_string(), "dev".to_string())])
            .returning(|_| {
                Ok(vec![
                    node("dev-control-plane", true),
                    node("dev-worker", true),
                    node("dev-worker2", false),
                ])
            });
        let log = Arc::clone(&writes);
        engine.expect_write_file().returning(move |node, path, contents| {
            log.lock()
                .unwrap()
                .push((node.to_string(), path.to_string(), contents.to_string()));
            Ok(())
        });

        let orchestrator = orchestrator(engine);
        let registries = vec![
            ready("docker.io", Some("https://registry-1.docker.io")),
            ready("quay.io", Some("https://quay.io")),
        ];

        let configured = orchestrator
            .configure_nodes(&CancellationToken::new(), "dev", &registries)
            .await
            .unwrap();
        assert_eq!(configured, 2);

        let mut first = writes.lock().unwrap().clone();
        first.sort();
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|(node, _, _)| node != "dev-worker2"));
        assert!(first
            .iter()
            .any(|(_, path, _)| path == "/etc/containerd/certs.d/quay.io/hosts.toml"));

        writes.lock().unwrap().clear();
        orchestrator
            .configure_nodes(&CancellationToken::new(), "dev", &registries)
            .await
            .unwrap();
        let mut second = writes.lock().unwrap().clone();
        second.sort();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn clearing_writes_empty_fragments() {
        let mut engine = MockContainerEngine::new();
        engine
            .expect_list_containers()
            .returning(|_| Ok(vec![node("dev-control-plane", true)]));
        engine
            .expect_write_file()
            .withf(|node, path, contents| {
                node == "dev-control-plane"
                    && path == "/etc/containerd/certs.d/ghcr.io/hosts.toml"
                    && contents.is_empty()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let cleared = orchestrator(engine)
            .clear_nodes(&CancellationToken::new(), "dev", &["ghcr.io".to_string()])
            .await
            .unwrap();
        assert_eq!(cleared, 1);
    }

    #[tokio::test]
    async fn unready_registries_block_node_configuration() {
        let mut engine = MockContainerEngine::new();
        engine.expect_list_containers().never();
        engine.expect_write_file().never();

        let mut pending = ready("docker.io", None);
        pending.set_state(RegistryState::WaitingReady);

        let err = orchestrator(engine)
            .configure_nodes(&CancellationToken::new(), "dev", &[pending])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn missing_nodes_is_not_found() {
        let mut engine = MockContainerEngine::new();
        engine
            .expect_list_containers()
            .returning(|_| Ok(vec![node("dev-control-plane", false)]));

        let err = orchestrator(engine)
            .configure_nodes(&CancellationToken::new(), "dev", &[ready("docker.io", None)])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn prepare_returns_ready_registries_in_config_order() {
        let docker_port = serve_status("200 OK").await;
        let quay_port = serve_status("401 Unauthorized").await;

        let mut engine = MockContainerEngine::new();
        engine.expect_network_exists().returning(|_| Ok(true));
        engine.expect_list_containers().returning(|_| Ok(vec![]));
        engine
            .expect_run_container()
            .times(2)
            .returning(|spec| Ok(format!("id-{}", spec.name)));
        engine
            .expect_connect_network()
            .withf(|network, _| network == "kind")
            .times(2)
            .returning(|_, _| Ok(()));

        let configs = vec![
            config("docker.io", Some("https://registry-1.docker.io"), docker_port),
            config("quay.io", Some("https://quay.io"), quay_port),
        ];
        let infos = orchestrator(engine)
            .prepare(&CancellationToken::new(), "kind", None, &configs)
            .await
            .unwrap();

        let hosts: Vec<&str> = infos.iter().map(RegistryInfo::host).collect();
        assert_eq!(hosts, ["docker.io", "quay.io"]);
        assert!(infos.iter().all(RegistryInfo::is_ready));
        assert!(infos.iter().all(|i| i.networks() == ["kind".to_string()]));
    }

    #[tokio::test]
    async fn prepare_fails_fast_on_setup_error() {
        let mut engine = MockContainerEngine::new();
        engine.expect_network_exists().returning(|_| Ok(true));
        engine.expect_list_containers().returning(|_| Ok(vec![]));
        engine.expect_run_container().returning(|spec| {
            if spec.name.ends_with("quay-io") {
                Err(Error::engine("run", "pull access denied"))
            } else {
                Ok("id".to_string())
            }
        });
        engine.expect_connect_network().returning(|_, _| Ok(()));

        let configs = vec![
            config("docker.io", None, 5001),
            config("quay.io", None, 5002),
        ];
        let err = orchestrator(engine)
            .prepare(&CancellationToken::new(), "kind", None, &configs)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Parallel { .. }));
        assert!(matches!(err.root(), Error::Engine { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sibling_failure_stops_attachment_of_in_flight_registries() {
        let mut engine = MockContainerEngine::new();
        engine.expect_network_exists().returning(|_| Ok(true));
        engine.expect_list_containers().returning(|_| Ok(vec![]));
        // Separate expectations so the slow create does not hold up the failing one
        engine
            .expect_run_container()
            .withf(|spec| spec.name.ends_with("docker-io"))
            .returning(|_| {
                // Still creating when quay.io fails
                std::thread::sleep(std::time::Duration::from_millis(300));
                Ok("id".to_string())
            });
        engine
            .expect_run_container()
            .withf(|spec| spec.name.ends_with("quay-io"))
            .returning(|_| Err(Error::engine("run", "pull access denied")));
        engine.expect_connect_network().never();

        let configs = vec![
            config("docker.io", None, 5001),
            config("quay.io", None, 5002),
        ];
        let err = orchestrator(engine)
            .prepare(&CancellationToken::new(), "kind", None, &configs)
            .await
            .unwrap_err();

        assert!(matches!(err.root(), Error::Engine { .. }));
    }

    #[tokio::test]
    async fn prepare_without_registries_only_creates_network() {
        let mut engine = MockContainerEngine::new();
        engine.expect_network_exists().returning(|_| Ok(false));
        engine.expect_create_network().times(1).returning(|_, _| Ok(()));
        engine.expect_list_containers().never();

        let infos = orchestrator(engine)
            .prepare(&CancellationToken::new(), "kind", None, &[])
            .await
            .unwrap();
        assert!(infos.is_empty());
    }
}
