//! Registry container lifecycle
//!
//! [`RegistryManager`] owns every engine call that creates, attaches,
//! health-checks or removes a registry container. Containers are found by
//! label only, so repeated setup is a no-op and external tooling can list
//! them without any in-process cache.

use std::sync::Arc;

use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kindling_common::{
    Error, Result, ResultExt, CLUSTER_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    REGISTRY_HOST_LABEL,
};

use crate::config::{process_env, RegistryConfig, RegistryInfo, RegistryState};
use crate::engine::{
    ContainerEngine, ContainerSpec, ContainerSummary, PortBinding, RestartPolicy, VolumeMount,
};
use crate::health::{self, HealthCheckConfig, Probe};

/// Pinned registry image
pub const REGISTRY_IMAGE: &str = "registry:2.8.3";

/// Port the registry listens on inside its container
pub const REGISTRY_CONTAINER_PORT: u16 = 5000;

/// Registry data directory inside the container
pub const REGISTRY_DATA_PATH: &str = "/var/lib/registry";

/// Host interface registry ports are published on
pub const LOOPBACK_ADDRESS: &str = "127.0.0.1";

/// Creates, attaches, health-checks and removes registry containers.
#[derive(Clone)]
pub struct RegistryManager {
    engine: Arc<dyn ContainerEngine>,
    http: reqwest::Client,
    health: HealthCheckConfig,
    image: String,
}

impl RegistryManager {
    /// Manager using `engine` with default health-check settings.
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Result<Self> {
        // Registries live on loopback; a configured HTTP proxy must not intercept probes.
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| Error::Http {
                message: e.to_string(),
            })?;
        Ok(Self {
            engine,
            http,
            health: HealthCheckConfig::default(),
            image: REGISTRY_IMAGE.to_string(),
        })
    }

    /// Override readiness polling parameters
    pub fn with_health_config(mut self, health: HealthCheckConfig) -> Self {
        self.health = health;
        self
    }

    /// Override the registry image
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// The engine this manager drives
    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Create `name` unless it already exists.
    pub async fn ensure_network_exists(&self, name: &str, cidr: Option<&str>) -> Result<()> {
        if self
            .engine
            .network_exists(name)
            .await
            .context(format!("check network {name}"))?
        {
            debug!(network = %name, "Network already exists");
            return Ok(());
        }

        match self
            .engine
            .create_network(name, cidr.map(String::from))
            .await
        {
            Ok(()) => {
                info!(network = %name, cidr = ?cidr, "Created network");
                Ok(())
            }
            // Lost a race with a concurrent creator
            Err(Error::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e.context("create network")),
        }
    }

    /// Set up every registry in `configs`, in order.
    pub async fn setup_registries(&self, configs: &[RegistryConfig]) -> Result<Vec<RegistryInfo>> {
        let mut infos = Vec::with_capacity(configs.len());
        for config in configs {
            infos.push(self.setup_registry(config).await?);
        }
        Ok(infos)
    }

    /// Reuse the container for `config` if one exists, otherwise create it.
    ///
    /// A reused running container costs exactly one engine call (the label
    /// lookup). A stopped one is started again.
    pub async fn setup_registry(&self, config: &RegistryConfig) -> Result<RegistryInfo> {
        // Fails on one-sided credentials before touching the engine
        let env = config.container_env(process_env)?;

        if let Some(existing) = self.find_registry(config).await? {
            return self.reuse(config, existing).await;
        }

        let spec = ContainerSpec {
            name: config.name.clone(),
            image: self.image.clone(),
            labels: config.labels(),
            env,
            ports: vec![PortBinding {
                host_ip: LOOPBACK_ADDRESS.to_string(),
                host_port: config.port,
                container_port: REGISTRY_CONTAINER_PORT,
            }],
            volume: (!config.volume_name.is_empty()).then(|| VolumeMount {
                name: config.volume_name.clone(),
                target: REGISTRY_DATA_PATH.to_string(),
            }),
            restart: RestartPolicy::UnlessStopped,
        };

        let id = match self.engine.run_container(&spec).await {
            Ok(id) => id,
            Err(Error::AlreadyExists { .. }) => {
                // Created concurrently under the same name; adopt it
                let existing = self.find_registry(config).await?.ok_or_else(|| {
                    Error::AlreadyExists {
                        kind: "container",
                        name: config.name.clone(),
                    }
                    .context(format!("create registry {}", config.host))
                })?;
                return self.reuse(config, existing).await;
            }
            Err(e) => return Err(e.context(format!("create registry {}", config.host))),
        };

        info!(
            registry = %config.host,
            container = %config.name,
            port = config.port,
            pull_through = config.is_pull_through(),
            "Created registry container"
        );
        Ok(RegistryInfo::from_config(
            config,
            id,
            config.port,
            Vec::new(),
            RegistryState::Created,
        ))
    }

    async fn find_registry(&self, config: &RegistryConfig) -> Result<Option<ContainerSummary>> {
        let found = self
            .engine
            .list_containers(config.labels().into_iter().collect())
            .await
            .context(format!("look up registry {}", config.host))?;
        if found.len() > 1 {
            warn!(
                registry = %config.host,
                cluster = %config.cluster_name,
                count = found.len(),
                "Multiple containers carry the same registry labels, using the first"
            );
        }
        Ok(found.into_iter().next())
    }

    async fn reuse(&self, config: &RegistryConfig, existing: ContainerSummary) -> Result<RegistryInfo> {
        let port = if existing.running {
            existing.ports.get(&REGISTRY_CONTAINER_PORT).copied()
        } else {
            info!(registry = %config.host, container = %existing.name, "Starting stopped registry container");
            self.engine
                .start_container(&existing.name)
                .await
                .context(format!("start registry {}", config.host))?;
            self.engine
                .host_port(&existing.name, REGISTRY_CONTAINER_PORT)
                .await
                .context(format!("look up port of registry {}", config.host))?
        };

        let port = port.ok_or_else(|| Error::PortNotFound {
            host: config.host.clone(),
            container: existing.name.clone(),
        })?;

        let state = if existing.networks.iter().any(|n| n == &config.network_name) {
            RegistryState::NetworkAttached
        } else {
            RegistryState::Created
        };

        debug!(registry = %config.host, container = %existing.name, port, "Reusing registry container");
        Ok(RegistryInfo::from_config(
            config,
            existing.id,
            port,
            existing.networks,
            state,
        ))
    }

    /// Attach one registry to `network`; a no-op if already attached.
    pub async fn connect_registry_to_network(
        &self,
        info: &mut RegistryInfo,
        network: &str,
    ) -> Result<()> {
        if info.networks().iter().any(|n| n == network) {
            info.attach(network);
            return Ok(());
        }

        match self
            .engine
            .connect_network(network, info.container_name())
            .await
        {
            Ok(()) | Err(Error::AlreadyExists { .. }) => {}
            Err(e) => {
                return Err(e.context(format!(
                    "connect registry {} to network {network}",
                    info.host()
                )))
            }
        }

        debug!(registry = %info.host(), network = %network, "Attached registry to network");
        info.attach(network);
        Ok(())
    }

    /// Attach every registry to `network`.
    pub async fn connect_registries_to_network(
        &self,
        infos: &mut [RegistryInfo],
        network: &str,
    ) -> Result<()> {
        for info in infos.iter_mut() {
            self.connect_registry_to_network(info, network).await?;
        }
        Ok(())
    }

    /// Poll one registry until it is ready, moving it to `Ready` or `Failed`.
    pub async fn wait_for_registry_ready(
        &self,
        cancel: &CancellationToken,
        info: &mut RegistryInfo,
    ) -> Result<()> {
        info.set_state(RegistryState::WaitingReady);

        let engine = Arc::clone(&self.engine);
        let container = info.container_name().to_string();
        let crashed = || {
            let engine = Arc::clone(&engine);
            let container = container.clone();
            async move {
                match engine.inspect_state(&container).await {
                    Ok(state) if state.has_crashed() => Ok(Some(format!(
                        "container {container} is {} (last exit code {})",
                        state.status,
                        state.exit_code
                    ))),
                    Ok(_) => Ok(None),
                    Err(e) if e.is_not_found() => {
                        Ok(Some(format!("container {container} no longer exists")))
                    }
                    Err(e) => Err(e.context(format!("inspect container {container}"))),
                }
            }
        };

        let result = health::wait_until_ready(
            &self.http,
            &self.health,
            cancel,
            info.host(),
            &info.health_url(),
            crashed,
        )
        .await;

        match result {
            Ok(()) => {
                info.set_state(RegistryState::Ready);
                info!(registry = %info.host(), port = info.port(), "Registry ready");
                Ok(())
            }
            Err(e) => {
                info.set_state(RegistryState::Failed);
                Err(e.context(format!("wait for registry {}", info.host())))
            }
        }
    }

    /// Wait for every registry concurrently; the first failure aborts the rest.
    pub async fn wait_for_registries_ready(
        &self,
        cancel: &CancellationToken,
        infos: &mut [RegistryInfo],
    ) -> Result<()> {
        try_join_all(
            infos
                .iter_mut()
                .map(|info| self.wait_for_registry_ready(cancel, info)),
        )
        .await
        .map(|_| ())
    }

    /// Probe a registry published on loopback `port` once.
    pub async fn probe(&self, port: u16) -> Probe {
        let url = format!("http://{LOOPBACK_ADDRESS}:{port}/");
        health::probe(&self.http, &url, self.health.request_timeout).await
    }

    /// Managed registry containers, optionally restricted to one cluster,
    /// sorted by name.
    pub async fn list_registries(&self, cluster: Option<&str>) -> Result<Vec<ContainerSummary>> {
        let mut labels = vec![(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())];
        if let Some(cluster) = cluster {
            labels.push((CLUSTER_LABEL.to_string(), cluster.to_string()));
        }
        let mut found = self
            .engine
            .list_containers(labels)
            .await
            .context("list registries")?;
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    /// Remove every managed registry of `cluster`, returning how many were removed.
    pub async fn teardown_registries(&self, cluster: &str, remove_volumes: bool) -> Result<usize> {
        let registries = self.list_registries(Some(cluster)).await?;
        for registry in &registries {
            self.remove(registry, remove_volumes).await?;
        }
        if !registries.is_empty() {
            info!(cluster = %cluster, count = registries.len(), "Removed registries");
        }
        Ok(registries.len())
    }

    /// Remove the registry serving `host` in `cluster`. Returns whether one existed.
    pub async fn teardown_registry(
        &self,
        cluster: &str,
        host: &str,
        remove_volumes: bool,
    ) -> Result<bool> {
        let labels = vec![
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
            (CLUSTER_LABEL.to_string(), cluster.to_string()),
            (REGISTRY_HOST_LABEL.to_string(), host.to_string()),
        ];
        let found = self
            .engine
            .list_containers(labels)
            .await
            .context(format!("look up registry {host}"))?;
        for registry in &found {
            self.remove(registry, remove_volumes).await?;
        }
        Ok(!found.is_empty())
    }

    async fn remove(&self, registry: &ContainerSummary, remove_volumes: bool) -> Result<()> {
        match self.engine.remove_container(&registry.name).await {
            Ok(()) => debug!(container = %registry.name, "Removed registry container"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.context(format!("remove container {}", registry.name))),
        }

        if remove_volumes {
            let volume = format!("{}-data", registry.name);
            match self.engine.remove_volume(&volume).await {
                Ok(()) => debug!(volume = %volume, "Removed registry volume"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.context(format!("remove volume {volume}"))),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::config::{registry_labels, MirrorSpec};
    use crate::engine::{ContainerState, MockContainerEngine};
    use crate::health::tests::{fast_config, refused_port, serve_status};

    fn config(host: &str, upstream: Option<&str>, port: u16) -> RegistryConfig {
        let spec = MirrorSpec {
            host: host.to_string(),
            upstream: upstream.map(String::from),
        };
        RegistryConfig::for_mirror("dev", "kind", port, &spec)
    }

    fn summary(config: &RegistryConfig, running: bool, host_port: Option<u16>) -> ContainerSummary {
        ContainerSummary {
            id: format!("id-{}", config.name),
            name: config.name.clone(),
            labels: registry_labels(&config.cluster_name, &config.host),
            running,
            networks: vec!["bridge".to_string()],
            ports: host_port
                .map(|p| [(REGISTRY_CONTAINER_PORT, p)].into_iter().collect())
                .unwrap_or_default(),
        }
    }

    fn manager(engine: MockContainerEngine) -> RegistryManager {
        RegistryManager::new(Arc::new(engine))
            .unwrap()
            .with_health_config(fast_config())
    }

    #[tokio::test]
    async fn existing_network_is_not_recreated() {
        let mut engine = MockContainerEngine::new();
        engine.expect_network_exists().returning(|_| Ok(true));
        engine.expect_create_network().never();

        manager(engine).ensure_network_exists("kind", None).await.unwrap();
    }

    #[tokio::test]
    async fn missing_network_is_created_with_cidr() {
        let mut engine = MockContainerEngine::new();
        engine.expect_network_exists().returning(|_| Ok(false));
        engine
            .expect_create_network()
            .withf(|name, cidr| name == "kind" && cidr.as_deref() == Some("172.30.0.0/16"))
            .times(1)
            .returning(|_, _| Ok(()));

        manager(engine)
            .ensure_network_exists("kind", Some("172.30.0.0/16"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn network_creation_race_is_success() {
        let mut engine = MockContainerEngine::new();
        engine.expect_network_exists().returning(|_| Ok(false));
        engine.expect_create_network().returning(|name, _| {
            Err(Error::AlreadyExists {
                kind: "network",
                name: name.to_string(),
            })
        });

        manager(engine).ensure_network_exists("kind", None).await.unwrap();
    }

    #[tokio::test]
    async fn network_failure_carries_operation() {
        let mut engine = MockContainerEngine::new();
        engine.expect_network_exists().returning(|_| Ok(false));
        engine
            .expect_create_network()
            .returning(|_, _| Err(Error::engine("network create", "permission denied")));

        let err = manager(engine)
            .ensure_network_exists("kind", None)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to create network: "));
        assert!(matches!(err.root(), Error::Engine { .. }));
    }

    #[tokio::test]
    async fn new_registry_binds_loopback_with_volume_and_restart_policy() {
        let mut engine = MockContainerEngine::new();
        engine.expect_list_containers().returning(|_| Ok(vec![]));
        engine
            .expect_run_container()
            .withf(|spec| {
                spec.image == REGISTRY_IMAGE
                    && spec.ports
                        == vec![PortBinding {
                            host_ip: "127.0.0.1".to_string(),
                            host_port: 5001,
                            container_port: 5000,
                        }]
                    && spec.restart == RestartPolicy::UnlessStopped
                    && spec.volume.as_ref().map(|v| v.name.as_str())
                        == Some("kindling-dev-docker-io-data")
                    && spec.env.get("REGISTRY_PROXY_REMOTEURL").map(String::as_str)
                        == Some("https://registry-1.docker.io")
                    && spec.labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE)
            })
            .times(1)
            .returning(|_| Ok("abc123".to_string()));

        let info = manager(engine)
            .setup_registry(&config("docker.io", Some("https://registry-1.docker.io"), 5001))
            .await
            .unwrap();

        assert_eq!(info.container_id(), "abc123");
        assert_eq!(info.port(), 5001);
        assert_eq!(info.state(), RegistryState::Created);
    }

    #[tokio::test]
    async fn setup_twice_creates_no_duplicates() {
        let created: Arc<Mutex<Vec<ContainerSummary>>> = Arc::default();
        let mut engine = MockContainerEngine::new();

        let listed = Arc::clone(&created);
        engine
            .expect_list_containers()
            .returning(move |_| Ok(listed.lock().unwrap().clone()));

        let store = Arc::clone(&created);
        engine.expect_run_container().times(1).returning(move |spec| {
            store.lock().unwrap().push(ContainerSummary {
                id: "abc123".to_string(),
                name: spec.name.clone(),
                labels: spec.labels.clone(),
                running: true,
                networks: vec![],
                ports: [(REGISTRY_CONTAINER_PORT, spec.ports[0].host_port)]
                    .into_iter()
                    .collect(),
            });
            Ok("abc123".to_string())
        });
        engine.expect_start_container().never();

        let manager = manager(engine);
        let configs = vec![config("quay.io", Some("https://quay.io"), 5002)];

        let first = manager.setup_registries(&configs).await.unwrap();
        let second = manager.setup_registries(&configs).await.unwrap();

        assert_eq!(first[0].container_id(), second[0].container_id());
        assert_eq!(second[0].port(), 5002);
        assert_eq!(created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn running_container_without_port_is_port_not_found() {
        let cfg = config("ghcr.io", None, 5003);
        let existing = summary(&cfg, true, None);
        let mut engine = MockContainerEngine::new();
        engine
            .expect_list_containers()
            .returning(move |_| Ok(vec![existing.clone()]));

        let err = manager(engine).setup_registry(&cfg).await.unwrap_err();
        assert!(matches!(err, Error::PortNotFound { host, .. } if host == "ghcr.io"));
    }

    #[tokio::test]
    async fn stopped_container_is_restarted() {
        let cfg = config("ghcr.io", None, 5003);
        let existing = summary(&cfg, false, None);
        let mut engine = MockContainerEngine::new();
        engine
            .expect_list_containers()
            .returning(move |_| Ok(vec![existing.clone()]));
        engine
            .expect_start_container()
            .withf(|name| name == "kindling-dev-ghcr-io")
            .times(1)
            .returning(|_| Ok(()));
        engine
            .expect_host_port()
            .returning(|_, _| Ok(Some(5003)));
        engine.expect_run_container().never();

        let info = manager(engine).setup_registry(&cfg).await.unwrap();
        assert_eq!(info.port(), 5003);
    }

    #[tokio::test]
    async fn partial_credentials_fail_before_engine_calls() {
        // No expectations: any engine call panics
        let engine = MockContainerEngine::new();
        let cfg = config("docker.io", Some("https://registry-1.docker.io"), 5001)
            .with_credentials(Some("bob".to_string()), None);

        let err = manager(engine).setup_registry(&cfg).await.unwrap_err();
        assert!(matches!(err, Error::PartialCredentials { .. }));
    }

    #[tokio::test]
    async fn connect_skips_already_attached() {
        let cfg = config("quay.io", None, 5002);
        let mut info = RegistryInfo::from_config(
            &cfg,
            "abc",
            5002,
            vec!["kind".to_string()],
            RegistryState::Created,
        );
        let mut engine = MockContainerEngine::new();
        engine.expect_connect_network().never();

        manager(engine)
            .connect_registry_to_network(&mut info, "kind")
            .await
            .unwrap();
        assert_eq!(info.state(), RegistryState::NetworkAttached);
    }

    #[tokio::test]
    async fn connect_attaches_each_registry() {
        let mut infos = vec![
            RegistryInfo::from_config(&config("a.io", None, 5001), "a", 5001, vec![], RegistryState::Created),
            RegistryInfo::from_config(&config("b.io", None, 5002), "b", 5002, vec![], RegistryState::Created),
        ];
        let mut engine = MockContainerEngine::new();
        engine
            .expect_connect_network()
            .withf(|network, _| network == "kind")
            .times(2)
            .returning(|_, _| Ok(()));

        manager(engine)
            .connect_registries_to_network(&mut infos, "kind")
            .await
            .unwrap();
        assert!(infos.iter().all(|i| i.networks() == ["kind".to_string()]));
    }

    #[tokio::test]
    async fn healthy_registry_becomes_ready() {
        let port = serve_status("200 OK").await;
        let cfg = config("docker.io", None, port);
        let mut infos = vec![RegistryInfo::from_config(&cfg, "abc", port, vec![], RegistryState::NetworkAttached)];

        manager(MockContainerEngine::new())
            .wait_for_registries_ready(&CancellationToken::new(), &mut infos)
            .await
            .unwrap();
        assert!(infos[0].is_ready());
    }

    #[rstest]
    #[case::exited("exited", false, false)]
    // What docker reports for a crashed container under unless-stopped
    #[case::restart_loop("restarting", true, true)]
    #[tokio::test]
    async fn crashed_registry_fails_well_before_timeout(
        #[case] status: &'static str,
        #[case] running: bool,
        #[case] restarting: bool,
    ) {
        let port = refused_port().await;
        let cfg = config("docker.io", None, port);
        let mut info = RegistryInfo::from_config(&cfg, "abc", port, vec![], RegistryState::NetworkAttached);

        let mut engine = MockContainerEngine::new();
        engine.expect_inspect_state().returning(move |_| {
            Ok(ContainerState {
                status: status.to_string(),
                running,
                restarting,
                exit_code: 1,
            })
        });
        let manager = RegistryManager::new(Arc::new(engine))
            .unwrap()
            .with_health_config(HealthCheckConfig {
                timeout: Duration::from_secs(30),
                interval: Duration::from_millis(10),
                ..fast_config()
            });

        let start = std::time::Instant::now();
        let err = manager
            .wait_for_registry_ready(&CancellationToken::new(), &mut info)
            .await
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(matches!(err.root(), Error::NotReady { .. }));
        assert_eq!(info.state(), RegistryState::Failed);
    }

    #[tokio::test]
    async fn probe_reports_status() {
        let port = serve_status("503 Service Unavailable").await;
        let probe = manager(MockContainerEngine::new()).probe(port).await;
        assert_eq!(probe, Probe::Status(503));
    }

    #[tokio::test]
    async fn teardown_tolerates_missing_resources() {
        let a = summary(&config("a.io", None, 5001), true, Some(5001));
        let b = summary(&config("b.io", None, 5002), false, None);
        let mut engine = MockContainerEngine::new();
        engine
            .expect_list_containers()
            .withf(|labels| {
                labels.contains(&(CLUSTER_LABEL.to_string(), "dev".to_string()))
                    && labels.len() == 2
            })
            .returning(move |_| Ok(vec![b.clone(), a.clone()]));
        engine.expect_remove_container().times(2).returning(|name| {
            if name == "kindling-dev-b-io" {
                Err(Error::not_found("container", name))
            } else {
                Ok(())
            }
        });
        engine
            .expect_remove_volume()
            .times(2)
            .returning(|name| Err(Error::not_found("volume", name)));

        let removed = manager(engine).teardown_registries("dev", true).await.unwrap();
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn teardown_single_registry_reports_absence() {
        let mut engine = MockContainerEngine::new();
        engine.expect_list_containers().returning(|_| Ok(vec![]));
        engine.expect_remove_container().never();

        let existed = manager(engine)
            .teardown_registry("dev", "quay.io", false)
            .await
            .unwrap();
        assert!(!existed);
    }
}
