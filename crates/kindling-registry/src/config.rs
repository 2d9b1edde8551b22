//! Registry configuration and its resolved runtime view.
//!
//! A [`MirrorSpec`] is what the user typed (`docker.io=https://registry-1.docker.io`).
//! [`RegistryConfig`] is the intended state of one registry container.
//! [`RegistryInfo`] is what exists after setup; it can only be derived from a
//! `RegistryConfig`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use kindling_common::{
    Error, Result, CLUSTER_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, REGISTRY_HOST_LABEL,
};

/// Env var the registry image reads for the pull-through upstream
pub const PROXY_REMOTE_URL_ENV: &str = "REGISTRY_PROXY_REMOTEURL";
/// Env var the registry image reads for the upstream username
pub const PROXY_USERNAME_ENV: &str = "REGISTRY_PROXY_USERNAME";
/// Env var the registry image reads for the upstream password
pub const PROXY_PASSWORD_ENV: &str = "REGISTRY_PROXY_PASSWORD";

/// A `host=upstream` mirror flag. A bare `host` is a standalone local registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MirrorSpec {
    /// Registry host clients pull from (e.g. `docker.io`)
    pub host: String,
    /// Upstream URL to proxy; `None` for a local registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
}

impl FromStr for MirrorSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, upstream) = match s.split_once('=') {
            Some((host, upstream)) => {
                let upstream = upstream.trim();
                if upstream.is_empty() {
                    return Err(Error::validation(format!(
                        "mirror '{s}' has an empty upstream"
                    )));
                }
                (host.trim(), Some(upstream.to_string()))
            }
            None => (s, None),
        };

        if host.is_empty() {
            return Err(Error::validation(format!("mirror '{s}' has an empty host")));
        }
        if host.contains('/') || host.chars().any(char::is_whitespace) {
            return Err(Error::validation(format!(
                "mirror host '{host}' must be a bare host[:port]"
            )));
        }

        Ok(Self {
            host: host.to_string(),
            upstream,
        })
    }
}

impl fmt::Display for MirrorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.upstream {
            Some(upstream) => write!(f, "{}={}", self.host, upstream),
            None => f.write_str(&self.host),
        }
    }
}

/// Intended configuration of one registry container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Container name
    pub name: String,
    /// Registry host this container serves (e.g. `docker.io`)
    pub host: String,
    /// Loopback host port the registry is published on
    pub port: u16,
    /// Upstream to proxy; empty means a standalone local registry
    pub upstream_url: String,
    /// Cluster the registry belongs to
    pub cluster_name: String,
    /// Network the registry is attached to
    pub network_name: String,
    /// Named volume for registry data; empty means no volume
    pub volume_name: String,
    /// Upstream username; may contain `${VAR}` placeholders
    pub username: Option<String>,
    /// Upstream password; may contain `${VAR}` placeholders
    pub password: Option<String>,
}

impl RegistryConfig {
    /// Derive the registry configuration for a mirror of `cluster`.
    pub fn for_mirror(cluster: &str, network: &str, port: u16, spec: &MirrorSpec) -> Self {
        let name = container_name(cluster, &spec.host);
        Self {
            volume_name: format!("{name}-data"),
            name,
            host: spec.host.clone(),
            port,
            upstream_url: spec.upstream.clone().unwrap_or_default(),
            cluster_name: cluster.to_string(),
            network_name: network.to_string(),
            username: None,
            password: None,
        }
    }

    /// Attach upstream credentials
    pub fn with_credentials(
        mut self,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    /// Whether this registry proxies an upstream
    pub fn is_pull_through(&self) -> bool {
        !self.upstream_url.is_empty()
    }

    /// Labels identifying this registry's container.
    pub fn labels(&self) -> BTreeMap<String, String> {
        registry_labels(&self.cluster_name, &self.host)
    }

    /// Expand `${VAR}` placeholders and validate the credential pair.
    ///
    /// Returns `None` when neither side is set (after expansion), and
    /// [`Error::PartialCredentials`] when only one is.
    pub fn resolve_credentials<F>(&self, lookup: F) -> Result<Option<(String, String)>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let expand = |v: &Option<String>| {
            v.as_deref()
                .map(|raw| expand_env(raw, &lookup))
                .filter(|s| !s.is_empty())
        };

        match (expand(&self.username), expand(&self.password)) {
            (Some(user), Some(pass)) => Ok(Some((user, pass))),
            (None, None) => Ok(None),
            _ => Err(Error::PartialCredentials {
                host: self.host.clone(),
            }),
        }
    }

    /// Container environment for the registry image.
    pub fn container_env<F>(&self, lookup: F) -> Result<BTreeMap<String, String>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let credentials = self.resolve_credentials(lookup)?;
        let mut env = BTreeMap::new();
        if self.is_pull_through() {
            env.insert(PROXY_REMOTE_URL_ENV.to_string(), self.upstream_url.clone());
            if let Some((user, pass)) = credentials {
                env.insert(PROXY_USERNAME_ENV.to_string(), user);
                env.insert(PROXY_PASSWORD_ENV.to_string(), pass);
            }
        }
        Ok(env)
    }
}

/// Build registry configs for `specs`, assigning ports from `base_port` upward.
pub fn registry_configs(
    cluster: &str,
    network: &str,
    base_port: u16,
    specs: &[MirrorSpec],
) -> Result<Vec<RegistryConfig>> {
    let mut seen = HashMap::new();
    let mut configs = Vec::with_capacity(specs.len());

    for (offset, spec) in specs.iter().enumerate() {
        if let Some(previous) = seen.insert(spec.host.as_str(), offset) {
            return Err(Error::validation(format!(
                "registry host '{}' given twice (mirrors #{} and #{})",
                spec.host,
                previous + 1,
                offset + 1
            )));
        }
        let port = u16::try_from(offset)
            .ok()
            .and_then(|o| base_port.checked_add(o))
            .ok_or_else(|| Error::validation("registry port range overflows 65535"))?;
        configs.push(RegistryConfig::for_mirror(cluster, network, port, spec));
    }

    Ok(configs)
}

/// Labels carried by every managed registry container
pub fn registry_labels(cluster: &str, host: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
        (REGISTRY_HOST_LABEL.to_string(), host.to_string()),
    ])
}

/// Container name for `host`'s registry in `cluster`.
///
/// `docker.io` in cluster `dev` becomes `kindling-dev-docker-io`.
pub fn container_name(cluster: &str, host: &str) -> String {
    let slug: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("kindling-{}-{}", cluster, slug.trim_matches('-'))
}

/// Expand `${VAR}` placeholders using `lookup`.
///
/// Unset variables expand to the empty string. An unterminated `${` is kept
/// literally.
pub fn expand_env<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(value.len());
    let mut remaining = value;

    while let Some(start) = remaining.find("${") {
        result.push_str(&remaining[..start]);
        let after_start = &remaining[start + 2..];

        if let Some(end) = after_start.find('}') {
            let var = &after_start[..end];
            result.push_str(&lookup(var).unwrap_or_default());
            remaining = &after_start[end + 1..];
        } else {
            result.push_str("${");
            remaining = after_start;
        }
    }
    result.push_str(remaining);
    result
}

/// Lookup backed by the process environment
pub fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Lifecycle state of one registry.
///
/// Absent → Created → NetworkAttached → WaitingReady → Ready | Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryState {
    /// No container exists
    Absent,
    /// Container exists and is running
    Created,
    /// Container is attached to the cluster network
    NetworkAttached,
    /// Readiness polling in progress
    WaitingReady,
    /// Registry answered its health check
    Ready,
    /// Registry failed its health check
    Failed,
}

/// Resolved runtime view of a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryInfo {
    host: String,
    upstream: Option<String>,
    cluster: String,
    container_id: String,
    container_name: String,
    port: u16,
    networks: Vec<String>,
    state: RegistryState,
}

impl RegistryInfo {
    pub(crate) fn from_config(
        config: &RegistryConfig,
        container_id: impl Into<String>,
        port: u16,
        networks: Vec<String>,
        state: RegistryState,
    ) -> Self {
        Self {
            host: config.host.clone(),
            upstream: config
                .is_pull_through()
                .then(|| config.upstream_url.clone()),
            cluster: config.cluster_name.clone(),
            container_id: container_id.into(),
            container_name: config.name.clone(),
            port,
            networks,
            state,
        }
    }

    /// Registry host (e.g. `docker.io`)
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Upstream URL for pull-through caches
    pub fn upstream(&self) -> Option<&str> {
        self.upstream.as_deref()
    }

    /// Owning cluster
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Engine container ID
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Container name, which is also its DNS name on the cluster network
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Loopback host port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Networks the container is attached to
    pub fn networks(&self) -> &[String] {
        &self.networks
    }

    /// Current lifecycle state
    pub fn state(&self) -> RegistryState {
        self.state
    }

    /// Whether the registry passed its health check
    pub fn is_ready(&self) -> bool {
        self.state == RegistryState::Ready
    }

    /// Root endpoint polled by the health check
    pub fn health_url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }

    pub(crate) fn set_state(&mut self, state: RegistryState) {
        self.state = state;
    }

    pub(crate) fn attach(&mut self, network: &str) {
        if !self.networks.iter().any(|n| n == network) {
            self.networks.push(network.to_string());
        }
        self.state = RegistryState::NetworkAttached;
    }
}
