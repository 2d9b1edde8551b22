//! Creation-time cluster snapshot.
//!
//! A [`ClusterSpec`] records what a cluster was created with: its network,
//! node image and mirror set, plus the loopback port each mirror's registry
//! was given. `update` diffs a desired mirror set against it.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kindling_common::state::validate_cluster_name;
use kindling_registry::{registry_configs, MirrorSpec, RegistryConfig};

use crate::{Error, Result};

/// Default first loopback port for registries
pub const DEFAULT_REGISTRY_PORT_BASE: u16 = 5001;

/// Upstream credentials for one mirror. Values may hold `${VAR}`
/// placeholders, which are stored unexpanded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Configuration a cluster was created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub name: String,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_cidr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_image: Option<String>,
    #[serde(default)]
    pub mirrors: Vec<MirrorSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, MirrorCredentials>,
    pub registry_port_base: u16,
    /// Loopback port assigned to each mirror host
    #[serde(default)]
    pub registry_ports: BTreeMap<String, u16>,
    pub created_at: DateTime<Utc>,
}

/// Mirror changes between two specs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorDiff {
    /// Hosts only in the desired spec
    pub added: Vec<MirrorSpec>,
    /// Hosts only in the current spec
    pub removed: Vec<MirrorSpec>,
    /// Hosts in both whose upstream changed (desired value)
    pub changed: Vec<MirrorSpec>,
}

impl MirrorDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl ClusterSpec {
    /// New spec with sequential registry ports starting at `registry_port_base`.
    pub fn new(
        name: impl Into<String>,
        network: impl Into<String>,
        registry_port_base: u16,
        mirrors: Vec<MirrorSpec>,
    ) -> Result<Self> {
        let name = name.into();
        let network = network.into();
        validate_kind_name(&name)?;

        let registry_ports = registry_configs(&name, &network, registry_port_base, &mirrors)?
            .into_iter()
            .map(|config| (config.host, config.port))
            .collect();

        Ok(Self {
            name,
            network,
            network_cidr: None,
            node_image: None,
            mirrors,
            credentials: BTreeMap::new(),
            registry_port_base,
            registry_ports,
            created_at: Utc::now(),
        })
    }

    /// Registry configurations for every mirror, in mirror order.
    pub fn registry_configs(&self) -> Result<Vec<RegistryConfig>> {
        self.mirrors
            .iter()
            .map(|mirror| {
                let port = self.registry_ports.get(&mirror.host).copied().ok_or_else(|| {
                    Error::validation(format!("no registry port assigned to {}", mirror.host))
                })?;
                let creds = self.credentials.get(&mirror.host).cloned().unwrap_or_default();
                Ok(RegistryConfig::for_mirror(&self.name, &self.network, port, mirror)
                    .with_credentials(creds.username, creds.password))
            })
            .collect()
    }

    /// Differences going from `self` to `desired`, keyed by host.
    pub fn mirror_diff(&self, desired: &[MirrorSpec]) -> MirrorDiff {
        let current: BTreeMap<&str, &MirrorSpec> =
            self.mirrors.iter().map(|m| (m.host.as_str(), m)).collect();
        let wanted: BTreeMap<&str, &MirrorSpec> =
            desired.iter().map(|m| (m.host.as_str(), m)).collect();

        let mut diff = MirrorDiff::default();
        for mirror in desired {
            match current.get(mirror.host.as_str()) {
                None => diff.added.push(mirror.clone()),
                Some(existing) if existing.upstream != mirror.upstream => {
                    diff.changed.push(mirror.clone())
                }
                Some(_) => {}
            }
        }
        for mirror in &self.mirrors {
            if !wanted.contains_key(mirror.host.as_str()) {
                diff.removed.push(mirror.clone());
            }
        }
        diff
    }

    /// Replace the mirror set, keeping ports of retained hosts and giving
    /// new hosts the lowest free ports at or above the base.
    pub fn with_mirrors(&self, mirrors: Vec<MirrorSpec>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        if let Some(dup) = mirrors.iter().find(|m| !seen.insert(m.host.as_str())) {
            return Err(Error::validation(format!(
                "registry host '{}' given twice",
                dup.host
            )));
        }

        let mut ports: BTreeMap<String, u16> = mirrors
            .iter()
            .filter_map(|m| {
                self.registry_ports
                    .get(&m.host)
                    .map(|port| (m.host.clone(), *port))
            })
            .collect();
        let mut used: BTreeSet<u16> = ports.values().copied().collect();

        for mirror in &mirrors {
            if ports.contains_key(&mirror.host) {
                continue;
            }
            let port = (self.registry_port_base..=u16::MAX)
                .find(|p| !used.contains(p))
                .ok_or_else(|| Error::validation("no free registry port left"))?;
            used.insert(port);
            ports.insert(mirror.host.clone(), port);
        }

        let mut next = self.clone();
        next.credentials
            .retain(|host, _| mirrors.iter().any(|m| &m.host == host));
        next.mirrors = mirrors;
        next.registry_ports = ports;
        Ok(next)
    }
}

/// Cluster names must be usable as a state directory and as a kind cluster
/// name (lowercase alphanumerics, `-` and `.`).
pub fn validate_kind_name(name: &str) -> Result<()> {
    validate_cluster_name(name)?;
    let valid = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && name.starts_with(|c: char| c.is_ascii_alphanumeric());
    if !valid {
        return Err(Error::validation(format!(
            "cluster name '{name}' must be lowercase alphanumerics, '-' or '.'"
        )));
    }
    Ok(())
}

/// Parse repeated `HOST=VALUE` flags into a map.
pub fn parse_host_values(values: &[String], flag: &str) -> Result<BTreeMap<String, String>> {
    values
        .iter()
        .map(|raw| {
            raw.split_once('=')
                .filter(|(host, _)| !host.trim().is_empty())
                .map(|(host, value)| (host.trim().to_string(), value.to_string()))
                .ok_or_else(|| Error::validation(format!("--{flag} expects HOST=VALUE, got '{raw}'")))
        })
        .collect()
}

/// Merge `--registry-username`/`--registry-password` maps into credentials.
pub fn merge_credentials(
    usernames: BTreeMap<String, String>,
    passwords: BTreeMap<String, String>,
) -> BTreeMap<String, MirrorCredentials> {
    let mut merged: BTreeMap<String, MirrorCredentials> = BTreeMap::new();
    for (host, username) in usernames {
        merged.entry(host).or_default().username = Some(username);
    }
    for (host, password) in passwords {
        merged.entry(host).or_default().password = Some(password);
    }
    merged
}
