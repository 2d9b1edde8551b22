//! Update command - reconcile a live cluster's mirrors with a new mirror set
//!
//! Removed mirrors (and mirrors whose upstream or credentials changed) have
//! their registries torn down. Every desired registry is then set up, which
//! reuses the untouched ones, and the node fragments are rewritten.

use std::collections::BTreeSet;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kindling_registry::MirrorSpec;

use super::kind_utils;
use crate::cluster::{merge_credentials, parse_host_values, ClusterSpec};
use crate::config::CliConfig;
use crate::{Error, Result};

/// Reconcile a cluster's mirrors
#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Cluster name
    #[arg(long, default_value = "kind")]
    pub name: String,

    /// Full desired mirror set as HOST[=UPSTREAM]; omitted mirrors are removed
    #[arg(long = "mirror", value_name = "HOST[=UPSTREAM]")]
    pub mirrors: Vec<MirrorSpec>,

    /// Upstream username for a mirror as HOST=VALUE (may use ${VAR})
    #[arg(long = "registry-username", value_name = "HOST=VALUE")]
    pub registry_usernames: Vec<String>,

    /// Upstream password for a mirror as HOST=VALUE (may use ${VAR})
    #[arg(long = "registry-password", value_name = "HOST=VALUE")]
    pub registry_passwords: Vec<String>,

    /// Remove data volumes of torn-down registries
    #[arg(long)]
    pub remove_volumes: bool,

    /// Show the mirror changes without applying them
    #[arg(long)]
    pub dry_run: bool,
}

/// What `update` will do to a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePlan {
    /// Spec to save once applied
    pub desired: ClusterSpec,
    /// Hosts whose registry must be removed before setup
    pub teardown: Vec<String>,
    /// Hosts dropped from the mirror set entirely
    pub removed: Vec<String>,
}

/// Work out the update from the saved spec and the requested mirrors.
pub fn plan_update(current: &ClusterSpec, args: &UpdateArgs) -> Result<UpdatePlan> {
    let mut desired = current.with_mirrors(args.mirrors.clone())?;
    let overrides = merge_credentials(
        parse_host_values(&args.registry_usernames, "registry-username")?,
        parse_host_values(&args.registry_passwords, "registry-password")?,
    );
    for (host, creds) in overrides {
        if !desired.mirrors.iter().any(|m| m.host == host) {
            return Err(Error::validation(format!(
                "credentials given for {host}, which is not a --mirror host"
            )));
        }
        let entry = desired.credentials.entry(host).or_default();
        if creds.username.is_some() {
            entry.username = creds.username;
        }
        if creds.password.is_some() {
            entry.password = creds.password;
        }
    }

    let diff = current.mirror_diff(&desired.mirrors);
    let removed: Vec<String> = diff.removed.iter().map(|m| m.host.clone()).collect();

    let mut teardown: BTreeSet<String> = removed.iter().cloned().collect();
    teardown.extend(diff.changed.iter().map(|m| m.host.clone()));
    for mirror in &current.mirrors {
        let before = current.credentials.get(&mirror.host);
        let after = desired.credentials.get(&mirror.host);
        if desired.registry_ports.contains_key(&mirror.host) && before != after {
            teardown.insert(mirror.host.clone());
        }
    }

    Ok(UpdatePlan {
        desired,
        teardown: teardown.into_iter().collect(),
        removed,
    })
}

pub async fn run(args: UpdateArgs, config: &CliConfig, cancel: &CancellationToken) -> Result<()> {
    let store = config.state_store();
    let current: ClusterSpec = match store.load_cluster_spec(&args.name) {
        Ok(spec) => spec,
        Err(e) if e.is_not_found() => {
            return Err(Error::ClusterNotFound {
                name: args.name.clone(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    let plan = plan_update(&current, &args)?;
    info!(
        cluster = %current.name,
        teardown = ?plan.teardown,
        removed = ?plan.removed,
        mirrors = plan.desired.mirrors.len(),
        "Planned mirror update"
    );
    if args.dry_run {
        return Ok(());
    }

    if !kind_utils::cluster_exists(config, &current.name).await? {
        return Err(Error::ClusterNotFound {
            name: current.name.clone(),
        });
    }

    let orchestrator = config.orchestrator()?;
    for host in &plan.teardown {
        orchestrator
            .manager()
            .teardown_registry(&current.name, host, args.remove_volumes)
            .await?;
    }

    let desired = plan.desired;
    let registries = orchestrator
        .prepare(
            cancel,
            &desired.network,
            desired.network_cidr.as_deref(),
            &desired.registry_configs()?,
        )
        .await?;
    orchestrator
        .configure_nodes(cancel, &desired.name, &registries)
        .await?;
    orchestrator
        .clear_nodes(cancel, &desired.name, &plan.removed)
        .await?;

    store.save_cluster_spec(&desired.name, &desired)?;
    info!(cluster = %desired.name, mirrors = desired.mirrors.len(), "Cluster mirrors updated");
    Ok(())
}
