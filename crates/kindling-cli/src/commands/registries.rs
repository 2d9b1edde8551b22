//! Registries command - list managed registries and probe their health

use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kindling_common::{task, SyncWriter, Task, CLUSTER_LABEL, REGISTRY_HOST_LABEL};
use kindling_registry::{ContainerSummary, Probe, REGISTRY_CONTAINER_PORT};

use crate::config::CliConfig;
use crate::Result;

/// List managed registries
#[derive(Args, Debug)]
pub struct RegistriesArgs {
    /// Only registries of this cluster
    #[arg(long)]
    pub cluster: Option<String>,
}

const HEADER: [&str; 5] = ["CLUSTER", "HOST", "CONTAINER", "PORT", "STATUS"];

/// One output row; columns follow [`HEADER`].
pub fn format_row(columns: [&str; 5]) -> String {
    format!(
        "{:<16} {:<24} {:<40} {:<6} {}",
        columns[0], columns[1], columns[2], columns[3], columns[4]
    )
}

/// Human-readable probe outcome
pub fn status_label(probe: &Probe) -> String {
    match probe {
        Probe::Ready => "ready".to_string(),
        Probe::Refused => "connection refused".to_string(),
        Probe::Status(status) => format!("http {status}"),
        Probe::Failed(_) => "unreachable".to_string(),
    }
}

fn label<'a>(registry: &'a ContainerSummary, key: &str) -> &'a str {
    registry.labels.get(key).map(String::as_str).unwrap_or("-")
}

pub async fn run(args: RegistriesArgs, config: &CliConfig, cancel: &CancellationToken) -> Result<()> {
    let manager = config.registry_manager()?;
    let registries = manager.list_registries(args.cluster.as_deref()).await?;
    if registries.is_empty() {
        info!(cluster = ?args.cluster, "No managed registries");
        return Ok(());
    }

    let out = Arc::new(SyncWriter::new(std::io::stdout()));
    out.write_line(&format_row(HEADER))?;

    // Rows appear as probes finish
    let tasks: Vec<Task> = registries
        .into_iter()
        .map(|registry| {
            let manager = manager.clone();
            let out = Arc::clone(&out);
            task(move |_token| async move {
                let port = registry.ports.get(&REGISTRY_CONTAINER_PORT).copied();
                let status = match port {
                    _ if !registry.running => "stopped".to_string(),
                    Some(port) => status_label(&manager.probe(port).await),
                    None => "no port".to_string(),
                };
                let port = port.map_or_else(|| "-".to_string(), |p| p.to_string());
                out.write_line(&format_row([
                    label(&registry, CLUSTER_LABEL),
                    label(&registry, REGISTRY_HOST_LABEL),
                    registry.name.as_str(),
                    port.as_str(),
                    status.as_str(),
                ]))?;
                Ok(())
            })
        })
        .collect();

    config.executor().execute(cancel, tasks).await?;
    Ok(())
}
