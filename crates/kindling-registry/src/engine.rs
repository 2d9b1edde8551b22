//! Container engine abstraction
//!
//! [`ContainerEngine`] is the seam between registry/mirror logic and the
//! engine itself. [`CliEngine`] drives a docker-compatible CLI (`docker` or
//! `podman`) through `tokio::process`, the same way kind is driven.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use kindling_common::{Error, Result};

/// Container restart policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Never restart
    No,
    /// Restart unless the user explicitly stopped the container
    #[default]
    UnlessStopped,
}

impl RestartPolicy {
    fn as_flag(self) -> &'static str {
        match self {
            Self::No => "no",
            Self::UnlessStopped => "unless-stopped",
        }
    }
}

/// A published port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    /// Host interface address
    pub host_ip: String,
    /// Host port
    pub host_port: u16,
    /// Container port
    pub container_port: u16,
}

/// A named volume mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    /// Volume name
    pub name: String,
    /// Mount point inside the container
    pub target: String,
}

/// Everything needed to create and start a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Container labels
    pub labels: BTreeMap<String, String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Published ports
    pub ports: Vec<PortBinding>,
    /// Optional data volume
    pub volume: Option<VolumeMount>,
    /// Restart policy
    pub restart: RestartPolicy,
}

/// One row of a container listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container ID
    pub id: String,
    /// Container name
    pub name: String,
    /// Container labels
    pub labels: BTreeMap<String, String>,
    /// Whether the container is running
    pub running: bool,
    /// Attached networks
    pub networks: Vec<String>,
    /// Host ports published for each container port
    pub ports: BTreeMap<u16, u16>,
}

/// Process state of a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    /// Engine status string (running, exited, restarting, ...)
    pub status: String,
    /// Whether the main process is running
    pub running: bool,
    /// Whether the engine is restarting the container after an exit
    pub restarting: bool,
    /// Exit code of the last run
    pub exit_code: i64,
}

impl ContainerState {
    /// Whether the container stopped serving: exited, dead, or caught in a
    /// restart loop. Docker reports a crashed `unless-stopped` container as
    /// `restarting` with `Running` still true.
    pub fn has_crashed(&self) -> bool {
        self.restarting
            || self.status == "restarting"
            || (!self.running && matches!(self.status.as_str(), "exited" | "dead"))
    }
}

/// Container engine operations used by kindling.
///
/// Implementations must be safe for concurrent use.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Whether a network with this exact name exists
    async fn network_exists(&self, name: &str) -> Result<bool>;

    /// Create a bridge network, optionally with a fixed subnet
    async fn create_network(&self, name: &str, cidr: Option<String>) -> Result<()>;

    /// List containers (running or not) carrying all the given labels
    async fn list_containers(&self, labels: Vec<(String, String)>) -> Result<Vec<ContainerSummary>>;

    /// Create and start a container, returning its ID
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a stopped container
    async fn start_container(&self, name: &str) -> Result<()>;

    /// Attach a container to a network
    async fn connect_network(&self, network: &str, container: &str) -> Result<()>;

    /// Inspect a container's process state
    async fn inspect_state(&self, container: &str) -> Result<ContainerState>;

    /// Host port published for `container_port`, if any
    async fn host_port(&self, container: &str, container_port: u16) -> Result<Option<u16>>;

    /// Write `contents` to `path` inside a running container, creating parents
    async fn write_file(&self, container: &str, path: &str, contents: &str) -> Result<()>;

    /// Force-remove a container
    async fn remove_container(&self, container: &str) -> Result<()>;

    /// Remove a named volume
    async fn remove_volume(&self, name: &str) -> Result<()>;
}

/// Docker-compatible CLI engine.
#[derive(Debug, Clone)]
pub struct CliEngine {
    binary: String,
}

impl Default for CliEngine {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[derive(Deserialize)]
struct PsRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Networks", default)]
    networks: String,
    #[serde(rename = "Ports", default)]
    ports: String,
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "Restarting", default)]
    restarting: bool,
    #[serde(rename = "ExitCode", default)]
    exit_code: i64,
}

impl CliEngine {
    /// Engine driven by `binary` (e.g. `docker`, `podman`)
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// CLI binary name
    pub fn binary(&self) -> &str {
        &self.binary
    }

    async fn run(&self, operation: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<String> {
        debug!(engine = %self.binary, ?args, "Running engine command");

        let mut child = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::engine(operation, format!("failed to run {}: {}", self.binary, e)))?;

        // The pipe is closed before waiting; a failed write is reported only
        // once the child has been reaped and its own exit status checked.
        let written = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => pipe.write_all(input).await,
            _ => Ok(()),
        };

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(operation, args, stderr));
        }
        written?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Map engine stderr onto the error taxonomy.
fn classify_failure(operation: &str, args: &[&str], stderr: String) -> Error {
    let subject = args.last().copied().unwrap_or_default().to_string();
    let lower = stderr.to_lowercase();

    if lower.contains("no such container") || lower.contains("no such object") {
        Error::not_found("container", subject)
    } else if lower.contains("no such volume") || lower.contains("volume not found") {
        Error::not_found("volume", subject)
    } else if lower.contains("already exists") || lower.contains("already in use") {
        let kind = if operation.starts_with("network") {
            "network"
        } else {
            "container"
        };
        Error::AlreadyExists {
            kind,
            name: subject,
        }
    } else {
        Error::engine(operation, stderr)
    }
}

fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .collect()
}

/// Parse `0.0.0.0:5001->5000/tcp, [::]:5001->5000/tcp` into container→host ports.
fn parse_ports(raw: &str) -> BTreeMap<u16, u16> {
    raw.split(',')
        .filter_map(|entry| {
            let (host, container) = entry.trim().split_once("->")?;
            let host_port = host.rsplit(':').next()?.parse().ok()?;
            let container_port = container.split('/').next()?.parse().ok()?;
            Some((container_port, host_port))
        })
        .collect()
}

fn parse_ps_output(stdout: &str) -> Result<Vec<ContainerSummary>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let row: PsRow = serde_json::from_str(line)?;
            Ok(ContainerSummary {
                id: row.id,
                name: row.names.split(',').next().unwrap_or_default().to_string(),
                labels: parse_labels(&row.labels),
                running: row.state == "running",
                networks: row
                    .networks
                    .split(',')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(String::from)
                    .collect(),
                ports: parse_ports(&row.ports),
            })
        })
        .collect()
}

#[async_trait]
impl ContainerEngine for CliEngine {
    async fn network_exists(&self, name: &str) -> Result<bool> {
        let filter = format!("name=^{name}$");
        let out = self
            .run(
                "network ls",
                &["network", "ls", "--filter", &filter, "--format", "{{.Name}}"],
                None,
            )
            .await?;
        Ok(out.lines().any(|line| line.trim() == name))
    }

    async fn create_network(&self, name: &str, cidr: Option<String>) -> Result<()> {
        let subnet = cidr.map(|cidr| format!("--subnet={cidr}"));
        let mut args = vec!["network", "create", "--driver", "bridge"];
        if let Some(subnet) = &subnet {
            args.push(subnet);
        }
        args.push(name);
        self.run("network create", &args, None).await.map(|_| ())
    }

    async fn list_containers(&self, labels: Vec<(String, String)>) -> Result<Vec<ContainerSummary>> {
        let filters: Vec<String> = labels
            .iter()
            .map(|(k, v)| format!("label={k}={v}"))
            .collect();
        let mut args = vec!["ps", "-a", "--no-trunc", "--format", "{{json .}}"];
        for filter in &filters {
            args.push("--filter");
            args.push(filter);
        }
        let out = self.run("ps", &args, None).await?;
        parse_ps_output(&out)
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
            "--restart".into(),
            spec.restart.as_flag().into(),
        ];
        for port in &spec.ports {
            args.push("-p".into());
            args.push(format!(
                "{}:{}:{}",
                port.host_ip, port.host_port, port.container_port
            ));
        }
        if let Some(volume) = &spec.volume {
            args.push("-v".into());
            args.push(format!("{}:{}", volume.name, volume.target));
        }
        for (k, v) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{k}={v}"));
        }
        for (k, v) in &spec.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.push(spec.image.clone());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.run("run", &args, None).await.map_err(|e| match e {
            Error::AlreadyExists { kind, .. } => Error::AlreadyExists {
                kind,
                name: spec.name.clone(),
            },
            other => other,
        })?;
        Ok(out.trim().to_string())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.run("start", &["start", name], None).await.map(|_| ())
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<()> {
        self.run("network connect", &["network", "connect", network, container], None)
            .await
            .map(|_| ())
    }

    async fn inspect_state(&self, container: &str) -> Result<ContainerState> {
        let out = self
            .run(
                "inspect",
                &["inspect", "--format", "{{json .State}}", container],
                None,
            )
            .await?;
        let state: InspectState = serde_json::from_str(out.trim())?;
        Ok(ContainerState {
            status: state.status,
            running: state.running,
            restarting: state.restarting,
            exit_code: state.exit_code,
        })
    }

    async fn host_port(&self, container: &str, container_port: u16) -> Result<Option<u16>> {
        let port = format!("{container_port}/tcp");
        let out = match self.run("port", &["port", container, &port], None).await {
            Ok(out) => out,
            Err(Error::Engine { message, .. }) if message.contains("No public port") => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        Ok(out
            .lines()
            .filter_map(|line| line.trim().rsplit(':').next()?.parse().ok())
            .next())
    }

    async fn write_file(&self, container: &str, path: &str, contents: &str) -> Result<()> {
        self.run(
            "exec",
            &[
                "exec",
                "-i",
                container,
                "sh",
                "-c",
                r#"mkdir -p "$(dirname "$1")" && cat > "$1""#,
                "sh",
                path,
            ],
            Some(contents.as_bytes()),
        )
        .await
        .map(|_| ())
    }

    async fn remove_container(&self, container: &str) -> Result<()> {
        self.run("rm", &["rm", "-f", container], None).await.map(|_| ())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.run("volume rm", &["volume", "rm", name], None)
            .await
            .map(|_| ())
    }
}
