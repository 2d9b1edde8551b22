//! CLI commands

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

pub mod chart;
pub mod create;
pub mod delete;
pub mod kind_utils;
pub mod registries;
pub mod update;

/// Run an external tool, returning its stdout.
///
/// `env` is applied to the child only. A non-zero exit becomes
/// `Error::CommandFailed` carrying stderr, so transient network failures
/// stay recognisable to the retry classifier.
pub async fn run_tool(
    binary: &str,
    args: &[&str],
    env: &[(&'static str, String)],
    stdin: Option<&[u8]>,
) -> Result<String> {
    debug!(tool = %binary, ?args, "Running command");

    let mut child = Command::new(binary)
        .args(args)
        .kill_on_drop(true)
        .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::command_failed(format!("failed to run {binary}: {e}")))?;

    // Reap the child before surfacing a stdin write error
    let written = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => pipe.write_all(input).await,
        _ => Ok(()),
    };

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::command_failed(format!(
            "{} {} failed: {}",
            binary,
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    written?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
