//! Helm chart installation
//!
//! Every add-on (cert-manager, CNI, policy engines, ...) is the same
//! sequence: fetch the repository, install or upgrade the release, remove
//! it, list the images it pulls. [`ChartInstaller`] captures that once and
//! [`ChartSpec`] carries the per-chart parameters.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kindling_common::{retry_transient, RetryConfig};

use crate::commands::run_tool;
use crate::{Error, Result};

/// One chart release to manage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChartSpec {
    /// Release name
    pub release: String,
    /// Chart name within the repository
    pub chart: String,
    /// Target namespace
    pub namespace: String,
    /// Chart repository URL (`https://...` or `oci://...`)
    pub repo_url: String,
    /// Chart version; latest if unset
    pub version: Option<String>,
    /// `--set` values
    pub values: BTreeMap<String, String>,
}

impl ChartSpec {
    /// Whether the repository is an OCI registry (no `helm repo add` needed)
    pub fn is_oci(&self) -> bool {
        self.repo_url.starts_with("oci://")
    }

    /// Local name the repository is added under
    pub fn repo_name(&self) -> String {
        format!("kindling-{}", self.release)
    }

    /// Chart reference passed to helm
    pub fn chart_ref(&self) -> String {
        if self.is_oci() {
            format!("{}/{}", self.repo_url.trim_end_matches('/'), self.chart)
        } else {
            format!("{}/{}", self.repo_name(), self.chart)
        }
    }
}

/// Install, remove and inspect chart releases.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChartInstaller: Send + Sync {
    /// Install the release, or upgrade it if it exists
    async fn install(&self, cancel: &CancellationToken, chart: &ChartSpec) -> Result<()>;

    /// Remove a release; a missing release is not an error
    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()>;

    /// Images referenced by the chart's rendered manifests, sorted
    async fn list_images(&self, cancel: &CancellationToken, chart: &ChartSpec)
        -> Result<Vec<String>>;
}

/// [`ChartInstaller`] backed by the helm CLI.
#[derive(Debug, Clone)]
pub struct HelmInstaller {
    binary: String,
    kube_context: Option<String>,
    retry: RetryConfig,
}

impl HelmInstaller {
    /// Installer targeting `kube_context` (current context if `None`)
    pub fn new(kube_context: Option<String>) -> Self {
        Self {
            binary: "helm".to_string(),
            kube_context,
            retry: RetryConfig::default(),
        }
    }

    /// Use a different helm binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Override the retry policy for repository fetches
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn context_args(&self, args: &mut Vec<String>) {
        if let Some(context) = &self.kube_context {
            args.push("--kube-context".to_string());
            args.push(context.clone());
        }
    }

    fn install_args(&self, chart: &ChartSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "upgrade".into(),
            "--install".into(),
            chart.release.clone(),
            chart.chart_ref(),
            "--namespace".into(),
            chart.namespace.clone(),
            "--create-namespace".into(),
            "--wait".into(),
        ];
        chart_value_args(chart, &mut args);
        self.context_args(&mut args);
        args
    }

    fn template_args(&self, chart: &ChartSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "template".into(),
            chart.release.clone(),
            chart.chart_ref(),
            "--namespace".into(),
            chart.namespace.clone(),
        ];
        chart_value_args(chart, &mut args);
        args
    }

    async fn helm(&self, args: &[String]) -> Result<String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_tool(&self.binary, &args, &[], None).await
    }

    /// Retry transient failures of a network-facing helm call.
    async fn helm_with_retry(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        args: &[String],
    ) -> Result<String> {
        retry_transient(&self.retry, cancel, operation, || self.helm(args)).await
    }

    async fn add_repo(&self, cancel: &CancellationToken, chart: &ChartSpec) -> Result<()> {
        if chart.is_oci() {
            return Ok(());
        }
        let args = vec![
            "repo".to_string(),
            "add".to_string(),
            chart.repo_name(),
            chart.repo_url.clone(),
            "--force-update".to_string(),
        ];
        self.helm_with_retry(cancel, "helm repo add", &args).await?;
        Ok(())
    }
}

fn chart_value_args(chart: &ChartSpec, args: &mut Vec<String>) {
    if let Some(version) = &chart.version {
        args.push("--version".to_string());
        args.push(version.clone());
    }
    for (key, value) in &chart.values {
        args.push("--set".to_string());
        args.push(format!("{key}={value}"));
    }
}

/// Collect `image:` references from rendered manifests.
pub fn parse_images(manifests: &str) -> Vec<String> {
    manifests
        .lines()
        .filter_map(|line| line.trim().trim_start_matches("- ").strip_prefix("image:"))
        .map(|image| image.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|image| !image.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[async_trait]
impl ChartInstaller for HelmInstaller {
    async fn install(&self, cancel: &CancellationToken, chart: &ChartSpec) -> Result<()> {
        self.add_repo(cancel, chart).await?;

        info!(release = %chart.release, chart = %chart.chart_ref(), namespace = %chart.namespace, "Installing chart");
        self.helm_with_retry(cancel, "helm upgrade --install", &self.install_args(chart))
            .await?;
        info!(release = %chart.release, "Chart installed");
        Ok(())
    }

    async fn uninstall(&self, release: &str, namespace: &str) -> Result<()> {
        let mut args = vec![
            "uninstall".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
        ];
        self.context_args(&mut args);

        match self.helm(&args).await {
            Ok(_) => {
                info!(release = %release, namespace = %namespace, "Chart uninstalled");
                Ok(())
            }
            Err(Error::CommandFailed { message }) if message.contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_images(
        &self,
        cancel: &CancellationToken,
        chart: &ChartSpec,
    ) -> Result<Vec<String>> {
        self.add_repo(cancel, chart).await?;
        let rendered = self
            .helm_with_retry(cancel, "helm template", &self.template_args(chart))
            .await?;
        Ok(parse_images(&rendered))
    }
}
