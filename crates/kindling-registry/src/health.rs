//! Registry readiness polling
//!
//! Polls a registry's root endpoint on a fixed interval until it answers
//! with 2xx (or 401 for registries that require auth), the timeout
//! elapses, or the caller cancels. Repeated connection refusals trigger a
//! crash check so a dead container fails fast instead of running out the
//! clock.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use kindling_common::{Error, Result};

/// Total time allowed for a registry to become ready
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between probes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Timeout for a single probe request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Consecutive connection refusals before checking whether the container died
pub const CONSECUTIVE_REFUSED_THRESHOLD: u32 = 5;

/// Readiness polling parameters
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Total time allowed
    pub timeout: Duration,
    /// Delay between probes
    pub interval: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Refusals in a row before the crash check runs
    pub refused_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_READY_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refused_threshold: CONSECUTIVE_REFUSED_THRESHOLD,
        }
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Success-class status
    Ready,
    /// TCP connection refused
    Refused,
    /// Registry answered with a non-ready status
    Status(u16),
    /// Any other transport failure (timeout, reset, ...)
    Failed(String),
}

/// Success-class statuses: any 2xx, or 401 from an auth-protected registry.
pub fn is_ready_status(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::UNAUTHORIZED
}

/// Whether a request error was a refused TCP connection.
pub fn is_connection_refused(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = e.source();
    }
    err.is_connect() && err.to_string().to_lowercase().contains("connection refused")
}

/// Issue one GET against `url`.
pub async fn probe(client: &reqwest::Client, url: &str, request_timeout: Duration) -> Probe {
    match client.get(url).timeout(request_timeout).send().await {
        Ok(resp) if is_ready_status(resp.status()) => Probe::Ready,
        Ok(resp) => Probe::Status(resp.status().as_u16()),
        Err(e) if is_connection_refused(&e) => Probe::Refused,
        Err(e) => Probe::Failed(e.to_string()),
    }
}

/// Poll `url` until the registry at `host` is ready.
///
/// `crashed` is consulted after every `refused_threshold` consecutive
/// refusals; if it reports the container has exited the wait fails
/// immediately with [`Error::NotReady`].
///
/// On timeout, returns [`Error::UnexpectedStatus`] if the last probe got an
/// HTTP answer and [`Error::NotReady`] otherwise. Cancellation returns
/// [`Error::HealthCheckCancelled`].
pub async fn wait_until_ready<F, Fut>(
    client: &reqwest::Client,
    config: &HealthCheckConfig,
    cancel: &CancellationToken,
    host: &str,
    url: &str,
    mut crashed: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<String>>>,
{
    let deadline = Instant::now() + config.timeout;
    let mut consecutive_refused = 0u32;
    let mut last_status: Option<u16> = None;
    let mut last_reason = "no probe completed".to_string();

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::HealthCheckCancelled { host: host.to_string() });
            }
            outcome = probe(client, url, config.request_timeout) => outcome,
        };
        debug!(registry = %host, probe = ?outcome, "Probed registry");

        match outcome {
            Probe::Ready => return Ok(()),
            Probe::Refused => {
                last_status = None;
                last_reason = "connection refused".to_string();
                consecutive_refused += 1;
                if consecutive_refused >= config.refused_threshold {
                    consecutive_refused = 0;
                    if let Some(reason) = crashed().await? {
                        return Err(Error::NotReady {
                            host: host.to_string(),
                            timeout: config.timeout,
                            reason,
                        });
                    }
                }
            }
            Probe::Status(status) => {
                consecutive_refused = 0;
                last_status = Some(status);
                last_reason = format!("unexpected status {status}");
            }
            Probe::Failed(reason) => {
                consecutive_refused = 0;
                last_status = None;
                last_reason = reason;
            }
        }

        if Instant::now() + config.interval > deadline {
            return Err(match last_status {
                Some(status) => Error::UnexpectedStatus {
                    host: host.to_string(),
                    status,
                },
                None => Error::NotReady {
                    host: host.to_string(),
                    timeout: config.timeout,
                    reason: last_reason,
                },
            });
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::HealthCheckCancelled { host: host.to_string() });
            }
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `status_line` to every connection on a loopback port.
    pub(crate) async fn serve_status(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        port
    }

    /// A loopback port with nothing listening.
    pub(crate) async fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    pub(crate) fn fast_config() -> HealthCheckConfig {
        HealthCheckConfig {
            timeout: Duration::from_secs(2),
            interval: Duration::from_millis(20),
            request_timeout: Duration::from_millis(500),
            refused_threshold: CONSECUTIVE_REFUSED_THRESHOLD,
        }
    }

    pub(crate) fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    fn never_crashed() -> impl FnMut() -> std::future::Ready<Result<Option<String>>> {
        || std::future::ready(Ok(None))
    }

    #[test]
    fn ready_statuses() {
        assert!(is_ready_status(StatusCode::OK));
        assert!(is_ready_status(StatusCode::NO_CONTENT));
        assert!(is_ready_status(StatusCode::UNAUTHORIZED));
        assert!(!is_ready_status(StatusCode::FORBIDDEN));
        assert!(!is_ready_status(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn ok_status_is_ready() {
        let port = serve_status("200 OK").await;
        let url = format!("http://127.0.0.1:{port}/");
        wait_until_ready(
            &client(),
            &fast_config(),
            &CancellationToken::new(),
            "docker.io",
            &url,
            never_crashed(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn unauthorized_counts_as_ready() {
        let port = serve_status("401 Unauthorized").await;
        let url = format!("http://127.0.0.1:{port}/");
        let client = client();
        assert_eq!(probe(&client, &url, Duration::from_secs(1)).await, Probe::Ready);
    }

    #[tokio::test]
    async fn persistent_error_status_times_out_as_unexpected_status() {
        let port = serve_status("503 Service Unavailable").await;
        let url = format!("http://127.0.0.1:{port}/");
        let config = HealthCheckConfig {
            timeout: Duration::from_millis(200),
            ..fast_config()
        };

        let err = wait_until_ready(
            &client(),
            &config,
            &CancellationToken::new(),
            "quay.io",
            &url,
            never_crashed(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::UnexpectedStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        let port = refused_port().await;
        let url = format!("http://127.0.0.1:{port}/");
        let client = client();
        assert_eq!(probe(&client, &url, Duration::from_secs(1)).await, Probe::Refused);
    }

    #[tokio::test]
    async fn crashed_container_fails_fast() {
        let port = refused_port().await;
        let url = format!("http://127.0.0.1:{port}/");
        let checks = Arc::new(AtomicU32::new(0));
        let c = checks.clone();
        let config = HealthCheckConfig {
            timeout: Duration::from_secs(30),
            interval: Duration::from_millis(10),
            ..fast_config()
        };

        let start = std::time::Instant::now();
        let err = wait_until_ready(
            &client(),
            &config,
            &CancellationToken::new(),
            "docker.io",
            &url,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok(Some("container exited with code 1".to_string())))
            },
        )
        .await
        .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(checks.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::NotReady { reason, .. } if reason.contains("exited")));
    }

    #[tokio::test]
    async fn alive_container_keeps_polling_until_timeout() {
        let port = refused_port().await;
        let url = format!("http://127.0.0.1:{port}/");
        let checks = Arc::new(AtomicU32::new(0));
        let c = checks.clone();
        let config = HealthCheckConfig {
            timeout: Duration::from_millis(300),
            interval: Duration::from_millis(10),
            ..fast_config()
        };

        let err = wait_until_ready(
            &client(),
            &config,
            &CancellationToken::new(),
            "docker.io",
            &url,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok(None))
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::NotReady { .. }));
        assert!(checks.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn cancellation_is_distinct_from_timeout() {
        let port = refused_port().await;
        let url = format!("http://127.0.0.1:{port}/");
        let token = CancellationToken::new();
        token.cancel();

        let err = wait_until_ready(
            &client(),
            &fast_config(),
            &token,
            "ghcr.io",
            &url,
            never_crashed(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::HealthCheckCancelled { host } if host == "ghcr.io"));
    }
}
