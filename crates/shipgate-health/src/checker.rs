//! Health probe logic.
//!
//! Performs one HTTP GET per endpoint and classifies the response. The
//! prober never decides promotion; it only reports what it saw.

use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tracing::{debug, warn};

use shipgate_core::HealthEndpoint;

/// Classification of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Expected status (any 2xx by default) within the latency ceiling.
    Healthy,
    /// Any other status, a slow response, or a refused connection.
    Unhealthy,
    /// No response before the probe timeout.
    UnknownTimeout,
}

impl Classification {
    /// Fail-closed view used by the gate.
    pub fn is_healthy(self) -> bool {
        self == Classification::Healthy
    }
}

/// Result of one probe against one endpoint. Consumed by the gate and
/// discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckResult {
    pub endpoint: String,
    pub status_code: Option<u16>,
    pub latency: Duration,
    pub timestamp: SystemTime,
    pub classification: Classification,
}

impl HealthCheckResult {
    /// A result that did not come from an HTTP probe (a reconciler's health
    /// report, a test script).
    pub fn synthetic(endpoint: impl Into<String>, classification: Classification) -> Self {
        Self {
            endpoint: endpoint.into(),
            status_code: None,
            latency: Duration::ZERO,
            timestamp: SystemTime::now(),
            classification,
        }
    }
}

/// Classify a response that arrived.
///
/// `expected` of `None` accepts any 2xx. A response slower than `ceiling`
/// is unhealthy even when the status matches.
pub fn classify(
    expected: Option<u16>,
    status: u16,
    latency: Duration,
    ceiling: Duration,
) -> Classification {
    let status_ok = match expected {
        Some(code) => status == code,
        None => (200..=299).contains(&status),
    };
    if status_ok && latency < ceiling {
        Classification::Healthy
    } else {
        Classification::Unhealthy
    }
}

/// Something that can check one endpoint.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, endpoint: &HealthEndpoint, timeout: Duration) -> HealthCheckResult;
}

/// Plain-HTTP prober over a fresh hyper http1 connection per probe.
#[derive(Debug, Clone)]
pub struct HttpProber {
    /// Ceiling for endpoints that don't set `max_latency`.
    default_ceiling: Duration,
}

impl HttpProber {
    pub fn new(default_ceiling: Duration) -> Self {
        Self { default_ceiling }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

/// Outcome of the network exchange, before classification.
enum Exchange {
    Status(u16),
    Refused,
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, endpoint: &HealthEndpoint, timeout: Duration) -> HealthCheckResult {
        let started = Instant::now();
        let timestamp = SystemTime::now();
        let ceiling = endpoint.max_latency.unwrap_or(self.default_ceiling);

        let exchange = tokio::time::timeout(timeout, http_get(&endpoint.url)).await;
        let latency = started.elapsed();

        let (status_code, classification) = match exchange {
            Ok(Exchange::Status(code)) => (
                Some(code),
                classify(endpoint.expected_status, code, latency, ceiling),
            ),
            Ok(Exchange::Refused) => (None, Classification::Unhealthy),
            Err(_) => {
                debug!(url = %endpoint.url, ?timeout, "health probe timed out");
                (None, Classification::UnknownTimeout)
            }
        };

        HealthCheckResult {
            endpoint: endpoint.url.clone(),
            status_code,
            latency,
            timestamp,
            classification,
        }
    }
}

/// One GET request. Any failure to get a status line is `Refused`.
async fn http_get(url: &str) -> Exchange {
    let uri: http::Uri = match url.parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(%url, error = %e, "invalid health endpoint url");
            return Exchange::Refused;
        }
    };
    if uri.scheme_str() != Some("http") {
        warn!(%url, "only plain http health endpoints are supported");
        return Exchange::Refused;
    }
    let Some(host) = uri.host() else {
        warn!(%url, "health endpoint url has no host");
        return Exchange::Refused;
    };
    let port = uri.port_u16().unwrap_or(80);
    let address = format!("{host}:{port}");
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let stream = match tokio::net::TcpStream::connect(&address).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, %url, "health probe connection failed");
            return Exchange::Refused;
        }
    };

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, %url, "health probe handshake failed");
            return Exchange::Refused;
        }
    };

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = match http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", address.as_str())
        .header("user-agent", "shipgate-health/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
    {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, %url, "failed to build health probe request");
            return Exchange::Refused;
        }
    };

    match sender.send_request(req).await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if !resp.status().is_success() {
                debug!(status, %url, "health probe non-2xx");
            }
            Exchange::Status(status)
        }
        Err(e) => {
            debug!(error = %e, %url, "health probe request failed");
            Exchange::Refused
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const CEILING: Duration = Duration::from_secs(2);

    /// Serve one canned status line to every connection.
    async fn serve(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}/healthz")
    }

    #[test]
    fn classify_2xx_under_ceiling_is_healthy() {
        let fast = Duration::from_millis(20);
        assert_eq!(classify(None, 200, fast, CEILING), Classification::Healthy);
        assert_eq!(classify(None, 204, fast, CEILING), Classification::Healthy);
    }

    #[test]
    fn classify_other_status_is_unhealthy() {
        let fast = Duration::from_millis(20);
        assert_eq!(classify(None, 301, fast, CEILING), Classification::Unhealthy);
        assert_eq!(classify(None, 503, fast, CEILING), Classification::Unhealthy);
    }

    #[test]
    fn classify_slow_success_is_unhealthy() {
        assert_eq!(
            classify(None, 200, Duration::from_secs(3), CEILING),
            Classification::Unhealthy
        );
        // The ceiling itself is already too slow.
        assert_eq!(classify(None, 200, CEILING, CEILING), Classification::Unhealthy);
    }

    #[test]
    fn classify_exact_expected_status() {
        let fast = Duration::from_millis(5);
        assert_eq!(classify(Some(204), 204, fast, CEILING), Classification::Healthy);
        assert_eq!(classify(Some(204), 200, fast, CEILING), Classification::Unhealthy);
    }

    #[test]
    fn unknown_timeout_is_not_healthy() {
        assert!(!Classification::UnknownTimeout.is_healthy());
        assert!(!Classification::Unhealthy.is_healthy());
        assert!(Classification::Healthy.is_healthy());
    }

    #[tokio::test]
    async fn http_probe_ok() {
        let url = serve("200 OK").await;
        let result = HttpProber::default()
            .probe(&HealthEndpoint::new(url.clone()), Duration::from_secs(2))
            .await;
        assert_eq!(result.classification, Classification::Healthy);
        assert_eq!(result.status_code, Some(200));
        assert_eq!(result.endpoint, url);
    }

    #[tokio::test]
    async fn http_probe_server_error() {
        let url = serve("503 Service Unavailable").await;
        let result = HttpProber::default()
            .probe(&HealthEndpoint::new(url), Duration::from_secs(2))
            .await;
        assert_eq!(result.classification, Classification::Unhealthy);
        assert_eq!(result.status_code, Some(503));
    }

    #[tokio::test]
    async fn http_probe_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = HttpProber::default()
            .probe(
                &HealthEndpoint::new(format!("http://{addr}/healthz")),
                Duration::from_secs(2),
            )
            .await;
        assert_eq!(result.classification, Classification::Unhealthy);
        assert_eq!(result.status_code, None);
    }

    #[tokio::test]
    async fn http_probe_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold connections open without answering.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let result = HttpProber::default()
            .probe(
                &HealthEndpoint::new(format!("http://{addr}/healthz")),
                Duration::from_millis(200),
            )
            .await;
        assert_eq!(result.classification, Classification::UnknownTimeout);
    }

    #[tokio::test]
    async fn https_endpoint_is_rejected() {
        let result = HttpProber::default()
            .probe(
                &HealthEndpoint::new("https://example.invalid/healthz"),
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(result.classification, Classification::Unhealthy);
    }
}
