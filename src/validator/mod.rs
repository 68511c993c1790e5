//! Proxy validation.
//!
//! Probes a candidate endpoint before any OS state is touched:
//! TCP reachability, SOCKS5 handshake and authentication with an end-to-end
//! CONNECT, an optional HTTP round trip through the proxy and UDP ASSOCIATE
//! support. Only reachability and authentication are fatal.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use thiserror::Error as ThisError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::ValidationConfig;
use crate::error::{Error, Result};
use crate::protocol::http::{self, HttpRequest, HttpResponse, HttpUrl};
use crate::protocol::socks5::{self, TargetAddr, UdpAssociate};
use crate::types::{ProxyEndpoint, ProxyKind, ValidationReport};

/// Per-call probe options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidateOptions {
    pub skip_http_probe: bool,
}

/// A fatal validation error plus the partial report produced before it.
#[derive(Debug, ThisError)]
#[error("{error}")]
pub struct ValidationFailure {
    #[source]
    pub error: Error,
    pub report: ValidationReport,
}

impl ValidationFailure {
    fn new(error: Error, mut report: ValidationReport) -> Self {
        report.errors.push(error.to_string());
        Self { error, report }
    }
}

/// Something that can judge a proxy endpoint.
#[async_trait]
pub trait EndpointValidator: Send + Sync {
    async fn validate(
        &self,
        endpoint: &ProxyEndpoint,
        opts: ValidateOptions,
    ) -> std::result::Result<ValidationReport, ValidationFailure>;
}

/// Validator that probes over the network.
#[derive(Debug, Clone)]
pub struct ProxyValidator {
    config: ValidationConfig,
}

impl ProxyValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    fn connect_budget(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout_secs)
    }

    async fn open(&self, endpoint: &ProxyEndpoint) -> Result<TcpStream> {
        let budget = self.connect_budget();
        let stream = timeout(
            budget,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| {
            Error::validation(format!(
                "Proxy {} did not accept a connection within {}s",
                endpoint.authority(),
                budget.as_secs()
            ))
        })?
        .map_err(|e| {
            Error::validation(format!("Cannot reach proxy {}: {e}", endpoint.authority()))
        })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// SOCKS5 CONNECT to the probe host and read one HTTP status line back.
    async fn socks5_round_trip(&self, stream: &mut TcpStream, endpoint: &ProxyEndpoint) -> Result<()> {
        let host = self.config.probe_host.as_str();
        let target = TargetAddr::domain(host, self.config.probe_port);
        socks5::connect(stream, &target).await?;

        let request = HttpRequest::get("/")
            .header("User-Agent", crate::USER_AGENT)
            .build(host);
        stream.write_all(&request).await?;

        let mut line = String::new();
        let mut reader = BufReader::new(stream);
        timeout(self.connect_budget(), reader.read_line(&mut line))
            .await
            .map_err(|_| {
                Error::validation(format!("No response from {host} through {}", endpoint.authority()))
            })??;
        if !line.starts_with("HTTP/") {
            return Err(Error::validation(format!(
                "Unexpected response from {host} through proxy: {}",
                line.trim()
            )));
        }
        debug!(status = %line.trim(), "SOCKS5 end-to-end probe succeeded");
        Ok(())
    }

    /// GET the echo endpoint through the proxy.
    async fn http_probe(&self, endpoint: &ProxyEndpoint) -> Result<HttpResponse> {
        let url = HttpUrl::parse(&self.config.echo_url)?;
        let mut stream = self.open(endpoint).await?;
        let work = async {
            match endpoint.kind {
                ProxyKind::Socks5 => {
                    socks5::handshake(&mut stream, endpoint.credentials()).await?;
                    socks5::connect(&mut stream, &TargetAddr::domain(url.host.clone(), url.port))
                        .await?;
                    let request = HttpRequest::get(&url.path)
                        .header("User-Agent", crate::USER_AGENT)
                        .build(&url.host_header());
                    http::exchange(&mut stream, &request).await
                }
                ProxyKind::Http => {
                    let request = absolute_form_request(&url, endpoint);
                    http::exchange(&mut stream, &request).await
                }
            }
        };
        timeout(self.connect_budget() * 2, work)
            .await
            .map_err(|_| Error::timeout(format!("GET {url} through proxy"), self.connect_budget() * 2))?
    }

    async fn udp_probe(&self, endpoint: &ProxyEndpoint) -> Result<UdpAssociate> {
        if endpoint.kind == ProxyKind::Http {
            return Ok(UdpAssociate::Unsupported(
                "HTTP proxies cannot relay UDP".to_string(),
            ));
        }
        let mut stream = self.open(endpoint).await?;
        let work = async {
            socks5::handshake(&mut stream, endpoint.credentials()).await?;
            socks5::udp_associate(&mut stream).await
        };
        timeout(self.connect_budget(), work)
            .await
            .map_err(|_| Error::timeout("UDP ASSOCIATE probe", self.connect_budget()))?
    }

    fn record_udp(report: &mut ValidationReport, outcome: Result<UdpAssociate>) {
        match outcome {
            Ok(UdpAssociate::Supported(relay)) => {
                debug!(relay = ?relay, "UDP ASSOCIATE supported");
                report.udp_associate_supported = true;
            }
            Ok(UdpAssociate::Unsupported(reason)) => report.warnings.push(format!(
                "UDP ASSOCIATE not supported ({reason}); session will run TCP-only"
            )),
            Err(e) => report.warnings.push(format!(
                "UDP ASSOCIATE probe failed ({e}); session will run TCP-only"
            )),
        }
    }
}

#[async_trait]
impl EndpointValidator for ProxyValidator {
    async fn validate(
        &self,
        endpoint: &ProxyEndpoint,
        opts: ValidateOptions,
    ) -> std::result::Result<ValidationReport, ValidationFailure> {
        let mut report = ValidationReport::default();

        if let Err(e) = endpoint.validate() {
            return Err(ValidationFailure::new(e, report));
        }

        let started = Instant::now();
        let mut stream = match self.open(endpoint).await {
            Ok(stream) => stream,
            Err(e) => return Err(ValidationFailure::new(e, report)),
        };
        report.tcp_reachable = true;
        report.resolved_address = stream.peer_addr().ok();
        debug!(proxy = %endpoint, addr = ?report.resolved_address, "TCP connection established");

        let skip_http = opts.skip_http_probe || self.config.skip_http_probe;

        match endpoint.kind {
            ProxyKind::Socks5 => {
                let handshake = timeout(
                    self.connect_budget(),
                    socks5::handshake(&mut stream, endpoint.credentials()),
                )
                .await
                .unwrap_or_else(|_| Err(Error::timeout("SOCKS5 handshake", self.connect_budget())));
                if let Err(e) = handshake {
                    return Err(ValidationFailure::new(e, report));
                }
                report.authenticated = true;

                if let Err(e) = self.socks5_round_trip(&mut stream, endpoint).await {
                    return Err(ValidationFailure::new(e, report));
                }
                report.latency = started.elapsed();
                drop(stream);

                let http = async {
                    if skip_http {
                        None
                    } else {
                        Some(self.http_probe(endpoint).await)
                    }
                };
                let (http, udp) = tokio::join!(http, self.udp_probe(endpoint));

                match http {
                    Some(Ok(resp)) if resp.is_success() => report.http_round_trip_ok = true,
                    Some(Ok(resp)) => report.warnings.push(format!(
                        "HTTP probe through proxy returned status {}",
                        resp.status_code
                    )),
                    Some(Err(e)) => report.warnings.push(format!("HTTP probe through proxy failed: {e}")),
                    None => {}
                }
                Self::record_udp(&mut report, udp);
            }
            ProxyKind::Http => {
                drop(stream);
                if skip_http {
                    report.authenticated = true;
                    report
                        .warnings
                        .push("HTTP probe skipped; proxy credentials were not verified".to_string());
                } else {
                    match self.http_probe(endpoint).await {
                        Ok(resp) if resp.status_code == 407 => {
                            let e = Error::validation(
                                "Proxy authentication failed (407 Proxy Authentication Required)",
                            );
                            return Err(ValidationFailure::new(e, report));
                        }
                        Ok(resp) => {
                            report.authenticated = true;
                            if resp.is_success() {
                                report.http_round_trip_ok = true;
                            } else {
                                report.warnings.push(format!(
                                    "HTTP probe through proxy returned status {}",
                                    resp.status_code
                                ));
                            }
                        }
                        Err(e) => {
                            // Some proxies restrict destinations; reachability already holds.
                            report.authenticated = true;
                            report
                                .warnings
                                .push(format!("HTTP probe through proxy failed: {e}"));
                        }
                    }
                }
                report.latency = started.elapsed();
                Self::record_udp(&mut report, self.udp_probe(endpoint).await);
            }
        }

        for warning in &report.warnings {
            warn!(proxy = %endpoint, "{}", warning);
        }
        info!(
            proxy = %endpoint,
            latency_ms = report.latency.as_millis() as u64,
            udp = report.udp_associate_supported,
            "Proxy validated"
        );
        Ok(report)
    }
}

fn absolute_form_request(url: &HttpUrl, endpoint: &ProxyEndpoint) -> bytes::Bytes {
    let mut request = HttpRequest::get(&url.to_string())
        .header("User-Agent", crate::USER_AGENT)
        .header("Accept", "*/*");
    if let Some((user, pass)) = endpoint.credentials() {
        let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        request = request.header("Proxy-Authorization", &format!("Basic {token}"));
    }
    request.build(&url.host_header())
}

/// Validate with exponential backoff (2^attempt seconds) on retriable errors.
pub async fn validate_with_retry(
    validator: &dyn EndpointValidator,
    endpoint: &ProxyEndpoint,
    opts: ValidateOptions,
    attempts: u32,
) -> std::result::Result<ValidationReport, ValidationFailure> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match validator.validate(endpoint, opts).await {
            Ok(report) => return Ok(report),
            Err(failure) if attempt < attempts && failure.error.is_retriable() => {
                let backoff = Duration::from_secs(1 << attempt);
                warn!(
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    error = %failure.error,
                    "Proxy validation failed, retrying"
                );
                sleep(backoff).await;
                attempt += 1;
            }
            Err(failure) => return Err(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[derive(Clone, Copy)]
    struct MockSocks {
        credentials: Option<(&'static str, &'static str)>,
        udp: bool,
    }

    async fn serve_socks(mut sock: TcpStream, mock: MockSocks) -> std::io::Result<()> {
        let mut head = [0u8; 2];
        sock.read_exact(&mut head).await?;
        let mut methods = vec![0u8; head[1] as usize];
        sock.read_exact(&mut methods).await?;

        if let Some((user, pass)) = mock.credentials {
            sock.write_all(&[5, 2]).await?;
            let mut ver_len = [0u8; 2];
            sock.read_exact(&mut ver_len).await?;
            let mut u = vec![0u8; ver_len[1] as usize];
            sock.read_exact(&mut u).await?;
            let mut plen = [0u8; 1];
            sock.read_exact(&mut plen).await?;
            let mut p = vec![0u8; plen[0] as usize];
            sock.read_exact(&mut p).await?;
            let ok = u == user.as_bytes() && p == pass.as_bytes();
            sock.write_all(&[1, if ok { 0 } else { 1 }]).await?;
            if !ok {
                return Ok(());
            }
        } else {
            sock.write_all(&[5, 0]).await?;
        }

        let mut req = [0u8; 4];
        sock.read_exact(&mut req).await?;
        match req[3] {
            1 => {
                let mut rest = [0u8; 6];
                sock.read_exact(&mut rest).await?;
            }
            3 => {
                let mut len = [0u8; 1];
                sock.read_exact(&mut len).await?;
                let mut rest = vec![0u8; len[0] as usize + 2];
                sock.read_exact(&mut rest).await?;
            }
            _ => return Ok(()),
        }

        if req[1] == 3 {
            let code = if mock.udp { 0 } else { 7 };
            sock.write_all(&[5, code, 0, 1, 127, 0, 0, 1, 0x13, 0x88]).await?;
            return Ok(());
        }

        sock.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
        let mut buf = vec![0u8; 1024];
        let mut seen = Vec::new();
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = sock.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            seen.extend_from_slice(&buf[..n]);
        }
        sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\n\r\n203.0.113.50")
            .await?;
        Ok(())
    }

    async fn spawn_socks(mock: MockSocks) -> (u16, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicU32::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_socks(sock, mock));
            }
        });
        (port, accepted)
    }

    async fn spawn_http_proxy(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = sock.read(&mut buf).await;
                    let resp = format!("{status_line}\r\nContent-Length: 0\r\n\r\n");
                    let _ = sock.write_all(resp.as_bytes()).await;
                });
            }
        });
        port
    }

    fn validator() -> ProxyValidator {
        ProxyValidator::new(ValidationConfig {
            connect_timeout_secs: 2,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = ProxyEndpoint::new("127.0.0.1", port, ProxyKind::Socks5);
        let failure = validator()
            .validate(&endpoint, ValidateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, Error::Validation(_)));
        assert!(!failure.report.tcp_reachable);
        assert!(!failure.report.permits_mutation());
        assert_eq!(failure.report.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_socks5_without_udp_is_tcp_only() {
        let (port, _) = spawn_socks(MockSocks {
            credentials: None,
            udp: false,
        })
        .await;
        let endpoint = ProxyEndpoint::new("127.0.0.1", port, ProxyKind::Socks5);
        let report = validator()
            .validate(&endpoint, ValidateOptions::default())
            .await
            .unwrap();

        assert!(report.tcp_reachable);
        assert!(report.authenticated);
        assert!(report.http_round_trip_ok);
        assert!(!report.udp_associate_supported);
        assert!(report.errors.is_empty());
        assert!(report.warnings.iter().any(|w| w.contains("TCP-only")));
        assert_eq!(report.udp_mode(), crate::types::UdpMode::TcpOnly);
    }

    #[tokio::test]
    async fn test_socks5_credentials() {
        let mock = MockSocks {
            credentials: Some(("alice", "s3cret")),
            udp: true,
        };
        let (port, _) = spawn_socks(mock).await;

        let good = ProxyEndpoint::new("127.0.0.1", port, ProxyKind::Socks5)
            .with_credentials("alice", "s3cret");
        let report = validator()
            .validate(&good, ValidateOptions { skip_http_probe: true })
            .await
            .unwrap();
        assert!(report.udp_associate_supported);
        assert!(!report.http_round_trip_ok);

        let bad = ProxyEndpoint::new("127.0.0.1", port, ProxyKind::Socks5)
            .with_credentials("alice", "wrong");
        let failure = validator()
            .validate(&bad, ValidateOptions::default())
            .await
            .unwrap_err();
        assert!(failure.report.tcp_reachable);
        assert!(!failure.report.authenticated);
        assert!(failure.error.to_string().contains("authentication failed"));
    }

    #[tokio::test]
    async fn test_http_proxy_407_is_fatal() {
        let port = spawn_http_proxy("HTTP/1.1 407 Proxy Authentication Required").await;
        let endpoint = ProxyEndpoint::new("127.0.0.1", port, ProxyKind::Http)
            .with_credentials("bob", "nope");
        let failure = validator()
            .validate(&endpoint, ValidateOptions::default())
            .await
            .unwrap_err();
        assert!(failure.report.tcp_reachable);
        assert!(!failure.report.authenticated);
    }

    #[tokio::test]
    async fn test_http_proxy_restricted_destination_is_warning() {
        let port = spawn_http_proxy("HTTP/1.1 403 Forbidden").await;
        let endpoint = ProxyEndpoint::new("127.0.0.1", port, ProxyKind::Http);
        let report = validator()
            .validate(&endpoint, ValidateOptions::default())
            .await
            .unwrap();
        assert!(report.authenticated);
        assert!(!report.http_round_trip_ok);
        assert!(!report.udp_associate_supported);
        assert_eq!(report.warnings.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_endpoint_makes_no_connection() {
        let (port, accepted) = spawn_socks(MockSocks {
            credentials: None,
            udp: false,
        })
        .await;
        let mut endpoint = ProxyEndpoint::new("127.0.0.1", port, ProxyKind::Socks5);
        endpoint.username = Some("half".into());

        let failure = validator()
            .validate(&endpoint, ValidateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, Error::Configuration(_)));
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    struct Flaky {
        calls: AtomicU32,
        error: fn() -> Error,
    }

    #[async_trait]
    impl EndpointValidator for Flaky {
        async fn validate(
            &self,
            _endpoint: &ProxyEndpoint,
            _opts: ValidateOptions,
        ) -> std::result::Result<ValidationReport, ValidationFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ValidationFailure::new((self.error)(), ValidationReport::default()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backs_off_on_retriable_errors() {
        let flaky = Flaky {
            calls: AtomicU32::new(0),
            error: || Error::validation("connection reset"),
        };
        let endpoint = ProxyEndpoint::new("203.0.113.9", 1080, ProxyKind::Socks5);

        let started = tokio::time::Instant::now();
        let result = validate_with_retry(&flaky, &endpoint, ValidateOptions::default(), 2).await;
        assert!(result.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(2));

        let config_error = Flaky {
            calls: AtomicU32::new(0),
            error: || Error::config("bad port"),
        };
        let _ = validate_with_retry(&config_error, &endpoint, ValidateOptions::default(), 2).await;
        assert_eq!(config_error.calls.load(Ordering::SeqCst), 1);
    }
}
