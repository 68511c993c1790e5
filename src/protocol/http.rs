//! Minimal HTTP/1.1 client codec.
//!
//! Used for the through-proxy round trip, the egress IP echo services and
//! the trace endpoint. Only plain `http://` URLs are supported.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Upper bound for any response we are willing to buffer.
const MAX_RESPONSE_SIZE: usize = 256 * 1024;

/// HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers (lower-case names).
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Check if the response indicates success (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Get a header value (case-insensitive).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|v| v.as_str())
    }

    /// Body as trimmed text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }
}

/// A parsed `http://host[:port]/path` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl HttpUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| Error::config(format!("Only http:// URLs are supported: {url}")))?;
        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(Error::config(format!("URL has no host: {url}")));
        }

        let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
            // [v6]:port
            let end = stripped
                .find(']')
                .ok_or_else(|| Error::config(format!("Unterminated IPv6 host: {url}")))?;
            let host = &stripped[..end];
            let port = match stripped[end + 1..].strip_prefix(':') {
                Some(p) => parse_port(p, url)?,
                None => 80,
            };
            (host.to_string(), port)
        } else if let Some((host, port)) = authority.rsplit_once(':') {
            (host.to_string(), parse_port(port, url)?)
        } else {
            (authority.to_string(), 80)
        };

        Ok(Self {
            host,
            port,
            path: path.to_string(),
        })
    }

    /// Host header value.
    pub fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == 80 {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for HttpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}{}", self.host_header(), self.path)
    }
}

fn parse_port(p: &str, url: &str) -> Result<u16> {
    p.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| Error::config(format!("Invalid port in URL: {url}")))
}

/// HTTP request builder.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: String,
    /// Request target (origin-form path or absolute-form URL).
    pub target: String,
    /// Request headers, in insertion order.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Bytes,
}

impl HttpRequest {
    /// Create a new GET request.
    pub fn get(target: &str) -> Self {
        Self {
            method: "GET".to_string(),
            target: target.to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Set a header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Build the HTTP request bytes.
    pub fn build(&self, host: &str) -> Bytes {
        use std::fmt::Write;

        let mut request = String::with_capacity(256);

        // Request line; writing to a String cannot fail.
        let _ = write!(request, "{} {} HTTP/1.1\r\n", self.method, self.target);
        let _ = write!(request, "Host: {}\r\n", host);

        let connection = self
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Connection"))
            .map(|(_, v)| v.as_str())
            .unwrap_or("close");
        let _ = write!(request, "Connection: {}\r\n", connection);

        for (key, value) in &self.headers {
            if !key.eq_ignore_ascii_case("Connection") && !key.eq_ignore_ascii_case("Content-Length")
            {
                let _ = write!(request, "{}: {}\r\n", key, value);
            }
        }

        if !self.body.is_empty() {
            let _ = write!(request, "Content-Length: {}\r\n", self.body.len());
        }
        request.push_str("\r\n");

        let mut buf = BytesMut::with_capacity(request.len() + self.body.len());
        buf.extend_from_slice(request.as_bytes());
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }
}

/// HTTP response codec (streaming parser).
#[derive(Debug, Default)]
pub struct HttpCodec {
    state: CodecState,
    buffer: BytesMut,
    body: BytesMut,
    status_code: u16,
    headers: HashMap<String, String>,
}

#[derive(Debug, Default)]
enum CodecState {
    #[default]
    StatusLine,
    Headers,
    Body {
        content_length: usize,
    },
    ChunkSize,
    ChunkData {
        remaining: usize,
    },
    ChunkTrailer,
    /// No framing: body runs until the peer closes.
    UntilClose,
    Complete,
}

impl HttpCodec {
    /// Create a new HTTP codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the codec for a new response.
    pub fn reset(&mut self) {
        self.state = CodecState::StatusLine;
        self.buffer.clear();
        self.body.clear();
        self.status_code = 0;
        self.headers.clear();
    }

    /// Feed data into the codec.
    ///
    /// Returns `Some(HttpResponse)` when a complete response is parsed.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<HttpResponse>> {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() + self.body.len() > MAX_RESPONSE_SIZE {
            return Err(Error::protocol("HTTP response too large"));
        }

        loop {
            match &self.state {
                CodecState::StatusLine => {
                    let Some(pos) = self.find_crlf() else {
                        return Ok(None);
                    };
                    let line = self.take_line(pos);
                    self.parse_status_line(&line)?;
                    self.state = CodecState::Headers;
                }
                CodecState::Headers => {
                    let Some(pos) = self.find_crlf() else {
                        return Ok(None);
                    };
                    if pos == 0 {
                        // Empty line - end of headers
                        self.buffer.advance(2);
                        self.state = self.body_state();
                    } else {
                        let line = self.take_line(pos);
                        self.parse_header(&line);
                    }
                }
                CodecState::Body { content_length } => {
                    let content_length = *content_length;
                    if self.buffer.len() < content_length {
                        return Ok(None);
                    }
                    let chunk = self.buffer.split_to(content_length);
                    self.body.extend_from_slice(&chunk);
                    return Ok(Some(self.complete()));
                }
                CodecState::ChunkSize => {
                    let Some(pos) = self.find_crlf() else {
                        return Ok(None);
                    };
                    let line = self.take_line(pos);
                    let size_str = line.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| Error::protocol(format!("Bad chunk size: {size_str}")))?;
                    self.state = if size == 0 {
                        CodecState::ChunkTrailer
                    } else {
                        CodecState::ChunkData { remaining: size }
                    };
                }
                CodecState::ChunkData { remaining } => {
                    let remaining = *remaining;
                    // Chunk payload plus its trailing CRLF.
                    if self.buffer.len() < remaining + 2 {
                        return Ok(None);
                    }
                    let chunk = self.buffer.split_to(remaining);
                    self.body.extend_from_slice(&chunk);
                    self.buffer.advance(2);
                    self.state = CodecState::ChunkSize;
                }
                CodecState::ChunkTrailer => {
                    let Some(pos) = self.find_crlf() else {
                        return Ok(None);
                    };
                    let line = self.take_line(pos);
                    if line.is_empty() {
                        return Ok(Some(self.complete()));
                    }
                }
                CodecState::UntilClose => {
                    let rest = self.buffer.split();
                    self.body.extend_from_slice(&rest);
                    return Ok(None);
                }
                CodecState::Complete => {
                    return Ok(None);
                }
            }
        }
    }

    /// Signal end of stream. Completes close-delimited responses.
    pub fn finish(&mut self) -> Result<HttpResponse> {
        match self.state {
            CodecState::UntilClose => {
                let rest = self.buffer.split();
                self.body.extend_from_slice(&rest);
                Ok(self.complete())
            }
            CodecState::StatusLine if self.buffer.is_empty() => {
                Err(Error::protocol("Connection closed before any response"))
            }
            _ => Err(Error::protocol("Connection closed mid-response")),
        }
    }

    /// Status code of the response being parsed, once the status line is in.
    pub fn status_code(&self) -> Option<u16> {
        match self.state {
            CodecState::StatusLine => None,
            _ => Some(self.status_code),
        }
    }

    fn body_state(&self) -> CodecState {
        // 1xx, 204 and 304 never carry a body.
        if (100..200).contains(&self.status_code) || self.status_code == 204 || self.status_code == 304 {
            return CodecState::Body { content_length: 0 };
        }
        let chunked = self
            .headers
            .get("transfer-encoding")
            .is_some_and(|v| v.to_lowercase().contains("chunked"));
        if chunked {
            return CodecState::ChunkSize;
        }
        match self.headers.get("content-length").and_then(|v| v.parse().ok()) {
            Some(content_length) => CodecState::Body { content_length },
            None => CodecState::UntilClose,
        }
    }

    fn complete(&mut self) -> HttpResponse {
        self.state = CodecState::Complete;
        HttpResponse {
            status_code: self.status_code,
            headers: std::mem::take(&mut self.headers),
            body: self.body.split().freeze(),
        }
    }

    /// Find position of \r\n in buffer.
    fn find_crlf(&self) -> Option<usize> {
        self.buffer.windows(2).position(|w| w == b"\r\n")
    }

    /// Take a line from the buffer (excluding \r\n).
    fn take_line(&mut self, pos: usize) -> String {
        let line = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
        self.buffer.advance(pos + 2);
        line
    }

    /// Parse the status line.
    fn parse_status_line(&mut self, line: &str) -> Result<()> {
        // "HTTP/1.1 200 OK"
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or("");
        if !version.starts_with("HTTP/") {
            return Err(Error::protocol(format!("Not an HTTP response: {line}")));
        }
        self.status_code = parts
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| Error::protocol(format!("Bad status line: {line}")))?;
        Ok(())
    }

    /// Parse a header line.
    fn parse_header(&mut self, line: &str) {
        if let Some(pos) = line.find(':') {
            let key = line[..pos].trim().to_lowercase();
            let value = line[pos + 1..].trim().to_string();
            self.headers.insert(key, value);
        }
    }
}

/// Send `request` over `stream` and read one response.
pub async fn exchange<S>(stream: &mut S, request: &[u8]) -> Result<HttpResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(request).await?;
    stream.flush().await?;

    let mut codec = HttpCodec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return codec.finish();
        }
        if let Some(response) = codec.feed(&buf[..n])? {
            return Ok(response);
        }
    }
}

/// Plain GET against `url` over a fresh TCP connection.
pub async fn get(url: &HttpUrl, budget: Duration) -> Result<HttpResponse> {
    let work = async {
        let mut stream = TcpStream::connect((url.host.as_str(), url.port)).await?;
        stream.set_nodelay(true)?;
        let request = HttpRequest::get(&url.path)
            .header("User-Agent", crate::USER_AGENT)
            .header("Accept", "*/*")
            .build(&url.host_header());
        exchange(&mut stream, &request).await
    };
    timeout(budget, work)
        .await
        .map_err(|_| Error::timeout(format!("GET {url}"), budget))?
}

/// Fetches a URL and returns the response body as text.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_text(&self, url: &str, budget: Duration) -> Result<String>;
}

/// Fetcher over the host network stack (through the tunnel once connected).
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectFetcher;

#[async_trait]
impl Fetcher for DirectFetcher {
    async fn fetch_text(&self, url: &str, budget: Duration) -> Result<String> {
        let url = HttpUrl::parse(url)?;
        let response = get(&url, budget).await?;
        if !response.is_success() {
            return Err(Error::protocol(format!(
                "GET {url} returned {}",
                response.status_code
            )));
        }
        Ok(response.text())
    }
}

/// Canned bodies keyed by URL; unknown URLs fail.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct CannedFetcher {
    bodies: parking_lot::Mutex<std::collections::HashMap<String, String>>,
    calls: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl CannedFetcher {
    pub(crate) fn with(self, url: &str, body: &str) -> Self {
        self.set(url, body);
        self
    }

    pub(crate) fn set(&self, url: &str, body: &str) {
        self.bodies.lock().insert(url.to_string(), body.to_string());
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.lock().len()
    }
}

#[cfg(test)]
#[async_trait]
impl Fetcher for CannedFetcher {
    async fn fetch_text(&self, url: &str, _budget: Duration) -> Result<String> {
        self.calls.lock().push(url.to_string());
        self.bodies
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::protocol(format!("connection refused: {url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_request_build() {
        let request = HttpRequest::get("http://api.ipify.org/")
            .header("Proxy-Authorization", "Basic abc")
            .header("Connection", "close");

        let bytes = request.build("api.ipify.org");
        let text = String::from_utf8_lossy(&bytes);

        assert!(text.starts_with("GET http://api.ipify.org/ HTTP/1.1\r\n"));
        assert!(text.contains("Host: api.ipify.org\r\n"));
        assert!(text.contains("Proxy-Authorization: Basic abc\r\n"));
        assert_eq!(text.matches("Connection:").count(), 1);
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_http_codec_parse() {
        let mut codec = HttpCodec::new();

        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let response = codec.feed(response).unwrap().unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body.as_ref(), b"hello");
    }

    #[test]
    fn test_http_codec_streaming() {
        let mut codec = HttpCodec::new();

        assert!(codec.feed(b"HTTP/1.1 200 OK\r\n").unwrap().is_none());
        assert_eq!(codec.status_code(), Some(200));
        assert!(codec.feed(b"Content-Length: 5\r\n").unwrap().is_none());
        assert!(codec.feed(b"\r\n").unwrap().is_none());
        assert!(codec.feed(b"hel").unwrap().is_none());

        let result = codec.feed(b"lo").unwrap();
        assert_eq!(result.unwrap().body.as_ref(), b"hello");
    }

    #[test]
    fn test_http_codec_chunked() {
        let mut codec = HttpCodec::new();
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\n203.\r\n8\r\n0.113.77\r\n0\r\n\r\n";
        let response = codec.feed(raw).unwrap().unwrap();
        assert_eq!(response.text(), "203.0.113.77");
    }

    #[test]
    fn test_http_codec_until_close() {
        let mut codec = HttpCodec::new();
        assert!(codec
            .feed(b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nip=198.51")
            .unwrap()
            .is_none());
        assert!(codec.feed(b".100.2\n").unwrap().is_none());
        let response = codec.finish().unwrap();
        assert_eq!(response.text(), "ip=198.51.100.2");
    }

    #[test]
    fn test_http_codec_rejects_garbage() {
        let mut codec = HttpCodec::new();
        assert!(codec.feed(b"SSH-2.0-OpenSSH\r\n").is_err());
    }

    #[test]
    fn test_url_parse() {
        let url = HttpUrl::parse("http://1.1.1.1/cdn-cgi/trace").unwrap();
        assert_eq!(url.host, "1.1.1.1");
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/cdn-cgi/trace");

        let url = HttpUrl::parse("http://example.com:8080").unwrap();
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/");
        assert_eq!(url.host_header(), "example.com:8080");

        let url = HttpUrl::parse("http://[::1]:81/x").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.to_string(), "http://[::1]:81/x");

        assert!(HttpUrl::parse("https://example.com/").is_err());
        assert!(HttpUrl::parse("http://host:0/").is_err());
    }

    #[tokio::test]
    async fn test_exchange_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let n = server.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("GET /ip HTTP/1.1"));
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\n1.2.3.4")
                .await
                .unwrap();
        });

        let request = HttpRequest::get("/ip").build("echo.test");
        let response = exchange(&mut client, &request).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.text(), "1.2.3.4");
        server_task.await.unwrap();
    }
}
