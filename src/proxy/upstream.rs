//! Upstream connection and request forwarding
//!
//! Keeps at most one open connection to a backend and reuses it for as long
//! as the backend allows keep-alive.

use std::collections::HashMap;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::http::request::{Method, Request};
use crate::http::response::StatusCode;
use crate::proxy::backend::BackendPool;

/// Default buffer size for streaming
const BUFFER_SIZE: usize = 8192;

/// Upper bound on the response head
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Headers that only describe a single hop and are never forwarded.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("no backends configured")]
    NoBackends,
    #[error("invalid backend URL '{0}'")]
    InvalidUrl(String),
    #[error("backend did not answer in time")]
    Timeout,
    #[error("failed to connect to backend: {0}")]
    Connect(#[source] std::io::Error),
    #[error("backend connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid backend response: {0}")]
    Protocol(String),
}

impl UpstreamError {
    /// Status sent to the client when forwarding fails.
    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            UpstreamError::NoBackends => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

/// A complete response read from a backend.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Whether the backend left the connection open for another request
    pub keep_alive: bool,
}

struct UpstreamConnection {
    backend: usize,
    url: Url,
    stream: TcpStream,
    buffer: BytesMut,
}

/// Handles proxying requests to backend servers
pub struct ProxyHandler {
    pool: BackendPool,
    connect_timeout: Duration,
    request_timeout: Duration,
    connection: Option<UpstreamConnection>,
}

impl ProxyHandler {
    pub fn new(pool: BackendPool, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool,
            connect_timeout,
            request_timeout,
            connection: None,
        }
    }

    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Drops the pooled backend connection, if any.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            tracing::trace!(backend = conn.url.as_str(), "Closing backend connection");
        }
    }

    /// Forwards `request`, reusing the open backend connection when there is one.
    ///
    /// A failure on a reused connection is retried once on a fresh one, since
    /// the backend may have closed it while idle. Fresh connections are tried
    /// once per available backend.
    pub async fn forward(
        &mut self,
        request: &Request,
        forwarded_for: Option<&str>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        if self.pool.is_empty() {
            return Err(UpstreamError::NoBackends);
        }

        if let Some(mut conn) = self.connection.take() {
            match self.exchange(&mut conn, request, forwarded_for).await {
                Ok(response) => {
                    self.pool.mark_success(conn.backend);
                    if response.keep_alive {
                        self.connection = Some(conn);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Reused backend connection failed, reconnecting");
                }
            }
        }

        let attempts = self.pool.available_count().max(1);
        let mut last_error = UpstreamError::NoBackends;

        for attempt in 1..=attempts {
            let Some(index) = self.pool.select() else {
                break;
            };
            let name = self
                .pool
                .get(index)
                .map(|b| b.display_name().to_string())
                .unwrap_or_default();

            tracing::debug!(
                backend = %name,
                attempt,
                method = %request.method,
                path = %request.path,
                "Forwarding request to backend"
            );

            let result = match self.connect(index).await {
                Ok(mut conn) => self
                    .exchange(&mut conn, request, forwarded_for)
                    .await
                    .map(|response| (conn, response)),
                Err(e) => Err(e),
            };

            match result {
                Ok((conn, response)) => {
                    self.pool.mark_success(index);
                    tracing::debug!(
                        backend = %name,
                        status = response.status.as_u16(),
                        "Request forwarded successfully"
                    );
                    if response.keep_alive {
                        self.connection = Some(conn);
                    }
                    return Ok(response);
                }
                Err(e) => {
                    self.pool.mark_failed(index);
                    tracing::warn!(
                        backend = %name,
                        error = %e,
                        attempt,
                        "Failed to proxy request to backend"
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn connect(&self, index: usize) -> Result<UpstreamConnection, UpstreamError> {
        let backend = self.pool.get(index).ok_or(UpstreamError::NoBackends)?;
        let url = Url::parse(&backend.url).map_err(|_| UpstreamError::InvalidUrl(backend.url.clone()))?;
        let host = url
            .host_str()
            .ok_or_else(|| UpstreamError::InvalidUrl(backend.url.clone()))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| UpstreamError::Timeout)?
            .map_err(UpstreamError::Connect)?;

        tracing::trace!(backend = backend.display_name(), "Connected to backend");
        Ok(UpstreamConnection {
            backend: index,
            url,
            stream,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
        })
    }

    async fn exchange(
        &self,
        conn: &mut UpstreamConnection,
        request: &Request,
        forwarded_for: Option<&str>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let bytes = build_http_request(request, &conn.url, forwarded_for);
        let head_only = request.method == Method::HEAD;

        timeout(self.request_timeout, send_and_receive(conn, &bytes, head_only))
            .await
            .map_err(|_| UpstreamError::Timeout)?
    }
}

async fn send_and_receive(
    conn: &mut UpstreamConnection,
    bytes: &[u8],
    head_only: bool,
) -> Result<UpstreamResponse, UpstreamError> {
    conn.stream.write_all(bytes).await?;
    conn.stream.flush().await?;
    read_http_response(&mut conn.stream, &mut conn.buffer, head_only).await
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Case-insensitive lookup in a raw header map.
pub fn find_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Builds the request bytes sent to the backend.
///
/// Hop-by-hop headers are dropped, `Host` names the backend and the
/// client address is appended to `X-Forwarded-For`.
pub fn build_http_request(request: &Request, backend_url: &Url, forwarded_for: Option<&str>) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(512 + request.body.len());

    let target = if request.uri.is_empty() { "/" } else { &request.uri };
    buffer.extend_from_slice(format!("{} {} HTTP/1.1\r\n", request.method, target).as_bytes());

    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .filter(|(k, _)| {
            !is_hop_by_hop(k)
                && !k.eq_ignore_ascii_case("Host")
                && !k.eq_ignore_ascii_case("Content-Length")
                && !k.eq_ignore_ascii_case("X-Forwarded-For")
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if let Some(host) = backend_url.host_str() {
        let host_value = match backend_url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        headers.push(("Host".to_string(), host_value));
    }

    if let Some(client) = forwarded_for {
        let value = match request.header("X-Forwarded-For") {
            Some(existing) => format!("{existing}, {client}"),
            None => client.to_string(),
        };
        headers.push(("X-Forwarded-For".to_string(), value));
    }
    if let Some(host) = request.header("Host") {
        headers.push(("X-Forwarded-Host".to_string(), host.to_string()));
    }

    if !request.body.is_empty() || matches!(request.method, Method::POST | Method::PUT | Method::PATCH) {
        headers.push(("Content-Length".to_string(), request.body.len().to_string()));
    }
    headers.push(("Connection".to_string(), "keep-alive".to_string()));
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    for (key, value) in &headers {
        buffer.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
    }
    buffer.extend_from_slice(b"\r\n");
    buffer.extend_from_slice(&request.body);

    buffer
}

/// Reads one complete HTTP response from `stream`.
///
/// Bytes read past the end of the response stay in `buffer` for the next
/// exchange on the same connection.
pub async fn read_http_response<S>(
    stream: &mut S,
    buffer: &mut BytesMut,
    head_only: bool,
) -> Result<UpstreamResponse, UpstreamError>
where
    S: AsyncRead + Unpin,
{
    let head = loop {
        if let Some(end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break buffer.split_to(end + 4);
        }
        if buffer.len() > MAX_HEAD_SIZE {
            return Err(UpstreamError::Protocol("response headers too large".to_string()));
        }
        fill(stream, buffer).await?;
    };

    let (version, status, headers) = parse_response_head(&head)?;

    let connection = find_header(&headers, "Connection").map(|v| v.to_ascii_lowercase());
    let mut keep_alive = match connection.as_deref() {
        Some(v) if v.contains("close") => false,
        Some(v) if v.contains("keep-alive") => true,
        _ => version == "HTTP/1.1",
    };

    let code = status.as_u16();
    let body = if head_only || (100..200).contains(&code) || code == 204 || code == 304 {
        Vec::new()
    } else if find_header(&headers, "Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        read_chunked(stream, buffer).await?
    } else if let Some(length) = find_header(&headers, "Content-Length") {
        let length = length
            .trim()
            .parse::<usize>()
            .map_err(|_| UpstreamError::Protocol(format!("bad Content-Length '{length}'")))?;
        read_exact(stream, buffer, length).await?
    } else {
        // Delimited by the backend closing the connection.
        keep_alive = false;
        let mut body = buffer.split().to_vec();
        stream.read_to_end(&mut body).await?;
        body
    };

    Ok(UpstreamResponse {
        status,
        headers,
        body,
        keep_alive,
    })
}

/// Parses the status line and header fields of a response head.
pub fn parse_response_head(
    head: &[u8],
) -> Result<(String, StatusCode, HashMap<String, String>), UpstreamError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| UpstreamError::Protocol("response head is not valid UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .ok_or_else(|| UpstreamError::Protocol("empty response".to_string()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(UpstreamError::Protocol(format!("bad status line '{status_line}'")));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(StatusCode::from_u16)
        .ok_or_else(|| UpstreamError::Protocol(format!("bad status line '{status_line}'")))?;

    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_string();
            let value = value.trim();
            headers
                .entry(key)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
    }

    Ok((version.to_string(), status, headers))
}

async fn fill<S: AsyncRead + Unpin>(stream: &mut S, buffer: &mut BytesMut) -> Result<(), UpstreamError> {
    buffer.reserve(BUFFER_SIZE);
    let n = stream.read_buf(buffer).await?;
    if n == 0 {
        return Err(UpstreamError::Protocol(
            "connection closed before complete response received".to_string(),
        ));
    }
    Ok(())
}

async fn read_exact<S: AsyncRead + Unpin>(
    stream: &mut S,
    buffer: &mut BytesMut,
    len: usize,
) -> Result<Vec<u8>, UpstreamError> {
    while buffer.len() < len {
        fill(stream, buffer).await?;
    }
    Ok(buffer.split_to(len).to_vec())
}

async fn read_crlf_line<S: AsyncRead + Unpin>(
    stream: &mut S,
    buffer: &mut BytesMut,
) -> Result<String, UpstreamError> {
    loop {
        if let Some(end) = buffer.windows(2).position(|w| w == b"\r\n") {
            let line = buffer.split_to(end + 2);
            return Ok(String::from_utf8_lossy(&line[..end]).into_owned());
        }
        if buffer.len() > MAX_HEAD_SIZE {
            return Err(UpstreamError::Protocol("chunk header too large".to_string()));
        }
        fill(stream, buffer).await?;
    }
}

async fn read_chunked<S: AsyncRead + Unpin>(
    stream: &mut S,
    buffer: &mut BytesMut,
) -> Result<Vec<u8>, UpstreamError> {
    let mut body = Vec::new();

    loop {
        let line = read_crlf_line(stream, buffer).await?;
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| UpstreamError::Protocol(format!("bad chunk size '{size_field}'")))?;

        if size == 0 {
            // Trailer fields are dropped.
            while !read_crlf_line(stream, buffer).await?.is_empty() {}
            return Ok(body);
        }

        let chunk = read_exact(stream, buffer, size + 2).await?;
        body.extend_from_slice(&chunk[..size]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_chunked_body_and_keeps_leftover() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\n\r\nHTTP/1.1";
        let mut stream = &raw[..];
        let mut buffer = BytesMut::new();

        let response = read_http_response(&mut stream, &mut buffer, false).await.unwrap();

        assert_eq!(response.body, b"hello world");
        assert!(response.keep_alive);
        assert_eq!(&buffer[..], b"HTTP/1.1");
    }

    #[tokio::test]
    async fn close_delimited_body_disables_reuse() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nall of it";
        let mut stream = &raw[..];
        let mut buffer = BytesMut::new();

        let response = read_http_response(&mut stream, &mut buffer, false).await.unwrap();

        assert_eq!(response.body, b"all of it");
        assert!(!response.keep_alive);
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Length: 42\r\nConnection: keep-alive\r\n\r\n";
        let mut stream = &raw[..];
        let mut buffer = BytesMut::new();

        let response = read_http_response(&mut stream, &mut buffer, true).await.unwrap();

        assert!(response.body.is_empty());
        assert!(response.keep_alive);
    }

    #[test]
    fn upstream_errors_map_to_gateway_statuses() {
        assert_eq!(UpstreamError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(UpstreamError::NoBackends.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            UpstreamError::Protocol("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
