use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::config::ServerConfig;
use crate::context::{RequestContext, ServerContext, vars};
use crate::error::{HandlerError, RequestError, TransportError};
use crate::http::error_page;
use crate::http::parser::{
    RequestLine, decode_form, multipart_boundary, parse_content_length, parse_header_line,
    parse_multipart, parse_request_line,
};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::socket::LineSocket;
use crate::http::writer::{ResponseWriter, http_date, serialize_response};
use crate::module::{Hook, ModulePipeline};
use crate::server::access_log;
use crate::server::worker::WorkerHandle;

/// Upper bound on header lines per request.
pub const MAX_HEADERS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    ReadStartLine,
    ReadHeaders,
    ReadBody,
    Dispatching,
    Dispatched,
    Error,
    SendResponse,
    KeepAlive,
    Closed,
}

enum Iteration {
    KeepAlive,
    Close,
}

/// Drives one client connection through the request lifecycle.
///
/// Request, response and context are created once and reset for every
/// keep-alive iteration. The module pipeline belongs to the worker and is
/// only borrowed for the lifetime of the connection.
pub struct ConnectionHandler<'a> {
    server: Arc<ServerContext>,
    pipeline: &'a mut ModulePipeline,
    request: Request,
    response: Response,
    ctx: RequestContext,
    state: ConnectionState,
}

impl<'a> ConnectionHandler<'a> {
    pub fn new(server: Arc<ServerContext>, pipeline: &'a mut ModulePipeline) -> Self {
        let ctx = RequestContext::new(&server);
        Self {
            server,
            pipeline,
            request: Request::default(),
            response: Response::new(),
            ctx,
            state: ConnectionState::Idle,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        tracing::trace!(from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    /// Serves requests until keep-alive ends, then closes the socket.
    ///
    /// A panic inside request processing is trapped here: the client gets a
    /// best-effort 500, modules see `SHUTDOWN` and `worker` is asked to
    /// respawn.
    pub async fn handle<S>(mut self, mut socket: LineSocket<S>, worker: &WorkerHandle)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let started = Instant::now();
        let mut remaining = self.server.config.server.keep_alive_max;

        loop {
            let iteration = AssertUnwindSafe(self.serve_one(&mut socket, started, &mut remaining))
                .catch_unwind()
                .await;

            match iteration {
                Ok(Iteration::KeepAlive) => continue,
                Ok(Iteration::Close) => break,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    self.recover(&mut socket, worker, &message).await;
                    break;
                }
            }
        }

        self.transition(ConnectionState::Closed);
        socket.close().await;
    }

    async fn serve_one<S>(
        &mut self,
        socket: &mut LineSocket<S>,
        started: Instant,
        remaining: &mut u32,
    ) -> Iteration
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.request.reset();
        self.response.reset();
        self.ctx.reset();
        self.transition(ConnectionState::Idle);

        let peer = socket.peer();
        self.ctx.set_server_var(vars::REMOTE_ADDR, peer.ip().to_string());
        self.ctx.set_server_var(vars::REMOTE_PORT, peer.port().to_string());

        let mut keep_alive = false;
        match self.process(socket, started, remaining, &mut keep_alive).await {
            Ok(()) => self.transition(ConnectionState::Dispatched),
            Err(HandlerError::Transport(e)) => {
                tracing::debug!(%peer, error = %e, "Dropping connection");
                return Iteration::Close;
            }
            Err(HandlerError::Request(e)) => {
                self.transition(ConnectionState::Error);
                self.render_error(&e).await;
            }
        }

        if let Err(e) = self.send(socket, keep_alive).await {
            tracing::debug!(%peer, error = %e, "Failed to send response");
            return Iteration::Close;
        }

        access_log::record(&peer.ip().to_string(), &self.request, &self.response);

        if keep_alive {
            self.transition(ConnectionState::KeepAlive);
            Iteration::KeepAlive
        } else {
            Iteration::Close
        }
    }

    /// Reads one request and runs it through `REQUEST_PRE` and `REQUEST_POST`.
    async fn process<S>(
        &mut self,
        socket: &mut LineSocket<S>,
        started: Instant,
        remaining: &mut u32,
        keep_alive: &mut bool,
    ) -> Result<(), HandlerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let server = Arc::clone(&self.server);
        let limits = &server.config.server;

        self.pipeline
            .fire(Hook::RequestPre, &mut self.request, &mut self.response, &mut self.ctx)
            .await?;

        self.transition(ConnectionState::ReadStartLine);
        let mut line = socket
            .read_line(limits.max_request_line, limits.read_timeout())
            .await?;
        if line.is_empty() {
            line = socket
                .read_line(limits.max_request_line, limits.read_timeout())
                .await?;
        }
        let RequestLine {
            method,
            uri,
            version,
        } = parse_request_line(&line).map_err(RequestError::from)?;
        self.request.method = method;
        self.request.set_uri(uri);
        self.request.version = version;

        self.transition(ConnectionState::ReadHeaders);
        self.read_headers(socket, limits).await?;

        let length =
            parse_content_length(self.request.header("Content-Length")).map_err(RequestError::from)?;
        if length > limits.max_body_size {
            return Err(RequestError::max_size_exceeded(length, limits.max_body_size).into());
        }

        *keep_alive = self.request.keep_alive()
            && *remaining > 0
            && started.elapsed() < limits.keep_alive_timeout();
        if *keep_alive {
            *remaining -= 1;
            self.response.set_header("Connection", "keep-alive");
            self.response.set_header(
                "Keep-Alive",
                format!(
                    "timeout={}, max={}",
                    limits.keep_alive_timeout_secs, *remaining
                ),
            );
        }

        decode_form(self.request.query.as_bytes(), &mut self.request.params);

        if length > 0 {
            self.transition(ConnectionState::ReadBody);
            self.request.body = socket.read_body(length, limits.read_timeout()).await?;
            self.parse_body()?;
        }

        self.populate_server_vars();

        self.transition(ConnectionState::Dispatching);
        self.pipeline
            .fire(Hook::RequestPost, &mut self.request, &mut self.response, &mut self.ctx)
            .await?;

        if !self.response.is_dispatched() {
            return Err(RequestError::not_dispatched().into());
        }
        Ok(())
    }

    async fn read_headers<S>(
        &mut self,
        socket: &mut LineSocket<S>,
        limits: &ServerConfig,
    ) -> Result<(), HandlerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        for _ in 0..=MAX_HEADERS {
            let line = socket
                .read_line(limits.max_request_line, limits.read_timeout())
                .await?;
            if line.is_empty() {
                return Ok(());
            }

            let (name, value) = parse_header_line(&line).map_err(RequestError::from)?;
            self.request.append_header(name, value);
        }

        Err(RequestError::bad_request(format!("More than {MAX_HEADERS} header lines")).into())
    }

    fn parse_body(&mut self) -> Result<(), RequestError> {
        let content_type = self.request.header("Content-Type").unwrap_or_default();

        if let Some(boundary) = multipart_boundary(content_type) {
            parse_multipart(
                &self.request.body,
                &boundary,
                &mut self.request.params,
                &mut self.request.parts,
            )?;
        } else if content_type.is_empty()
            || content_type
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded")
        {
            decode_form(&self.request.body, &mut self.request.params);
        }
        Ok(())
    }

    fn populate_server_vars(&mut self) {
        let ctx = &mut self.ctx;
        let request = &self.request;

        ctx.set_server_var(vars::SERVER_PROTOCOL, request.version.clone());
        ctx.set_server_var(vars::REQUEST_METHOD, request.method.as_str());
        ctx.set_server_var(vars::REQUEST_URI, request.uri.clone());
        ctx.set_server_var(vars::X_REQUEST_URI, request.path.clone());
        ctx.set_server_var(vars::QUERY_STRING, request.query.clone());

        if let Some(host) = request.header("Host") {
            let (name, port) = split_host(host);
            ctx.set_server_var(vars::SERVER_NAME, name);
            if let Some(port) = port {
                ctx.set_server_var(vars::SERVER_PORT, port);
            }
        }

        for (name, value) in &request.headers {
            let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
            ctx.set_server_var(key, value.clone());
        }
    }

    async fn render_error(&mut self, err: &RequestError) {
        if err.status.as_u16() >= 500 {
            tracing::error!(status = err.status.as_u16(), error = %err.message, uri = %self.request.uri, "Request failed");
        } else {
            tracing::debug!(status = err.status.as_u16(), error = %err.message, uri = %self.request.uri, "Request rejected");
        }

        let limits = &self.server.config.server;
        let template = match &limits.error_page_template {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(template) => Some(template),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Error page template unavailable");
                    None
                }
            },
            None => None,
        };

        let (body, content_type) = error_page::render(
            template.as_deref(),
            err.status,
            &err.message,
            &limits.signature,
        );
        self.apply_error_page(err.status, body, content_type);
    }

    fn apply_error_page(&mut self, status: StatusCode, body: String, content_type: &str) {
        for header in ["Content-Encoding", "Content-Length", "Last-Modified", "Content-Type"] {
            self.response.remove_header(header);
        }
        self.response.set_status(status);
        self.response.set_header("Content-Type", content_type);
        self.response.set_body(body);
        self.response.dispatch();
    }

    async fn send<S>(&mut self, socket: &mut LineSocket<S>, keep_alive: bool) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.transition(ConnectionState::SendResponse);

        if let Err(e) = self
            .pipeline
            .fire(Hook::ResponsePre, &mut self.request, &mut self.response, &mut self.ctx)
            .await
        {
            self.transition(ConnectionState::Error);
            self.render_error(&e).await;
        }

        self.finalize_headers(keep_alive);
        let head_only = self.request.method == Method::HEAD;
        ResponseWriter::new(&self.response, head_only)
            .write_to_stream(socket.stream_mut())
            .await
            .map_err(TransportError::from_io)?;

        if let Err(e) = self
            .pipeline
            .fire(Hook::ResponsePost, &mut self.request, &mut self.response, &mut self.ctx)
            .await
        {
            tracing::warn!(%e, "Module failed after sending the response");
        }
        Ok(())
    }

    fn finalize_headers(&mut self, keep_alive: bool) {
        let response = &mut self.response;
        let limits = &self.server.config.server;

        response.set_header("Date", http_date(SystemTime::now()));
        response.set_header("Server", error_page::sanitize_signature(&limits.signature));

        let code = response.status.as_u16();
        if (100..200).contains(&code) || code == 204 || code == 304 {
            response.remove_header("Content-Length");
        } else {
            let length = response.body.len();
            response.set_header("Content-Length", length.to_string());
            if !response.has_header("Content-Type") {
                response.set_header("Content-Type", "text/html");
            }
        }

        if !keep_alive {
            response.remove_header("Keep-Alive");
            response.set_header("Connection", "close");
        }
    }

    async fn recover<S>(&mut self, socket: &mut LineSocket<S>, worker: &WorkerHandle, message: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        tracing::error!(
            worker = worker.id(),
            peer = %socket.peer(),
            panic = %message,
            "Request processing panicked"
        );

        self.transition(ConnectionState::Error);
        self.response.reset();
        let (body, content_type) = error_page::render(
            None,
            StatusCode::INTERNAL_SERVER_ERROR,
            "The server encountered an internal error",
            &self.server.config.server.signature,
        );
        self.apply_error_page(StatusCode::INTERNAL_SERVER_ERROR, body, content_type);
        self.finalize_headers(false);

        if let Err(e) = socket.write_all(&serialize_response(&self.response, false)).await {
            tracing::debug!(error = %e, "Could not flush error response");
        }

        let shutdown = AssertUnwindSafe(self.pipeline.fire(
            Hook::Shutdown,
            &mut self.request,
            &mut self.response,
            &mut self.ctx,
        ))
        .catch_unwind()
        .await;
        match shutdown {
            Ok(Err(e)) => tracing::warn!(%e, "Module failed during shutdown"),
            Err(_) => tracing::error!("Module panicked during shutdown"),
            Ok(Ok(())) => {}
        }

        worker.shutdown();
    }
}

/// Splits a `Host` header into name and optional port, keeping IPv6 brackets.
pub fn split_host(host: &str) -> (&str, Option<&str>) {
    let host = host.trim();
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => {
                let port = host[end + 1..].strip_prefix(':').filter(|p| !p.is_empty());
                (&host[..=end], port)
            }
            None => (host, None),
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            (name, Some(port))
        }
        _ => (host, None),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_handles_ports_and_ipv6() {
        assert_eq!(split_host("example.com"), ("example.com", None));
        assert_eq!(split_host("example.com:8080"), ("example.com", Some("8080")));
        assert_eq!(split_host("[::1]:443"), ("[::1]", Some("443")));
        assert_eq!(split_host("[::1]"), ("[::1]", None));
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
