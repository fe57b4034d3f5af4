//! The `proxy` handler: forwards requests to HTTP backends.
//!
//! The upstream connection outlives the request that opened it. When a
//! backend closes it or an exchange fails, `should_disconnect` is raised and
//! the connection is dropped at `RESPONSE_POST`, or at the latest before the
//! next request is forwarded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::{RequestContext, ServerContext, vars};
use crate::error::{ConfigError, RequestError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::module::static_file::CoreModule;
use crate::module::{Hook, Module};
use crate::proxy::upstream::{HOP_BY_HOP_HEADERS, UpstreamResponse};
use crate::proxy::{BackendPool, ProxyHandler};

pub const PROXY_HANDLER: &str = "proxy";

#[derive(Default)]
pub struct ProxyModule {
    handler: Option<ProxyHandler>,
    should_disconnect: bool,
}

impl ProxyModule {
    pub const NAME: &'static str = "proxy";

    pub fn is_connected(&self) -> bool {
        self.handler.as_ref().is_some_and(|h| h.is_connected())
    }

    fn disconnect(&mut self) {
        if let Some(handler) = &mut self.handler {
            handler.disconnect();
        }
        self.should_disconnect = false;
    }
}

/// Copies a backend response into the client response, minus hop-by-hop headers.
pub fn apply_upstream_response(upstream: UpstreamResponse, response: &mut Response) {
    response.set_status(upstream.status);
    for (name, value) in upstream.headers {
        if HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(&name))
            || name.eq_ignore_ascii_case("Content-Length")
        {
            continue;
        }
        response.set_header(name, value);
    }
    response.set_body(upstream.body);
}

#[async_trait]
impl Module for ProxyModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[CoreModule::NAME]
    }

    fn init(&mut self, server: Arc<ServerContext>) -> Result<(), ConfigError> {
        let proxy = &server.config.proxy;
        for backend in &proxy.backends {
            url::Url::parse(&backend.url).map_err(|e| ConfigError::InvalidRule {
                rule: backend.url.clone(),
                reason: format!("invalid backend URL: {e}"),
            })?;
        }

        self.handler = (!proxy.backends.is_empty()).then(|| {
            ProxyHandler::new(
                BackendPool::new(proxy.backends.clone()),
                Duration::from_secs(proxy.connect_timeout_secs),
                Duration::from_secs(proxy.request_timeout_secs),
            )
        });
        Ok(())
    }

    async fn process(
        &mut self,
        request: &mut Request,
        response: &mut Response,
        ctx: &mut RequestContext,
        hook: Hook,
    ) -> Result<(), RequestError> {
        match hook {
            Hook::RequestPost => {}
            Hook::ResponsePost => {
                if self.should_disconnect {
                    self.disconnect();
                }
                return Ok(());
            }
            Hook::Shutdown => {
                self.disconnect();
                return Ok(());
            }
            _ => return Ok(()),
        }

        if self.should_disconnect {
            self.disconnect();
        }

        if ctx.server_var(vars::SERVER_HANDLER) != Some(PROXY_HANDLER) {
            return Ok(());
        }

        let Some(handler) = &mut self.handler else {
            return Err(RequestError::with_status(
                crate::http::response::StatusCode::SERVICE_UNAVAILABLE,
                "No backend servers are configured",
            ));
        };

        match handler.forward(request, ctx.server_var(vars::REMOTE_ADDR)).await {
            Ok(upstream) => {
                self.should_disconnect = !upstream.keep_alive;
                apply_upstream_response(upstream, response);
                response.dispatch();
                Ok(())
            }
            Err(e) => {
                self.should_disconnect = true;
                tracing::error!(error = %e, path = %request.path, "Proxy request failed");
                Err(RequestError::with_status(e.status(), e.to_string()))
            }
        }
    }
}
