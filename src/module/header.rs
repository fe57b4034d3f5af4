use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::config::HeaderConfig;
use crate::context::{RequestContext, ServerContext, vars};
use crate::error::{ConfigError, RequestError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::module::{Hook, Module};

struct HeaderRule {
    name: String,
    value: String,
    uri: Option<Regex>,
    override_existing: bool,
}

/// Adds configured headers to every outgoing response.
#[derive(Default)]
pub struct HeaderModule {
    rules: Vec<HeaderRule>,
}

impl HeaderModule {
    pub const NAME: &'static str = "header";
}

#[async_trait]
impl Module for HeaderModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self, server: Arc<ServerContext>) -> Result<(), ConfigError> {
        self.rules = server
            .config
            .headers
            .iter()
            .map(|h: &HeaderConfig| {
                let uri = h
                    .uri
                    .as_deref()
                    .map(|pattern| {
                        Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                            pattern: pattern.to_string(),
                            source,
                        })
                    })
                    .transpose()?;
                Ok(HeaderRule {
                    name: h.name.clone(),
                    value: h.value.clone(),
                    uri,
                    override_existing: h.override_existing,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(())
    }

    async fn process(
        &mut self,
        request: &mut Request,
        response: &mut Response,
        ctx: &mut RequestContext,
        hook: Hook,
    ) -> Result<(), RequestError> {
        if hook != Hook::ResponsePre {
            return Ok(());
        }

        let uri = ctx.server_var(vars::REQUEST_URI).unwrap_or(&request.path);
        for rule in &self.rules {
            if rule.uri.as_ref().is_some_and(|re| !re.is_match(uri)) {
                continue;
            }
            if rule.override_existing || !response.has_header(&rule.name) {
                response.set_header(rule.name.clone(), rule.value.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn module(headers: Vec<HeaderConfig>) -> HeaderModule {
        let config = Config {
            headers,
            ..Config::default()
        };
        let mut module = HeaderModule::default();
        module.init(ServerContext::new(config)).unwrap();
        module
    }

    #[tokio::test]
    async fn respects_override_and_uri_filter() {
        let mut module = module(vec![
            HeaderConfig {
                name: "X-Frame-Options".into(),
                value: "DENY".into(),
                uri: None,
                override_existing: false,
            },
            HeaderConfig {
                name: "Cache-Control".into(),
                value: "no-store".into(),
                uri: Some("^/admin".into()),
                override_existing: true,
            },
        ]);
        let mut request = Request::default();
        let mut ctx = RequestContext::default();
        ctx.set_server_var(vars::REQUEST_URI, "/public/app.js");
        let mut response = Response::new();
        response.set_header("x-frame-options", "SAMEORIGIN");

        module
            .process(&mut request, &mut response, &mut ctx, Hook::ResponsePre)
            .await
            .unwrap();

        assert_eq!(response.header("X-Frame-Options"), Some("SAMEORIGIN"));
        assert!(!response.has_header("Cache-Control"));

        ctx.set_server_var(vars::REQUEST_URI, "/admin/users");
        module
            .process(&mut request, &mut response, &mut ctx, Hook::ResponsePre)
            .await
            .unwrap();
        assert_eq!(response.header("Cache-Control"), Some("no-store"));
    }
}
