//! Allow/deny access control.
//!
//! A rule matches when every one of its params (server variable name to
//! regex) matches. A request is let through when at least one allow rule
//! matches, or there are no allow rules, and no deny rule matches.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::config::{AccessConfig, AccessKind};
use crate::context::{RequestContext, ServerContext};
use crate::error::{ConfigError, RequestError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::module::virtual_host::{HostScoped, current_vhost};
use crate::module::{Hook, Module};

#[derive(Debug, Clone)]
pub struct AccessRule {
    kind: AccessKind,
    params: Vec<(String, Regex)>,
}

impl AccessRule {
    pub fn compile(config: &AccessConfig) -> Result<Self, ConfigError> {
        let params = config
            .params
            .iter()
            .map(|(name, pattern)| {
                Regex::new(pattern)
                    .map(|re| (name.clone(), re))
                    .map_err(|source| ConfigError::InvalidPattern {
                        pattern: pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            kind: config.kind,
            params,
        })
    }

    pub fn matches(&self, ctx: &RequestContext) -> bool {
        self.params
            .iter()
            .all(|(name, re)| re.is_match(ctx.server_var(name).unwrap_or("")))
    }
}

/// Decides whether `rules` let the request through.
pub fn is_permitted(rules: &[AccessRule], ctx: &RequestContext) -> bool {
    let mut allows = rules.iter().filter(|r| r.kind == AccessKind::Allow).peekable();
    let allowed = allows.peek().is_none() || allows.any(|r| r.matches(ctx));

    let denied = rules
        .iter()
        .filter(|r| r.kind == AccessKind::Deny)
        .any(|r| r.matches(ctx));

    allowed && !denied
}

#[derive(Default)]
pub struct AccessModule {
    rules: HostScoped<AccessRule>,
}

impl AccessModule {
    pub const NAME: &'static str = "access";
}

#[async_trait]
impl Module for AccessModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self, server: Arc<ServerContext>) -> Result<(), ConfigError> {
        self.rules = HostScoped::build(
            &server.config.access,
            &server.config.virtual_hosts,
            |v| v.access.as_slice(),
            AccessRule::compile,
        )?;
        Ok(())
    }

    async fn process(
        &mut self,
        _request: &mut Request,
        _response: &mut Response,
        ctx: &mut RequestContext,
        hook: Hook,
    ) -> Result<(), RequestError> {
        if hook != Hook::RequestPost {
            return Ok(());
        }

        let rules = self.rules.select(current_vhost(ctx));
        if rules.is_empty() || is_permitted(rules, ctx) {
            return Ok(());
        }

        tracing::debug!(
            remote = ctx.server_var(crate::context::vars::REMOTE_ADDR).unwrap_or("-"),
            "Access denied"
        );
        Err(RequestError::forbidden(
            "You don't have permission to access this resource",
        ))
    }
}
