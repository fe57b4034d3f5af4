use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RewriteConfig;
use crate::context::{RequestContext, ServerContext, vars};
use crate::error::{ConfigError, RequestError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::module::virtual_host::{HostScoped, current_vhost};
use crate::module::{Hook, Module};
use crate::rewrite::RewriteEngine;

/// Runs the rewrite engine over global and virtual host rules.
#[derive(Default)]
pub struct RewriteModule {
    rules: HostScoped<RewriteConfig>,
    engine: RewriteEngine,
}

impl RewriteModule {
    pub const NAME: &'static str = "rewrite";
}

#[async_trait]
impl Module for RewriteModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self, server: Arc<ServerContext>) -> Result<(), ConfigError> {
        let config = &server.config;
        self.rules = HostScoped::build(
            &config.rewrites,
            &config.virtual_hosts,
            |v| v.rewrites.as_slice(),
            |r| Ok::<_, ConfigError>(r.clone()),
        )?;

        RewriteEngine::validate(&config.rewrites)?;
        for vhost in &config.virtual_hosts {
            RewriteEngine::validate(&vhost.rewrites)?;
        }
        Ok(())
    }

    async fn process(
        &mut self,
        _request: &mut Request,
        response: &mut Response,
        ctx: &mut RequestContext,
        hook: Hook,
    ) -> Result<(), RequestError> {
        if hook != Hook::RequestPost || self.rules.is_empty() {
            return Ok(());
        }

        let configs = self.rules.select(current_vhost(ctx));
        if configs.is_empty() {
            return Ok(());
        }

        let key = format!(
            "{}{}",
            ctx.server_var(vars::HTTP_HOST)
                .or_else(|| ctx.server_var(vars::SERVER_NAME))
                .unwrap_or(""),
            ctx.server_var(vars::X_REQUEST_URI).unwrap_or("/")
        );

        let applied = self
            .engine
            .rewrite(&key, configs, ctx, response)
            .map_err(|e| RequestError::internal(e.to_string()))?;

        if applied > 0 {
            tracing::debug!(
                key = %key,
                applied,
                uri = ctx.server_var(vars::X_REQUEST_URI).unwrap_or(""),
                "Rewrite rules applied"
            );
        }
        Ok(())
    }
}
