//! Per-location handler overrides.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::config::LocationConfig;
use crate::context::{RequestContext, ServerContext, vars};
use crate::error::{ConfigError, RequestError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::module::virtual_host::{HostScoped, current_vhost};
use crate::module::{Hook, Module};

/// Module var consulted by the core module for the handler of `extension`.
pub fn handler_module_var(extension: &str) -> String {
    format!("HANDLER{extension}")
}

#[derive(Debug, Clone)]
pub struct Location {
    pattern: Regex,
    handlers: HashMap<String, String>,
}

impl Location {
    pub fn compile(config: &LocationConfig) -> Result<Self, ConfigError> {
        let pattern = Regex::new(&config.condition).map_err(|source| ConfigError::InvalidPattern {
            pattern: config.condition.clone(),
            source,
        })?;
        Ok(Self {
            pattern,
            handlers: config.handlers.clone(),
        })
    }
}

#[derive(Default)]
pub struct LocationModule {
    locations: HostScoped<Location>,
}

impl LocationModule {
    pub const NAME: &'static str = "location";
}

#[async_trait]
impl Module for LocationModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self, server: Arc<ServerContext>) -> Result<(), ConfigError> {
        self.locations = HostScoped::build(
            &server.config.locations,
            &server.config.virtual_hosts,
            |v| v.locations.as_slice(),
            Location::compile,
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

        let uri = ctx.server_var(vars::X_REQUEST_URI).unwrap_or("/").to_string();
        let overrides: Vec<(String, String)> = self
            .locations
            .select(current_vhost(ctx))
            .iter()
            .filter(|l| l.pattern.is_match(&uri))
            .flat_map(|l| l.handlers.iter())
            .map(|(ext, handler)| (handler_module_var(ext), handler.clone()))
            .collect();

        for (key, handler) in overrides {
            ctx.set_module_var(key, handler);
        }
        Ok(())
    }
}
