//! Conditional environment variables.
//!
//! Each entry carries a rewrite-style condition and a definition. When the
//! condition holds, `NAME=value` sets `NAME` (with backreferences resolved)
//! and a bare `NAME` removes it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{EnvironmentVariableConfig, RewriteTarget};
use crate::context::{RequestContext, ServerContext};
use crate::error::{ConfigError, RequestError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::module::virtual_host::{HostScoped, current_vhost};
use crate::module::{Hook, Module};
use crate::rewrite::{Backreferences, Rule};

#[derive(Debug, Clone)]
struct EnvRule {
    condition: Option<Rule>,
    name: String,
    value: Option<String>,
}

impl EnvRule {
    fn compile(config: &EnvironmentVariableConfig) -> Result<Self, ConfigError> {
        let condition = match config.condition.trim() {
            "" => None,
            c => Some(Rule::new(c, RewriteTarget::default(), "")?),
        };

        let (name, value) = match config.definition.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.to_string())),
            None => (config.definition.trim(), None),
        };
        if name.is_empty() {
            return Err(ConfigError::InvalidRule {
                rule: config.definition.clone(),
                reason: "environment variable name is empty".to_string(),
            });
        }

        Ok(Self {
            condition,
            name: name.to_string(),
            value,
        })
    }

    fn apply(&mut self, ctx: &mut RequestContext) {
        let mut backreferences = Backreferences::from_context(ctx);

        if let Some(condition) = &mut self.condition {
            if !condition.matches(&backreferences, Path::new(ctx.document_root())) {
                return;
            }
            backreferences.extend(condition.matching_backreferences());
        }

        match &self.value {
            Some(value) => {
                let value = backreferences.resolve(value);
                tracing::trace!(name = %self.name, value = %value, "Setting environment variable");
                ctx.set_env_var(self.name.clone(), value);
            }
            None => {
                tracing::trace!(name = %self.name, "Unsetting environment variable");
                ctx.unset_env_var(&self.name);
            }
        }
    }
}

#[derive(Default)]
pub struct EnvironmentVariableModule {
    rules: HostScoped<EnvRule>,
}

impl EnvironmentVariableModule {
    pub const NAME: &'static str = "environment-variable";
}

#[async_trait]
impl Module for EnvironmentVariableModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self, server: Arc<ServerContext>) -> Result<(), ConfigError> {
        self.rules = HostScoped::build(
            &server.config.environment_variables,
            &server.config.virtual_hosts,
            |v| v.environment_variables.as_slice(),
            EnvRule::compile,
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

        for rule in self.rules.select_mut(current_vhost(ctx)) {
            rule.apply(ctx);
        }
        Ok(())
    }
}
