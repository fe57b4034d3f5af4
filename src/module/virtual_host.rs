//! Virtual host selection.
//!
//! Matches the requested host name against the configured virtual hosts,
//! switches the document root and records the host in the `VHOST` module
//! var. Modules with host-specific rules look that var up through
//! [`HostScoped`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::VirtualHostConfig;
use crate::context::{RequestContext, ServerContext, VHOST_MODULE_VAR, vars};
use crate::error::{ConfigError, RequestError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::module::{Hook, Module};

/// Global items plus, per virtual host, that host's items followed by the global ones.
#[derive(Debug, Clone)]
pub struct HostScoped<T> {
    global: Vec<T>,
    hosts: HashMap<String, Vec<T>>,
}

impl<T> Default for HostScoped<T> {
    fn default() -> Self {
        Self {
            global: Vec::new(),
            hosts: HashMap::new(),
        }
    }
}

impl<T: Clone> HostScoped<T> {
    /// Builds the per-host lists with `extract` picking each host's own items.
    pub fn build<C, E>(
        global: &[C],
        virtual_hosts: &[VirtualHostConfig],
        extract: impl Fn(&VirtualHostConfig) -> &[C],
        compile: impl Fn(&C) -> Result<T, E>,
    ) -> Result<Self, E> {
        let global = global.iter().map(&compile).collect::<Result<Vec<_>, _>>()?;

        let mut hosts = HashMap::new();
        for vhost in virtual_hosts {
            let own = extract(vhost);
            if own.is_empty() {
                continue;
            }
            let mut items = own.iter().map(&compile).collect::<Result<Vec<_>, _>>()?;
            items.extend(global.iter().cloned());
            hosts.insert(vhost.name.clone(), items);
        }

        Ok(Self { global, hosts })
    }
}

impl<T> HostScoped<T> {
    pub fn select(&self, vhost: Option<&str>) -> &[T] {
        vhost
            .and_then(|v| self.hosts.get(v))
            .unwrap_or(&self.global)
    }

    pub fn select_mut(&mut self, vhost: Option<&str>) -> &mut [T] {
        match vhost.and_then(|v| self.hosts.get_mut(v)) {
            Some(items) => items,
            None => &mut self.global,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.hosts.is_empty()
    }
}

/// Name of the virtual host matched for this request, if any.
pub fn current_vhost(ctx: &RequestContext) -> Option<&str> {
    ctx.module_var(VHOST_MODULE_VAR)
}

#[derive(Default)]
pub struct VirtualHostModule {
    hosts: Vec<VirtualHostConfig>,
}

impl VirtualHostModule {
    pub const NAME: &'static str = "virtual-host";
}

#[async_trait]
impl Module for VirtualHostModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self, server: Arc<ServerContext>) -> Result<(), ConfigError> {
        self.hosts = server.config.virtual_hosts.clone();
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

        let Some(host) = ctx.server_var(vars::SERVER_NAME) else {
            return Ok(());
        };
        let Some(vhost) = self.hosts.iter().find(|v| v.matches(host)) else {
            return Ok(());
        };

        tracing::debug!(vhost = %vhost.name, "Matched virtual host");
        if let Some(root) = &vhost.document_root {
            ctx.set_server_var(vars::DOCUMENT_ROOT, root.to_string_lossy());
        }
        ctx.set_module_var(VHOST_MODULE_VAR, vhost.name.clone());
        Ok(())
    }
}
