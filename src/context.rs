//! Server-wide and per-connection context.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;

/// Well-known server variable names.
pub mod vars {
    pub const REQUEST_METHOD: &str = "REQUEST_METHOD";
    pub const REQUEST_URI: &str = "REQUEST_URI";
    /// Working copy of the request path; rewrites change this one
    pub const X_REQUEST_URI: &str = "X_REQUEST_URI";
    pub const QUERY_STRING: &str = "QUERY_STRING";
    pub const SERVER_PROTOCOL: &str = "SERVER_PROTOCOL";
    pub const DOCUMENT_ROOT: &str = "DOCUMENT_ROOT";
    pub const SERVER_NAME: &str = "SERVER_NAME";
    pub const SERVER_PORT: &str = "SERVER_PORT";
    pub const SERVER_SOFTWARE: &str = "SERVER_SOFTWARE";
    pub const SERVER_HANDLER: &str = "SERVER_HANDLER";
    pub const SCRIPT_FILENAME: &str = "SCRIPT_FILENAME";
    pub const SCRIPT_NAME: &str = "SCRIPT_NAME";
    pub const PATH_INFO: &str = "PATH_INFO";
    pub const REQUEST_FILENAME: &str = "REQUEST_FILENAME";
    pub const REDIRECT_STATUS: &str = "REDIRECT_STATUS";
    pub const REDIRECT_URL: &str = "REDIRECT_URL";
    pub const REDIRECT_QUERY_STRING: &str = "REDIRECT_QUERY_STRING";
    pub const REMOTE_ADDR: &str = "REMOTE_ADDR";
    pub const REMOTE_PORT: &str = "REMOTE_PORT";
    pub const REMOTE_USER: &str = "REMOTE_USER";
    pub const AUTH_TYPE: &str = "AUTH_TYPE";
    pub const HTTP_HOST: &str = "HTTP_HOST";
    pub const HTTPS: &str = "HTTPS";
}

/// Module variable naming the virtual host matched for the current request.
pub const VHOST_MODULE_VAR: &str = "VHOST";

/// Immutable snapshot handed to every module at `init`.
#[derive(Debug)]
pub struct ServerContext {
    pub config: Config,
}

impl ServerContext {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self { config })
    }

    /// Server variables every request starts with.
    pub fn base_server_vars(&self) -> HashMap<String, String> {
        let server = &self.config.server;
        let mut base = HashMap::new();
        base.insert(
            vars::DOCUMENT_ROOT.to_string(),
            server.document_root.to_string_lossy().into_owned(),
        );
        base.insert(vars::SERVER_NAME.to_string(), server.server_name.clone());
        base.insert(vars::SERVER_SOFTWARE.to_string(), server.signature.clone());
        base.insert(
            vars::HTTPS.to_string(),
            if server.https { "on" } else { "off" }.to_string(),
        );
        if let Some((_, port)) = server.listen_addr.rsplit_once(':') {
            base.insert(vars::SERVER_PORT.to_string(), port.to_string());
        }
        base
    }
}

/// Variables for the request currently being served on a connection.
///
/// Three separate maps:
/// - server vars: facts about the request and the server configuration
/// - env vars: user-defined values passed on to later modules and backends
/// - module vars: volatile hand-offs between modules
///
/// The context belongs to one connection and is [`reset`](Self::reset)
/// between keep-alive iterations.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    base: HashMap<String, String>,
    server_vars: HashMap<String, String>,
    env_vars: HashMap<String, String>,
    module_vars: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(server: &ServerContext) -> Self {
        Self::with_base(server.base_server_vars())
    }

    /// Creates a context whose server vars are restored to `base` on every reset.
    pub fn with_base(base: HashMap<String, String>) -> Self {
        Self {
            server_vars: base.clone(),
            base,
            env_vars: HashMap::new(),
            module_vars: HashMap::new(),
        }
    }

    pub fn server_var(&self, key: &str) -> Option<&str> {
        self.server_vars.get(key).map(|v| v.as_str())
    }

    pub fn has_server_var(&self, key: &str) -> bool {
        self.server_vars.contains_key(key)
    }

    pub fn set_server_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.server_vars.insert(key.into(), value.into());
    }

    pub fn unset_server_var(&mut self, key: &str) -> Option<String> {
        self.server_vars.remove(key)
    }

    pub fn server_vars(&self) -> &HashMap<String, String> {
        &self.server_vars
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env_vars.get(key).map(|v| v.as_str())
    }

    pub fn set_env_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env_vars.insert(key.into(), value.into());
    }

    pub fn unset_env_var(&mut self, key: &str) -> Option<String> {
        self.env_vars.remove(key)
    }

    pub fn env_vars(&self) -> &HashMap<String, String> {
        &self.env_vars
    }

    pub fn module_var(&self, key: &str) -> Option<&str> {
        self.module_vars.get(key).map(|v| v.as_str())
    }

    pub fn set_module_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.module_vars.insert(key.into(), value.into());
    }

    /// Document root for this request, after any virtual host override.
    pub fn document_root(&self) -> &str {
        self.server_var(vars::DOCUMENT_ROOT).unwrap_or("")
    }

    /// Drops everything request-scoped and restores the configured server vars.
    pub fn reset(&mut self) {
        self.server_vars.clone_from(&self.base);
        self.env_vars.clear();
        self.module_vars.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_restores_base_and_clears_request_scope() {
        let mut base = HashMap::new();
        base.insert(vars::DOCUMENT_ROOT.to_string(), "/srv".to_string());
        let mut ctx = RequestContext::with_base(base);

        ctx.set_server_var(vars::DOCUMENT_ROOT, "/other");
        ctx.set_server_var(vars::REQUEST_URI, "/a");
        ctx.set_env_var("APP_ENV", "dev");
        ctx.set_module_var(VHOST_MODULE_VAR, "example.com");

        ctx.reset();

        assert_eq!(ctx.document_root(), "/srv");
        assert!(!ctx.has_server_var(vars::REQUEST_URI));
        assert!(ctx.env_vars().is_empty());
        assert_eq!(ctx.module_var(VHOST_MODULE_VAR), None);
    }
}
