//! Server configuration.
//!
//! Loaded once from YAML and shared read-only by every worker. Per-request
//! overrides never write back here; they travel through the request context.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Modules enabled when the configuration does not list any.
pub const DEFAULT_MODULES: &[&str] = &[
    "virtual-host",
    "authentication",
    "environment-variable",
    "rewrite",
    "access",
    "location",
    "directory",
    "core",
    "proxy",
    "header",
    "deflate",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    /// Module names in execution order
    pub modules: Vec<String>,
    /// File extension (with dot) to handler name
    pub handlers: HashMap<String, String>,
    pub rewrites: Vec<RewriteConfig>,
    pub environment_variables: Vec<EnvironmentVariableConfig>,
    pub access: Vec<AccessConfig>,
    pub authentications: Vec<AuthenticationConfig>,
    pub locations: Vec<LocationConfig>,
    pub headers: Vec<HeaderConfig>,
    pub virtual_hosts: Vec<VirtualHostConfig>,
    pub proxy: ProxyConfig,
    pub deflate: DeflateConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            modules: DEFAULT_MODULES.iter().map(|m| m.to_string()).collect(),
            handlers: HashMap::new(),
            rewrites: Vec::new(),
            environment_variables: Vec::new(),
            access: Vec::new(),
            authentications: Vec::new(),
            locations: Vec::new(),
            headers: Vec::new(),
            virtual_hosts: Vec::new(),
            proxy: ProxyConfig::default(),
            deflate: DeflateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Number of worker tasks sharing the listener
    pub workers: usize,
    pub document_root: PathBuf,
    pub server_name: String,
    /// Value of the `Server` header and the error page footer
    pub signature: String,
    /// Connection age after which keep-alive is no longer granted
    pub keep_alive_timeout_secs: u64,
    /// Requests served on one connection before it is closed
    pub keep_alive_max: u32,
    pub read_timeout_secs: u64,
    pub max_request_line: usize,
    pub max_body_size: usize,
    pub error_page_template: Option<PathBuf>,
    pub index_files: Vec<String>,
    pub directory_listing: bool,
    pub https: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            workers: 4,
            document_root: PathBuf::from("var/www"),
            server_name: "localhost".to_string(),
            signature: format!("ferrule/{}", env!("CARGO_PKG_VERSION")),
            keep_alive_timeout_secs: 15,
            keep_alive_max: 100,
            read_timeout_secs: 5,
            max_request_line: 8192,
            max_body_size: 32 * 1024 * 1024,
            error_page_template: None,
            index_files: vec!["index.html".to_string(), "index.htm".to_string()],
            directory_listing: false,
            https: false,
        }
    }
}

impl ServerConfig {
    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn scheme(&self) -> &'static str {
        if self.https { "https" } else { "http" }
    }
}

/// Target of a rewrite rule: either a literal or a lookup table used with the `M` flag.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RewriteTarget {
    Literal(String),
    Map(BTreeMap<String, String>),
}

impl Default for RewriteTarget {
    fn default() -> Self {
        RewriteTarget::Literal(String::new())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RewriteConfig {
    pub condition: String,
    #[serde(default)]
    pub target: RewriteTarget,
    /// Comma separated flags, e.g. `R=302,L`
    #[serde(default)]
    pub flag: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvironmentVariableConfig {
    /// Rewrite-style condition; empty means always
    #[serde(default)]
    pub condition: String,
    /// `NAME=value` to set, bare `NAME` to unset
    pub definition: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    #[serde(rename = "type")]
    pub kind: AccessKind,
    /// Server variable name to regex; all must match
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthenticationConfig {
    /// Regex matched against the request path
    pub uri: String,
    #[serde(default = "default_realm")]
    pub realm: String,
    /// User name to password
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

fn default_realm() -> String {
    "Restricted".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocationConfig {
    /// Regex matched against the working request path
    pub condition: String,
    #[serde(default)]
    pub handlers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeaderConfig {
    pub name: String,
    pub value: String,
    /// Only inject for paths matching this regex
    #[serde(default)]
    pub uri: Option<String>,
    /// Replace a header a module already set
    #[serde(default, rename = "override")]
    pub override_existing: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VirtualHostConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub document_root: Option<PathBuf>,
    #[serde(default)]
    pub rewrites: Vec<RewriteConfig>,
    #[serde(default)]
    pub environment_variables: Vec<EnvironmentVariableConfig>,
    #[serde(default)]
    pub access: Vec<AccessConfig>,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

impl VirtualHostConfig {
    pub fn matches(&self, host: &str) -> bool {
        self.name.eq_ignore_ascii_case(host)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(host))
    }
}

/// Backend server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Backend URL (e.g., "http://localhost:3000")
    pub url: String,
    /// Optional backend name for logging
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub backends: Vec<BackendConfig>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeflateConfig {
    pub min_size: usize,
    /// Content-Type prefixes worth compressing
    pub mime_types: Vec<String>,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            min_size: 1024,
            mime_types: [
                "text/",
                "application/json",
                "application/javascript",
                "application/xml",
                "image/svg+xml",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
        }
    }
}

impl Config {
    /// Loads the configuration named by `FERRULE_CONFIG`, or the defaults.
    ///
    /// `LISTEN` overrides the listen address either way.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("FERRULE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(listen_addr) = std::env::var("LISTEN") {
            cfg.server.listen_addr = listen_addr;
        }

        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn virtual_host(&self, name: &str) -> Option<&VirtualHostConfig> {
        self.virtual_hosts.iter().find(|v| v.name == name)
    }
}
