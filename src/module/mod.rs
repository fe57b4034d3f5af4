//! Request processing modules
//!
//! Every module sees every request at each [`Hook`]. Modules are built once
//! per worker and reused for every connection that worker serves, so any
//! state they keep outlives a single request.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{RequestContext, ServerContext};
use crate::error::{ConfigError, RequestError};
use crate::http::request::Request;
use crate::http::response::Response;

pub mod access;
pub mod authentication;
pub mod deflate;
pub mod directory;
pub mod environment_variable;
pub mod header;
pub mod location;
pub mod pipeline;
pub mod proxy;
pub mod registry;
pub mod rewrite;
pub mod static_file;
pub mod virtual_host;

pub use pipeline::ModulePipeline;

/// Lifecycle points at which modules run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    RequestPre,
    RequestPost,
    ResponsePre,
    ResponsePost,
    /// Only fired after a request panicked, before the worker is replaced
    Shutdown,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Hook::RequestPre => "REQUEST_PRE",
            Hook::RequestPost => "REQUEST_POST",
            Hook::ResponsePre => "RESPONSE_PRE",
            Hook::ResponsePost => "RESPONSE_POST",
            Hook::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait Module: Send {
    /// Registry name, e.g. `rewrite`.
    fn name(&self) -> &'static str;

    /// Modules that must be configured ahead of this one.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    /// Reads whatever the module needs from the shared configuration.
    fn init(&mut self, server: Arc<ServerContext>) -> Result<(), ConfigError>;

    /// Called once after `init`, before the first request.
    fn prepare(&mut self) -> Result<(), ConfigError> {
        Ok(())
    }

    async fn process(
        &mut self,
        request: &mut Request,
        response: &mut Response,
        ctx: &mut RequestContext,
        hook: Hook,
    ) -> Result<(), RequestError>;
}
