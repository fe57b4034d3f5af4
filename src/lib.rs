//! ferrule - modular HTTP/1.1 server
//!
//! Connections are served by a pool of workers, each running requests
//! through a configurable pipeline of Apache-style modules: virtual hosts,
//! authentication, URL rewriting, access control, static files, reverse
//! proxying, headers and compression.

pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod module;
pub mod proxy;
pub mod rewrite;
pub mod server;
