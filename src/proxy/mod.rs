//! Reverse proxy plumbing used by the `proxy` module
//!
//! Backend bookkeeping and HTTP/1.1 forwarding over a reusable upstream
//! connection.

pub mod backend;
pub mod upstream;

pub use backend::{Backend, BackendPool, BackendState};
pub use upstream::{ProxyHandler, UpstreamError, UpstreamResponse};
