//! Response compression with gzip or deflate.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};

use crate::config::DeflateConfig;
use crate::context::{RequestContext, ServerContext};
use crate::error::{ConfigError, RequestError};
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::module::{Hook, Module};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }

    /// Picks an encoding from an `Accept-Encoding` value, gzip first.
    ///
    /// Entries with `q=0` are refused.
    pub fn negotiate(accept: &str) -> Option<Self> {
        let accepted = |name: &str| {
            accept.split(',').any(|entry| {
                let mut params = entry.split(';');
                let coding = params.next().unwrap_or_default().trim();
                let refused = params.any(|p| {
                    p.trim()
                        .strip_prefix("q=")
                        .and_then(|q| q.trim().parse::<f32>().ok())
                        .is_some_and(|q| q == 0.0)
                });
                (coding.eq_ignore_ascii_case(name) || coding == "*") && !refused
            })
        };

        if accepted("gzip") {
            Some(Encoding::Gzip)
        } else if accepted("deflate") {
            Some(Encoding::Deflate)
        } else {
            None
        }
    }

    pub fn encode(&self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Encoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(input)?;
                encoder.finish()
            }
            Encoding::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(input)?;
                encoder.finish()
            }
        }
    }
}

#[derive(Default)]
pub struct DeflateModule {
    config: DeflateConfig,
}

impl DeflateModule {
    pub const NAME: &'static str = "deflate";

    fn is_compressible(&self, response: &Response) -> bool {
        if response.status != StatusCode::OK
            || response.body.len() < self.config.min_size
            || response.has_header("Content-Encoding")
        {
            return false;
        }
        let content_type = response.header("Content-Type").unwrap_or("text/html");
        self.config
            .mime_types
            .iter()
            .any(|prefix| content_type.starts_with(prefix.as_str()))
    }
}

#[async_trait]
impl Module for DeflateModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self, server: Arc<ServerContext>) -> Result<(), ConfigError> {
        self.config = server.config.deflate.clone();
        Ok(())
    }

    async fn process(
        &mut self,
        request: &mut Request,
        response: &mut Response,
        _ctx: &mut RequestContext,
        hook: Hook,
    ) -> Result<(), RequestError> {
        if hook != Hook::ResponsePre || !self.is_compressible(response) {
            return Ok(());
        }
        let Some(encoding) = request.header("Accept-Encoding").and_then(Encoding::negotiate) else {
            return Ok(());
        };

        match encoding.encode(&response.body) {
            Ok(compressed) if compressed.len() < response.body.len() => {
                tracing::trace!(
                    encoding = encoding.as_str(),
                    from = response.body.len(),
                    to = compressed.len(),
                    "Compressed response body"
                );
                response.set_body(compressed);
                response.set_header("Content-Encoding", encoding.as_str());
                response.set_header("Vary", "Accept-Encoding");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to compress response body"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    #[test]
    fn negotiates_gzip_before_deflate() {
        assert_eq!(Encoding::negotiate("deflate, gzip"), Some(Encoding::Gzip));
        assert_eq!(Encoding::negotiate("gzip;q=0, deflate"), Some(Encoding::Deflate));
        assert_eq!(Encoding::negotiate("br"), None);
    }

    #[tokio::test]
    async fn compresses_large_text_bodies() {
        let mut module = DeflateModule::default();
        let body = "lorem ipsum ".repeat(200);
        let mut request = Request::default();
        request.headers.insert("Accept-Encoding".into(), "gzip".into());
        let mut response = Response::new();
        response.set_header("Content-Type", "text/plain");
        response.set_body(body.clone());
        let mut ctx = RequestContext::default();

        module
            .process(&mut request, &mut response, &mut ctx, Hook::ResponsePre)
            .await
            .unwrap();

        assert_eq!(response.header("Content-Encoding"), Some("gzip"));
        let mut decoded = String::new();
        GzDecoder::new(&response.body[..]).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, body);
    }

    #[tokio::test]
    async fn leaves_small_or_binary_bodies_alone() {
        let mut module = DeflateModule::default();
        let mut request = Request::default();
        request.headers.insert("Accept-Encoding".into(), "gzip".into());
        let mut ctx = RequestContext::default();

        let mut small = Response::new();
        small.set_header("Content-Type", "text/plain");
        small.set_body("tiny");
        module
            .process(&mut request, &mut small, &mut ctx, Hook::ResponsePre)
            .await
            .unwrap();
        assert!(!small.has_header("Content-Encoding"));

        let mut image = Response::new();
        image.set_header("Content-Type", "image/png");
        image.set_body(vec![0u8; 4096]);
        module
            .process(&mut request, &mut image, &mut ctx, Hook::ResponsePre)
            .await
            .unwrap();
        assert!(!image.has_header("Content-Encoding"));
    }
}
