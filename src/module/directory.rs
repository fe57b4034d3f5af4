//! Directory requests: trailing-slash redirects, index files and listings.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{RequestContext, ServerContext, vars};
use crate::error::{ConfigError, RequestError};
use crate::http::error_page::escape_html;
use crate::http::parser::decode_path;
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::module::static_file::local_path;
use crate::module::{Hook, Module};

#[derive(Default)]
pub struct DirectoryModule {
    index_files: Vec<String>,
    listing: bool,
}

impl DirectoryModule {
    pub const NAME: &'static str = "directory";
}

/// Renders a minimal HTML index of `dir`, directories first.
pub async fn render_listing(dir: &Path, uri: &str) -> std::io::Result<String> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().await?.is_dir() {
            dirs.push(format!("{name}/"));
        } else {
            files.push(name);
        }
    }
    dirs.sort();
    files.sort();

    let title = escape_html(uri);
    let mut html = format!(
        "<!DOCTYPE html>\n<html><head><title>Index of {title}</title></head>\n<body><h1>Index of {title}</h1>\n<ul>\n"
    );
    if uri != "/" {
        html.push_str("<li><a href=\"../\">../</a></li>\n");
    }
    for name in dirs.iter().chain(files.iter()) {
        let href = urlencoding::encode(name).replace("%2F", "/");
        html.push_str(&format!(
            "<li><a href=\"{href}\">{}</a></li>\n",
            escape_html(name)
        ));
    }
    html.push_str("</ul></body></html>\n");
    Ok(html)
}

#[async_trait]
impl Module for DirectoryModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self, server: Arc<ServerContext>) -> Result<(), ConfigError> {
        self.index_files = server.config.server.index_files.clone();
        self.listing = server.config.server.directory_listing;
        Ok(())
    }

    async fn process(
        &mut self,
        _request: &mut Request,
        response: &mut Response,
        ctx: &mut RequestContext,
        hook: Hook,
    ) -> Result<(), RequestError> {
        if hook != Hook::RequestPost || ctx.has_server_var(vars::SCRIPT_FILENAME) {
            return Ok(());
        }

        let uri = ctx.server_var(vars::X_REQUEST_URI).unwrap_or("/").to_string();
        let decoded = decode_path(&uri)?;
        let dir = local_path(ctx.document_root(), &decoded);

        let is_dir = tokio::fs::metadata(&dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Ok(());
        }

        if !uri.ends_with('/') {
            let mut location = format!("{uri}/");
            if let Some(query) = ctx.server_var(vars::QUERY_STRING).filter(|q| !q.is_empty()) {
                location.push('?');
                location.push_str(query);
            }
            tracing::debug!(location = %location, "Redirecting to directory with trailing slash");
            response.set_status(StatusCode::MOVED_PERMANENTLY);
            response.set_header("Location", location);
            response.dispatch();
            return Ok(());
        }

        for index in &self.index_files {
            let candidate = dir.join(index);
            if tokio::fs::metadata(&candidate)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
            {
                ctx.set_server_var(vars::X_REQUEST_URI, format!("{uri}{index}"));
                return Ok(());
            }
        }

        if !self.listing {
            return Err(RequestError::forbidden("Directory listing is disabled"));
        }

        let html = render_listing(&dir, &decoded)
            .await
            .map_err(|e| RequestError::internal(format!("Failed to list directory: {e}")))?;
        response.set_status(StatusCode::OK);
        response.set_header("Content-Type", "text/html; charset=utf-8");
        response.set_body(html);
        response.dispatch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listing_puts_directories_first_and_hides_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("zeta")).unwrap();
        std::fs::write(dir.path().join("alpha.txt"), b"a").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"h").unwrap();

        let html = render_listing(dir.path(), "/files/").await.unwrap();

        let zeta = html.find("zeta/").unwrap();
        let alpha = html.find("alpha.txt").unwrap();
        assert!(zeta < alpha);
        assert!(!html.contains(".hidden"));
        assert!(html.contains("href=\"../\""));
    }
}
