//! The `core` module: maps the working URI onto the document root, picks
//! the handler and serves static files for the `core` handler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{RequestContext, ServerContext, vars};
use crate::error::{ConfigError, RequestError};
use crate::http::mime;
use crate::http::parser::decode_path;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::writer::http_date;
use crate::module::location::handler_module_var;
use crate::module::{Hook, Module};

pub const CORE_HANDLER: &str = "core";

/// Handler map key matching every extension.
pub const ANY_EXTENSION: &str = "*";

/// Joins a request path onto a document root.
pub fn local_path(document_root: &str, uri: &str) -> PathBuf {
    Path::new(document_root).join(uri.trim_start_matches('/'))
}

/// A request path split at the longest prefix naming an existing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPath {
    pub filename: PathBuf,
    /// URI prefix that maps to `filename`
    pub script_name: String,
    /// Whatever follows the file in the URI, e.g. `/extra` in `/app.php/extra`
    pub path_info: String,
}

/// Walks `uri` segment by segment below `document_root` until a regular file is found.
pub async fn find_script(document_root: &str, uri: &str) -> Option<ScriptPath> {
    let mut filename = PathBuf::from(document_root);
    let mut script_name = String::new();
    let mut rest = uri.trim_start_matches('/');

    loop {
        let (segment, remainder) = match rest.split_once('/') {
            Some((segment, remainder)) => (segment, Some(remainder)),
            None => (rest, None),
        };
        if segment.is_empty() {
            return None;
        }

        filename.push(segment);
        script_name.push('/');
        script_name.push_str(segment);

        let metadata = tokio::fs::metadata(&filename).await.ok()?;
        if metadata.is_file() {
            let path_info = remainder.map(|r| format!("/{r}")).unwrap_or_default();
            return Some(ScriptPath {
                filename,
                script_name,
                path_info,
            });
        }
        rest = remainder?;
    }
}

fn extension_of(path: &str) -> Option<String> {
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    (!ext.is_empty()).then(|| format!(".{ext}"))
}

#[derive(Default)]
pub struct CoreModule {
    handlers: HashMap<String, String>,
}

impl CoreModule {
    pub const NAME: &'static str = "core";

    /// Location overrides first, then the global extension map.
    fn select_handler(&self, ctx: &RequestContext, extension: Option<&str>) -> String {
        let keys: Vec<&str> = extension.into_iter().chain([ANY_EXTENSION]).collect();

        keys.iter()
            .find_map(|key| ctx.module_var(&handler_module_var(key)))
            .or_else(|| keys.iter().find_map(|key| self.handlers.get(*key).map(String::as_str)))
            .unwrap_or(CORE_HANDLER)
            .to_string()
    }

    async fn serve(
        &self,
        request: &Request,
        response: &mut Response,
        script: &Path,
    ) -> Result<(), RequestError> {
        if !matches!(request.method, Method::GET | Method::HEAD) {
            response.set_header("Allow", "GET, HEAD");
            return Err(RequestError::with_status(
                StatusCode::METHOD_NOT_ALLOWED,
                format!("{} is not allowed for static files", request.method),
            ));
        }

        let metadata = tokio::fs::metadata(script)
            .await
            .map_err(|_| RequestError::not_found("The requested file was not found"))?;
        let last_modified = metadata.modified().ok().map(http_date);

        if let (Some(modified), Some(since)) =
            (last_modified.as_deref(), request.header("If-Modified-Since"))
        {
            if modified == since.trim() {
                response.set_status(StatusCode::NOT_MODIFIED);
                response.set_header("Last-Modified", modified);
                response.body.clear();
                response.dispatch();
                return Ok(());
            }
        }

        let body = tokio::fs::read(script).await.map_err(|e| {
            tracing::warn!(path = %script.display(), error = %e, "Failed to read file");
            RequestError::forbidden("The requested file cannot be read")
        })?;

        response.set_status(StatusCode::OK);
        response.set_header("Content-Type", mime::from_path(script));
        if let Some(modified) = last_modified {
            response.set_header("Last-Modified", modified);
        }
        response.set_body(body);
        response.dispatch();
        Ok(())
    }
}

#[async_trait]
impl Module for CoreModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self, server: Arc<ServerContext>) -> Result<(), ConfigError> {
        self.handlers = server.config.handlers.clone();
        Ok(())
    }

    async fn process(
        &mut self,
        request: &mut Request,
        response: &mut Response,
        ctx: &mut RequestContext,
        hook: Hook,
    ) -> Result<(), RequestError> {
        if hook != Hook::RequestPost {
            return Ok(());
        }

        let uri = ctx.server_var(vars::X_REQUEST_URI).unwrap_or("/").to_string();
        let decoded = decode_path(&uri)?;

        // An absolute rewrite already named the file.
        let script = match ctx.server_var(vars::SCRIPT_FILENAME) {
            Some(filename) => Some(ScriptPath {
                filename: PathBuf::from(filename),
                script_name: ctx
                    .server_var(vars::SCRIPT_NAME)
                    .unwrap_or(&decoded)
                    .to_string(),
                path_info: String::new(),
            }),
            None => find_script(ctx.document_root(), &decoded).await,
        };

        let extension = match &script {
            Some(script) => extension_of(&script.filename.to_string_lossy()),
            None => extension_of(&decoded),
        };
        let handler = self.select_handler(ctx, extension.as_deref());

        if let Some(script) = &script {
            ctx.set_server_var(vars::SCRIPT_FILENAME, script.filename.to_string_lossy());
            ctx.set_server_var(vars::SCRIPT_NAME, script.script_name.clone());
            if !script.path_info.is_empty() {
                ctx.set_server_var(vars::PATH_INFO, script.path_info.clone());
            }
        }
        ctx.set_server_var(vars::SERVER_HANDLER, handler.clone());

        if handler != CORE_HANDLER {
            tracing::trace!(handler = %handler, uri = %decoded, "Leaving request to handler");
            return Ok(());
        }

        match script {
            Some(script) if script.path_info.is_empty() => {
                self.serve(request, response, &script.filename).await
            }
            _ => Err(RequestError::not_found(format!(
                "The requested URL {decoded} was not found on this server"
            ))),
        }
    }
}
