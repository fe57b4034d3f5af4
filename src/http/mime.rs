//! MIME type detection based on file extensions.

use std::path::Path;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Returns the Content-Type for a file path, falling back to
/// `application/octet-stream`.
///
/// # Example
///
/// ```
/// # use ferrule::http::mime::from_path;
/// assert_eq!(from_path("/var/www/index.html"), "text/html; charset=utf-8");
/// assert_eq!(from_path("archive.unknown"), "application/octet-stream");
/// ```
pub fn from_path(path: impl AsRef<Path>) -> &'static str {
    path.as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(from_extension)
        .unwrap_or(DEFAULT_MIME_TYPE)
}

pub fn from_extension(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain; charset=utf-8",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => DEFAULT_MIME_TYPE,
    }
}
