use std::collections::HashMap;
use std::fmt;

/// Request methods the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
    CONNECT,
    TRACE,
}

impl Method {
    /// Matches the method token exactly; methods are case-sensitive.
    ///
    /// ```
    /// # use ferrule::http::request::Method;
    /// assert_eq!(Method::from_str("DELETE"), Some(Method::DELETE));
    /// assert_eq!(Method::from_str("delete"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "CONNECT" => Some(Method::CONNECT),
            "TRACE" => Some(Method::TRACE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One part of a `multipart/form-data` body that carried a file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Form field name
    pub name: String,
    /// Client-supplied file name
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Represents a parsed HTTP request from a client.
///
/// A connection keeps a single `Request` and refills it for every keep-alive
/// iteration, so [`reset`](Request::reset) must leave no trace of the
/// previous request behind.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// The raw request target as sent by the client (e.g. "/search?q=rust")
    pub uri: String,
    /// Path component of the request target
    pub path: String,
    /// Query string without the leading '?'
    pub query: String,
    /// HTTP version (typically "HTTP/1.1")
    pub version: String,
    /// Request headers as key-value pairs
    pub headers: HashMap<String, String>,
    /// Request body for POST/PUT requests
    pub body: Vec<u8>,
    /// Decoded query and form parameters
    pub params: HashMap<String, String>,
    /// Uploaded files from a multipart body
    pub parts: Vec<Part>,
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    version: Option<String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            uri: None,
            version: None,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        let mut request = Request {
            method: self.method.ok_or("method missing")?,
            version: self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            headers: self.headers,
            body: self.body,
            ..Request::default()
        };
        request.set_uri(self.uri.ok_or("uri missing")?);
        Ok(request)
    }
}

impl Request {
    /// Stores the raw request target and splits it into path and query.
    pub fn set_uri(&mut self, uri: impl Into<String>) {
        let uri = uri.into();
        match uri.split_once('?') {
            Some((path, query)) => {
                self.path = path.to_string();
                self.query = query.to_string();
            }
            None => {
                self.path = uri.clone();
                self.query.clear();
            }
        }
        self.uri = uri;
    }

    /// Header lookup ignoring ASCII case; an exact match is tried first.
    pub fn header(&self, key: &str) -> Option<&str> {
        if let Some(v) = self.headers.get(key) {
            return Some(v.as_str());
        }
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Adds a received header field. Repeats of a name, in any case, are
    /// joined with `, ` under the first spelling seen.
    pub fn append_header(&mut self, name: String, value: String) {
        let existing = self
            .headers
            .keys()
            .find(|k| k.eq_ignore_ascii_case(&name))
            .cloned();
        match existing.and_then(|k| self.headers.get_mut(&k)) {
            Some(joined) => {
                joined.push_str(", ");
                joined.push_str(&value);
            }
            None => {
                self.headers.insert(name, value);
            }
        }
    }

    /// Declared body length, 0 when absent or unparsable.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Whether the client asked for the connection to be kept open.
    ///
    /// Only an explicit `Connection: keep-alive` counts; a missing header means close.
    pub fn keep_alive(&self) -> bool {
        self.header("Connection")
            .map(|v| v.trim().eq_ignore_ascii_case("keep-alive"))
            .unwrap_or(false)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|v| v.as_str())
    }

    /// Clears everything read from the previous request.
    pub fn reset(&mut self) {
        self.method = Method::GET;
        self.uri.clear();
        self.path.clear();
        self.query.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.params.clear();
        self.parts.clear();
    }
}
