use std::collections::HashMap;

use crate::error::RequestError;
use crate::http::request::{Method, Part};

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidVersion,
    InvalidHeader,
    InvalidContentLength,
    InvalidMultipart,
}

impl From<ParseError> for RequestError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InvalidMethod => RequestError::with_status(
                crate::http::response::StatusCode::METHOD_NOT_ALLOWED,
                "Unsupported request method",
            ),
            other => RequestError::bad_request(format!("Malformed request: {other:?}")),
        }
    }
}

/// Parsed request line.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: String,
    pub version: String,
}

/// Parses `METHOD SP request-target SP HTTP-version`.
pub fn parse_request_line(line: &str) -> Result<RequestLine, ParseError> {
    let mut parts = line.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let uri = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequest);
    }

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;
    if !matches!(version, "HTTP/1.0" | "HTTP/1.1") {
        return Err(ParseError::InvalidVersion);
    }

    Ok(RequestLine {
        method,
        uri: uri.to_string(),
        version: version.to_string(),
    })
}

/// Parses one `Name: value` header line.
pub fn parse_header_line(line: &str) -> Result<(String, String), ParseError> {
    let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(ParseError::InvalidHeader);
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Parses a Content-Length value. Absent means zero.
pub fn parse_content_length(value: Option<&str>) -> Result<usize, ParseError> {
    let Some(value) = value else {
        return Ok(0);
    };

    // Repeated fields arrive joined; they must all agree.
    let mut lengths = value.split(',').map(|v| {
        v.trim()
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)
    });
    let first = lengths.next().ok_or(ParseError::InvalidContentLength)??;
    for length in lengths {
        if length? != first {
            return Err(ParseError::InvalidContentLength);
        }
    }
    Ok(first)
}

/// Decodes `a=1&b=2` style input into `params`, later keys winning.
pub fn decode_form(input: &[u8], params: &mut HashMap<String, String>) {
    for (key, value) in url::form_urlencoded::parse(input) {
        params.insert(key.into_owned(), value.into_owned());
    }
}

/// Percent-decodes a request path and rejects any `..` segment.
pub fn decode_path(path: &str) -> Result<String, RequestError> {
    let decoded = urlencoding::decode(path)
        .map_err(|_| RequestError::bad_request("Request path is not valid UTF-8"))?;
    if decoded.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(RequestError::forbidden("Path traversal is not allowed"));
    }
    Ok(decoded.into_owned())
}

/// Extracts the boundary of a `multipart/form-data` Content-Type.
pub fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let media_type = params.next()?.trim();
    if !media_type.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params.find_map(|p| {
        let (name, value) = p.trim().split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
            .filter(|b| !b.is_empty())
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn disposition_param(disposition: &str, name: &str) -> Option<String> {
    disposition.split(';').skip(1).find_map(|p| {
        let (key, value) = p.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

/// Splits a `multipart/form-data` body.
///
/// Plain fields land in `params`; parts carrying a file name land in `parts`.
pub fn parse_multipart(
    body: &[u8],
    boundary: &str,
    params: &mut HashMap<String, String>,
    parts: &mut Vec<Part>,
) -> Result<(), ParseError> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut pos = find(body, &delimiter, 0).ok_or(ParseError::InvalidMultipart)?;

    loop {
        pos += delimiter.len();
        if body[pos..].starts_with(b"--") {
            return Ok(());
        }
        if body[pos..].starts_with(b"\r\n") {
            pos += 2;
        }

        let next = find(body, &delimiter, pos).ok_or(ParseError::InvalidMultipart)?;
        let section = &body[pos..next];
        let section = section.strip_suffix(b"\r\n").unwrap_or(section);

        let headers_end = find(section, b"\r\n\r\n", 0).ok_or(ParseError::InvalidMultipart)?;
        let header_text = std::str::from_utf8(&section[..headers_end])
            .map_err(|_| ParseError::InvalidMultipart)?;
        let data = &section[headers_end + 4..];

        let mut disposition = None;
        let mut content_type = None;
        for line in header_text.split("\r\n").filter(|l| !l.is_empty()) {
            let (key, value) = parse_header_line(line)?;
            if key.eq_ignore_ascii_case("Content-Disposition") {
                disposition = Some(value);
            } else if key.eq_ignore_ascii_case("Content-Type") {
                content_type = Some(value);
            }
        }

        let disposition = disposition.ok_or(ParseError::InvalidMultipart)?;
        let name = disposition_param(&disposition, "name").ok_or(ParseError::InvalidMultipart)?;

        match disposition_param(&disposition, "filename") {
            Some(filename) => parts.push(Part {
                name,
                filename,
                content_type,
                data: data.to_vec(),
            }),
            None => {
                params.insert(name, String::from_utf8_lossy(data).into_owned());
            }
        }

        pos = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_path_rejects_traversal() {
        assert_eq!(decode_path("/a%20b/c.txt").unwrap(), "/a b/c.txt");
        let err = decode_path("/static/%2e%2e/secret").unwrap_err();
        assert_eq!(err.status.as_u16(), 403);
    }

    #[test]
    fn parse_simple_get() {
        let line = parse_request_line("GET /index.html?x=1 HTTP/1.1").unwrap();

        assert_eq!(line.method, Method::GET);
        assert_eq!(line.uri, "/index.html?x=1");
        assert_eq!(line.version, "HTTP/1.1");
    }

    #[test]
    fn boundary_is_extracted_and_unquoted() {
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=\"abc123\""),
            Some("abc123".to_string())
        );
        assert_eq!(multipart_boundary("application/json"), None);
        assert_eq!(multipart_boundary("multipart/form-data"), None);
    }
}
