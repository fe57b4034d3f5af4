use std::collections::HashMap;

use ferrule::http::parser::{
    ParseError, decode_form, decode_path, multipart_boundary, parse_content_length,
    parse_header_line, parse_multipart, parse_request_line,
};
use ferrule::http::request::Method;
use ferrule::http::response::StatusCode;

#[test]
fn test_parse_request_line_with_query_string() {
    let line = parse_request_line("GET /search?q=rust HTTP/1.1").unwrap();

    assert_eq!(line.method, Method::GET);
    assert_eq!(line.uri, "/search?q=rust");
    assert_eq!(line.version, "HTTP/1.1");
}

#[test]
fn test_parse_request_line_errors() {
    assert_eq!(parse_request_line("GET /"), Err(ParseError::InvalidRequest));
    assert_eq!(
        parse_request_line("GET / HTTP/1.1 extra"),
        Err(ParseError::InvalidRequest)
    );
    assert_eq!(
        parse_request_line("INVALID / HTTP/1.1"),
        Err(ParseError::InvalidMethod)
    );
    assert_eq!(
        parse_request_line("GET / HTTP/2.0"),
        Err(ParseError::InvalidVersion)
    );
}

#[test]
fn test_parse_various_http_methods() {
    let methods = vec![
        ("GET", Method::GET),
        ("POST", Method::POST),
        ("PUT", Method::PUT),
        ("DELETE", Method::DELETE),
        ("HEAD", Method::HEAD),
        ("OPTIONS", Method::OPTIONS),
        ("PATCH", Method::PATCH),
    ];

    for (method_str, expected_method) in methods {
        let line = parse_request_line(&format!("{method_str} / HTTP/1.0")).unwrap();
        assert_eq!(line.method, expected_method);
    }
}

#[test]
fn test_parse_header_line() {
    assert_eq!(
        parse_header_line("Content-Type:  application/json ").unwrap(),
        ("Content-Type".to_string(), "application/json".to_string())
    );
    assert_eq!(
        parse_header_line("Host: example.com:8080").unwrap(),
        ("Host".to_string(), "example.com:8080".to_string())
    );
    assert_eq!(parse_header_line("BrokenHeader"), Err(ParseError::InvalidHeader));
    assert_eq!(parse_header_line("Bad Name: x"), Err(ParseError::InvalidHeader));
}

#[test]
fn test_parse_content_length() {
    assert_eq!(parse_content_length(None), Ok(0));
    assert_eq!(parse_content_length(Some(" 42 ")), Ok(42));
    assert_eq!(
        parse_content_length(Some("-1")),
        Err(ParseError::InvalidContentLength)
    );
}

#[test]
fn test_parse_content_length_repeated_fields() {
    assert_eq!(parse_content_length(Some("4, 4")), Ok(4));
    assert_eq!(
        parse_content_length(Some("4, 4000")),
        Err(ParseError::InvalidContentLength)
    );
    assert_eq!(
        parse_content_length(Some("4,")),
        Err(ParseError::InvalidContentLength)
    );
}

#[test]
fn test_decode_form() {
    let mut params = HashMap::new();
    decode_form(b"name=J%C3%BCrgen&x=1&x=2&q=a+b", &mut params);

    assert_eq!(params.get("name").unwrap(), "Jürgen");
    assert_eq!(params.get("x").unwrap(), "2");
    assert_eq!(params.get("q").unwrap(), "a b");
}

#[test]
fn test_decode_path() {
    assert_eq!(decode_path("/docs/a%20b.html").unwrap(), "/docs/a b.html");
    assert_eq!(
        decode_path("/../etc/passwd").unwrap_err().status,
        StatusCode::FORBIDDEN
    );
    assert_eq!(
        decode_path("/a/..%5Cb").unwrap_err().status,
        StatusCode::FORBIDDEN
    );
    assert_eq!(
        decode_path("/%FF").unwrap_err().status,
        StatusCode::BAD_REQUEST
    );
}

#[test]
fn test_multipart_body() {
    let content_type = "multipart/form-data; boundary=XyZ";
    let boundary = multipart_boundary(content_type).unwrap();
    let body = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\
\r\n\
hello\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\
\r\n\
file data\r\n\
--XyZ--\r\n";

    let mut params = HashMap::new();
    let mut parts = Vec::new();
    parse_multipart(body, &boundary, &mut params, &mut parts).unwrap();

    assert_eq!(params.get("title").unwrap(), "hello");
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].name, "upload");
    assert_eq!(parts[0].filename, "a.txt");
    assert_eq!(parts[0].content_type.as_deref(), Some("text/plain"));
    assert_eq!(parts[0].data, b"file data");
}

#[test]
fn test_multipart_without_closing_delimiter() {
    let body = b"--XyZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n";
    let mut params = HashMap::new();
    let mut parts = Vec::new();

    assert_eq!(
        parse_multipart(body, "XyZ", &mut params, &mut parts),
        Err(ParseError::InvalidMultipart)
    );
}
