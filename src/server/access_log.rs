//! Combined Log Format access log.
//!
//! Lines go to the `ferrule::access` tracing target so they can be routed
//! separately from diagnostics.

use chrono::{DateTime, Local};

use crate::http::request::Request;
use crate::http::response::Response;

pub const ACCESS_LOG_TARGET: &str = "ferrule::access";

fn or_dash(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("-")
}

/// `remote - - [time] "METHOD URI VERSION" status length "referer" "user-agent"`
pub fn format_access_log(
    remote_addr: &str,
    time: DateTime<Local>,
    request: &Request,
    response: &Response,
) -> String {
    format!(
        "{} - - [{}] \"{} {} {}\" {} {} \"{}\" \"{}\"",
        remote_addr,
        time.format("%d/%b/%Y:%H:%M:%S %z"),
        request.method,
        or_dash(Some(&request.uri)),
        or_dash(Some(&request.version)),
        response.status.as_u16(),
        or_dash(response.header("Content-Length")),
        or_dash(request.header("Referer")),
        or_dash(request.header("User-Agent")),
    )
}

pub fn record(remote_addr: &str, request: &Request, response: &Response) {
    tracing::info!(
        target: ACCESS_LOG_TARGET,
        "{}",
        format_access_log(remote_addr, Local::now(), request, response)
    );
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::http::request::{Method, RequestBuilder};
    use crate::http::response::{ResponseBuilder, StatusCode};

    #[test]
    fn formats_combined_log_line() {
        let request = RequestBuilder::new()
            .method(Method::GET)
            .uri("/index.html?x=1")
            .header("User-Agent", "curl/8.0")
            .build()
            .unwrap();
        let response = ResponseBuilder::new(StatusCode::OK).body(b"hello".to_vec()).build();
        let time = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        let line = format_access_log("10.0.0.1", time, &request, &response);

        let expected_time = time.format("%d/%b/%Y:%H:%M:%S %z").to_string();
        assert_eq!(
            line,
            format!(
                "10.0.0.1 - - [{expected_time}] \"GET /index.html?x=1 HTTP/1.1\" 200 5 \"-\" \"curl/8.0\""
            )
        );
        assert!(expected_time.starts_with("09/Mar/2024:14:05:07"));
    }
}
