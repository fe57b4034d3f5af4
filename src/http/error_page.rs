//! Error page rendering.
//!
//! A configured template may use `{{status}}`, `{{reason}}`, `{{message}}`
//! and `{{signature}}`. Without one, a short plain text page is produced.

use crate::http::response::StatusCode;

/// Escapes text for inclusion in HTML.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Strips control characters so the signature cannot inject lines.
pub fn sanitize_signature(signature: &str) -> String {
    signature.chars().filter(|c| !c.is_control()).collect()
}

/// Renders the body and Content-Type of an error response.
pub fn render(
    template: Option<&str>,
    status: StatusCode,
    message: &str,
    signature: &str,
) -> (String, &'static str) {
    let signature = sanitize_signature(signature);

    match template {
        Some(template) => {
            let body = template
                .replace("{{status}}", &status.as_u16().to_string())
                .replace("{{reason}}", status.reason_phrase())
                .replace("{{message}}", &escape_html(message))
                .replace("{{signature}}", &escape_html(&signature));
            (body, "text/html; charset=utf-8")
        }
        None => {
            let body = format!(
                "{} {}\n\n{}\n\n{}\n",
                status.as_u16(),
                status.reason_phrase(),
                message,
                signature
            );
            (body, "text/plain; charset=utf-8")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_escapes_message() {
        let (body, content_type) = render(
            Some("<h1>{{status}} {{reason}}</h1><p>{{message}}</p><i>{{signature}}</i>"),
            StatusCode::NOT_FOUND,
            "/<script>",
            "ferrule/0.1",
        );

        assert_eq!(
            body,
            "<h1>404 Not Found</h1><p>/&lt;script&gt;</p><i>ferrule/0.1</i>"
        );
        assert!(content_type.starts_with("text/html"));
    }

    #[test]
    fn plain_text_fallback_sanitizes_signature() {
        let (body, content_type) = render(
            None,
            StatusCode::INTERNAL_SERVER_ERROR,
            "boom",
            "ferrule\r\nX-Injected: 1",
        );

        assert_eq!(body, "500 Internal Server Error\n\nboom\n\nferruleX-Injected: 1\n");
        assert!(content_type.starts_with("text/plain"));
    }
}
