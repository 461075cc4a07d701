//! Status lines, header blocks, content types and generated error pages.

use std::collections::HashMap;

use crate::buffer::ChunkBuffer;
use crate::path::HtmlEscaped;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const STATUS_REASONS: &[(u16, &str)] = &[
    (100, "Continue"),
    (101, "Switching Protocols"),
    (200, "OK"),
    (201, "Created"),
    (202, "Accepted"),
    (203, "Non-Authoritative Information"),
    (204, "No Content"),
    (205, "Reset Content"),
    (206, "Partial Content"),
    (300, "Multiple Choices"),
    (301, "Moved Permanently"),
    (302, "Found"),
    (303, "See Other"),
    (304, "Not Modified"),
    (305, "Use Proxy"),
    (307, "Temporary Redirect"),
    (400, "Bad Request"),
    (401, "Unauthorized"),
    (402, "Payment Required"),
    (403, "Forbidden"),
    (404, "Not Found"),
    (405, "Method Not Allowed"),
    (406, "Not Acceptable"),
    (407, "Proxy Authentication Required"),
    (408, "Request Timeout"),
    (409, "Conflict"),
    (410, "Gone"),
    (411, "Length Required"),
    (412, "Precondition Failed"),
    (413, "Request Entity Too Large"),
    (414, "Request-URI Too Long"),
    (415, "Unsupported Media Type"),
    (416, "Requested Range Not Satisfiable"),
    (417, "Expectation Failed"),
    (500, "Internal Server Error"),
    (501, "Not Implemented"),
    (502, "Bad Gateway"),
    (503, "Service Unavailable"),
    (504, "Gateway Timeout"),
    (505, "HTTP Version Not Supported"),
];

const EXTENSIONS_MAP: &[&str] = &[
    "image/gif               gif",
    "image/png               png",
    "image/jpeg              jpeg jpe jpg",
    "text/css                css",
    "text/html               html",
    "text/plain              txt",
    "text/javascript         js",
];

/// Stylesheet for error pages when the engine has none to offer.
pub const DEFAULT_STYLE: &str = "<style type=\"text/css\">\
body {background-color: #fff; color: #222; font-family: sans-serif;}\
h1.h {font-size: 150%; border-bottom: 1px solid #ccc; padding-bottom: 4px;}\
</style>";

pub fn reason_phrase(code: u16) -> Option<&'static str> {
    STATUS_REASONS
        .binary_search_by_key(&code, |&(code, _)| code)
        .ok()
        .map(|index| STATUS_REASONS[index].1)
}

/// `HTTP/<major>.<minor> <code> <reason>\r\n`, `version` being `major * 100 + minor`.
pub fn status_line(version: u32, code: u16) -> String {
    format!(
        "HTTP/{}.{} {} {}\r\n",
        version / 100,
        version % 100,
        code,
        reason_phrase(code).unwrap_or("Unknown Status")
    )
}

/// Headers sent with every response: the echoed `Host`, then `Connection: closed`.
pub fn essential_headers(host: Option<&str>) -> String {
    match host {
        Some(host) => format!("Host: {}\r\nConnection: closed\r\n", host),
        None => "Connection: closed\r\n".to_string(),
    }
}

/// `Content-Type` header value, declaring UTF-8 for text types.
pub fn content_type_value(mimetype: &str) -> String {
    if mimetype.starts_with("text/") {
        format!("{}; charset=UTF-8", mimetype)
    } else {
        mimetype.to_string()
    }
}

#[derive(Debug)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    default_mimetype: String,
}

impl MimeMap {
    /// Add line from an extension map.
    fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c| matches!(c, ' ' | '\t'))
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return, // empty line
        };
        if mimetype.starts_with('#') {
            return; // comment
        }
        for extension in fields {
            self.mimetypes
                .insert(extension.to_string(), mimetype.to_string());
        }
    }

    /// Mimetype for a file extension (without the dot).
    pub fn extension_content_type(&self, extension: &str) -> &str {
        self.mimetypes
            .get(extension)
            .unwrap_or(&self.default_mimetype)
    }
}

impl Default for MimeMap {
    fn default() -> Self {
        let mut mime_map = Self {
            mimetypes: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}

/// Header block for a response whose length is known up front.
pub fn fixed_length_header(
    version: u32,
    code: u16,
    host: Option<&str>,
    content_type: &str,
    content_length: u64,
) -> String {
    format!(
        "{}{}Content-Type: {}\r\nContent-Length: {}\r\n\r\n",
        status_line(version, code),
        essential_headers(host),
        content_type,
        content_length
    )
}

/// Body template for `code`, filled with the reason and the escaped request URI.
fn body_template(code: u16, reason: &str, request_uri: &str) -> String {
    match code {
        404 => format!(
            "<h1 class=\"h\">{}</h1><p>The requested resource {} was not found on this server.</p>",
            reason,
            HtmlEscaped(request_uri)
        ),
        500 => format!(
            "<h1 class=\"h\">{}</h1><p>The server is temporarily unavailable.</p>",
            reason
        ),
        _ => format!("<h1 class=\"h\">{}</h1>", reason),
    }
}

/// What an error page is about.
#[derive(Debug, Clone, Copy)]
pub struct ErrorPage<'a> {
    pub version: u32,
    pub code: u16,
    pub host: Option<&'a str>,
    pub request_uri: &'a str,
}

impl ErrorPage<'_> {
    /// Assemble the page with `style` spliced into the head, header chunk first.
    pub fn render(&self, style: &mut ChunkBuffer) -> ChunkBuffer {
        let reason = reason_phrase(self.code).unwrap_or("Error");
        let mut page = ChunkBuffer::new();
        page.append(format!(
            "<html><head><title>{} {}</title>",
            self.code, reason
        ));
        page.append_buffer(style);
        page.append("</head><body>");
        page.append(body_template(self.code, reason, self.request_uri));
        page.append("</body></html>");

        let content_length = page.len() as u64;
        page.prepend(fixed_length_header(
            self.version,
            self.code,
            self.host,
            &content_type_value("text/html"),
            content_length,
        ));
        page
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    fn rendered(page: &mut ChunkBuffer) -> String {
        let mut out = Vec::new();
        page.drain(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn status_table_is_sorted() {
        assert!(STATUS_REASONS.windows(2).all(|pair| pair[0].0 < pair[1].0));
    }

    #[test_case(100, Some("Continue"))]
    #[test_case(200, Some("OK"))]
    #[test_case(204, Some("No Content"))]
    #[test_case(301, Some("Moved Permanently"))]
    #[test_case(304, Some("Not Modified"))]
    #[test_case(404, Some("Not Found"))]
    #[test_case(405, Some("Method Not Allowed"))]
    #[test_case(503, Some("Service Unavailable"))]
    #[test_case(505, Some("HTTP Version Not Supported"))]
    #[test_case(306, None)]
    #[test_case(999, None)]
    fn reasons(code: u16, expected: Option<&str>) {
        assert_eq!(reason_phrase(code), expected);
    }

    #[test]
    fn status_line_echoes_version() {
        assert_eq!(status_line(101, 200), "HTTP/1.1 200 OK\r\n");
        assert_eq!(status_line(100, 404), "HTTP/1.0 404 Not Found\r\n");
    }

    #[test]
    fn essential_headers_echo_host() {
        assert_eq!(
            essential_headers(Some("localhost:3000")),
            "Host: localhost:3000\r\nConnection: closed\r\n"
        );
        assert_eq!(essential_headers(None), "Connection: closed\r\n");
    }

    #[test_case("gif", "image/gif")]
    #[test_case("png", "image/png")]
    #[test_case("jpg", "image/jpeg")]
    #[test_case("jpeg", "image/jpeg")]
    #[test_case("jpe", "image/jpeg")]
    #[test_case("css", "text/css")]
    #[test_case("html", "text/html")]
    #[test_case("txt", "text/plain")]
    #[test_case("js", "text/javascript")]
    #[test_case("htm", "application/octet-stream" ; "unlisted")]
    #[test_case("", "application/octet-stream" ; "none")]
    fn mime_types(extension: &str, expected: &str) {
        assert_eq!(MimeMap::default().extension_content_type(extension), expected);
    }

    #[test]
    fn charset_only_for_text() {
        assert_eq!(content_type_value("text/css"), "text/css; charset=UTF-8");
        assert_eq!(content_type_value("image/png"), "image/png");
    }

    #[test]
    fn not_found_page() {
        let mut style = ChunkBuffer::new();
        style.append("<style></style>");
        let mut page = ErrorPage {
            version: 101,
            code: 404,
            host: Some("example"),
            request_uri: "/<script>?a='b'&c",
        }
        .render(&mut style);
        assert!(style.is_empty());

        let text = rendered(&mut page);
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(
            head,
            format!(
                "HTTP/1.1 404 Not Found\r\nHost: example\r\nConnection: closed\r\n\
                 Content-Type: text/html; charset=UTF-8\r\nContent-Length: {}",
                body.len()
            )
        );
        assert_eq!(
            body,
            "<html><head><title>404 Not Found</title><style></style></head><body>\
             <h1 class=\"h\">Not Found</h1><p>The requested resource \
             /&lt;script&gt;?a=&#039;b&#039;&amp;c was not found on this server.</p>\
             </body></html>"
        );
    }

    #[test]
    fn server_error_and_generic_pages() {
        let mut page = ErrorPage {
            version: 100,
            code: 500,
            host: None,
            request_uri: "/x.php",
        }
        .render(&mut ChunkBuffer::new());
        let text = rendered(&mut page);
        assert!(text.starts_with("HTTP/1.0 500 Internal Server Error\r\nConnection: closed\r\n"));
        assert!(text.contains("<p>The server is temporarily unavailable.</p>"));

        let mut page = ErrorPage {
            version: 101,
            code: 403,
            host: None,
            request_uri: "/",
        }
        .render(&mut ChunkBuffer::new());
        let text = rendered(&mut page);
        assert!(text.ends_with("<body><h1 class=\"h\">Forbidden</h1></body></html>"));
    }
}
