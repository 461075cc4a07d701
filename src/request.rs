//! A parsed request and its resolution against the document root.

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::parser::{ParseError, ParserCallbacks, Version};
use crate::path::{normalize, translate};

/// Why reading a request stopped short of a complete message.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error(transparent)]
    Malformed(#[from] ParseError),
}

#[derive(Debug, Default)]
pub struct Request {
    pub method: String,
    /// `major * 100 + minor`; 0 until the message is complete.
    pub version: u32,
    /// Raw request target as sent by the client.
    pub request_uri: String,
    pub query_string: Option<String>,
    raw_path: String,
    /// Header names as received; the first occurrence of a name wins.
    pub headers: HashMap<String, String>,
    pending_field: Option<String>,
    pub body: Vec<u8>,
    /// Normalized virtual path; the resolved file's once translated.
    pub vpath: String,
    pub path_translated: Option<PathBuf>,
    pub path_info: Option<String>,
    pub extension: String,
    pub metadata: Option<Metadata>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn version_string(&self) -> String {
        format!("HTTP/{}.{}", self.version / 100, self.version % 100)
    }

    /// Map the virtual path onto `document_root` and derive the extension.
    pub fn resolve<S: AsRef<str>>(&mut self, document_root: &Path, index_files: &[S]) {
        if let Some(translation) = translate(&self.vpath, document_root, index_files) {
            self.vpath = translation.vpath;
            self.path_translated = Some(translation.path);
            self.path_info = translation.path_info;
            self.metadata = Some(translation.metadata);
        }
        self.extension = extension_of(&self.vpath).to_string();
    }
}

impl ParserCallbacks for Request {
    fn on_url(&mut self, method: &str, url: &str) {
        self.method = method.to_string();
        self.request_uri = url.to_string();
    }

    fn on_path(&mut self, path: &str) {
        self.raw_path = path.to_string();
    }

    fn on_query_string(&mut self, query: &str) {
        self.query_string = Some(query.to_string());
    }

    fn on_header_field(&mut self, name: &[u8]) {
        self.pending_field = Some(String::from_utf8_lossy(name).into_owned());
    }

    fn on_header_value(&mut self, value: &[u8]) {
        if let Some(name) = self.pending_field.take() {
            self.headers
                .entry(name)
                .or_insert_with(|| String::from_utf8_lossy(value).into_owned());
        }
    }

    fn on_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    fn on_message_complete(&mut self, version: Version) {
        self.version = version.number();
        self.vpath = normalize(&self.raw_path);
    }
}

/// Text after the last `.` of the final path segment.
fn extension_of(vpath: &str) -> &str {
    let name = vpath.rsplit('/').next().unwrap_or(vpath);
    name.rsplit_once('.').map_or("", |(_, extension)| extension)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs;

    use test_case::test_case;

    use crate::parser::RequestParser;

    fn parse(raw: &[u8]) -> Request {
        let mut parser = RequestParser::new();
        let mut request = Request::default();
        parser.execute(raw, &mut request).unwrap();
        assert!(parser.is_complete());
        request
    }

    #[test_case("/style.css", "css")]
    #[test_case("/a.b/c", "" ; "dot in directory only")]
    #[test_case("/archive.tar.gz", "gz")]
    #[test_case("/", "")]
    #[test_case("/dir/index.php", "php")]
    fn extension(vpath: &str, expected: &str) {
        assert_eq!(extension_of(vpath), expected);
    }

    #[test]
    fn fields_from_parser() {
        let request = parse(
            b"POST /a/./b/../c%20d.php?x=1 HTTP/1.0\r\n\
              Host: example\r\n\
              Cookie: first\r\n\
              Cookie: second\r\n\
              Content-Length: 3\r\n\r\nabc",
        );
        assert_eq!(request.method, "POST");
        assert_eq!(request.version, 100);
        assert_eq!(request.version_string(), "HTTP/1.0");
        assert_eq!(request.request_uri, "/a/./b/../c%20d.php?x=1");
        assert_eq!(request.query_string.as_deref(), Some("x=1"));
        assert_eq!(request.vpath, "/a/c d.php");
        assert_eq!(request.header("Host"), Some("example"));
        assert_eq!(request.header("host"), None);
        assert_eq!(request.header("Cookie"), Some("first"));
        assert_eq!(request.body, b"abc");
    }

    #[test]
    fn resolve_updates_vpath_and_path_info() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("script.php"), "").unwrap();
        fs::create_dir(root.path().join("dir")).unwrap();
        fs::write(root.path().join("dir/index.html"), "").unwrap();

        let mut request = parse(b"GET /script.php/extra/path HTTP/1.1\r\n\r\n");
        request.resolve(root.path(), &["index.html", "index.php"]);
        assert_eq!(request.vpath, "/script.php");
        assert_eq!(request.path_info.as_deref(), Some("/extra/path"));
        assert_eq!(request.extension, "php");
        assert_eq!(request.path_translated, Some(root.path().join("script.php")));
        assert!(request.metadata.is_some());

        let mut request = parse(b"GET /dir HTTP/1.1\r\n\r\n");
        request.resolve(root.path(), &["index.html", "index.php"]);
        assert_eq!(request.vpath, "/dir/index.html");
        assert_eq!(request.extension, "html");

        let mut request = parse(b"GET /missing.txt HTTP/1.1\r\n\r\n");
        request.resolve(root.path(), &["index.html", "index.php"]);
        assert_eq!(request.vpath, "/missing.txt");
        assert_eq!(request.extension, "txt");
        assert!(request.path_translated.is_none());
        assert!(request.metadata.is_none());
    }
}
