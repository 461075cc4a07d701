//! Per-client state: the socket, the request being read, and the response being sent.

use std::io::{self, Read};
use std::mem;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;

use tracing::{info, warn};

use crate::buffer::{Chunk, ChunkBuffer, ContentSender, SendStatus};
use crate::parser::RequestParser;
use crate::request::{Request, RequestError};
use crate::response::{essential_headers, status_line, ErrorPage};
use crate::script::{ResponseSink, ScriptEngine, ScriptError};

const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// Response state a script writes into.
#[derive(Debug)]
pub struct Output {
    pub sender: ContentSender,
    /// While set, written bytes go to `capture` instead of the client.
    capturing: bool,
    capture: ChunkBuffer,
    status: u16,
    headers: Vec<String>,
    headers_sent: bool,
}

impl Default for Output {
    fn default() -> Self {
        Self {
            sender: ContentSender::new(),
            capturing: false,
            capture: ChunkBuffer::new(),
            status: 200,
            headers: Vec::new(),
            headers_sent: false,
        }
    }
}

impl Output {
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    fn begin_capture(&mut self) {
        self.capturing = true;
    }

    fn end_capture(&mut self) -> ChunkBuffer {
        self.capturing = false;
        mem::take(&mut self.capture)
    }
}

/// A [`ResponseSink`] that sends script output to the client.
///
/// The header block goes out ahead of the first body bytes, or at [`ResponseWriter::finish`].
pub struct ResponseWriter<'a> {
    pub output: &'a mut Output,
    pub request: &'a Request,
}

impl ResponseWriter<'_> {
    fn send_headers(&mut self) {
        if self.output.headers_sent {
            return;
        }
        let mut header = status_line(self.request.version, self.output.status);
        header.push_str(&essential_headers(self.request.header("Host")));
        let mut has_content_type = false;
        for line in &self.output.headers {
            has_content_type |= line
                .split(':')
                .next()
                .map_or(false, |name| name.trim().eq_ignore_ascii_case("content-type"));
            header.push_str(line);
            header.push_str("\r\n");
        }
        if !has_content_type {
            header.push_str("Content-Type: text/html; charset=UTF-8\r\n");
        }
        header.push_str("\r\n");
        self.output.sender.buffer.append(header);
        self.output.headers_sent = true;
    }

    /// Flush the header block even if the script wrote no body.
    pub fn finish(&mut self) {
        if !self.output.capturing {
            self.send_headers();
        }
    }
}

impl ResponseSink for ResponseWriter<'_> {
    fn set_status(&mut self, code: u16) {
        if self.output.headers_sent {
            warn!("status {} set after headers were sent", code);
        } else {
            self.output.status = code;
        }
    }

    fn add_header(&mut self, line: &str) {
        if self.output.headers_sent {
            warn!("header set after headers were sent: {}", line);
        } else {
            self.output.headers.push(line.to_string());
        }
    }

    fn write(&mut self, data: &[u8]) {
        if self.output.capturing {
            self.output.capture.append(Chunk::owned(data));
            return;
        }
        self.send_headers();
        self.output.sender.buffer.append(Chunk::owned(data));
    }
}

#[derive(Debug)]
pub struct Connection {
    pub socket: TcpStream,
    pub peer: SocketAddr,
    parser: RequestParser,
    pub request: Request,
    pub output: Output,
    request_read: bool,
}

impl Connection {
    pub fn new(socket: TcpStream, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            parser: RequestParser::new(),
            request: Request::default(),
            output: Output::default(),
            request_read: false,
        }
    }

    pub fn request_read(&self) -> bool {
        self.request_read
    }

    /// Read what the socket has and feed it to the parser.
    ///
    /// Returns `Ok(true)` once the request is complete and resolved against `document_root`,
    /// `Ok(false)` when more bytes are needed.
    pub fn read_request<S: AsRef<str>>(
        &mut self,
        document_root: &Path,
        index_files: &[S],
    ) -> Result<bool, RequestError> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let received = match self.socket.read(&mut buf) {
            Ok(0) => return Err(RequestError::UnexpectedEof),
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(false)
            }
            Err(e) => return Err(e.into()),
        };
        self.parser.execute(&buf[..received], &mut self.request)?;
        if !self.parser.is_complete() {
            return Ok(false);
        }
        self.request.resolve(document_root, index_files);
        self.request_read = true;
        Ok(true)
    }

    /// Push pending output to the socket.
    pub fn on_writable(&mut self) -> io::Result<SendStatus> {
        self.output.sender.send(&mut self.socket)
    }

    /// Sink for script output bound to this connection.
    pub fn writer(&mut self) -> ResponseWriter<'_> {
        ResponseWriter {
            output: &mut self.output,
            request: &self.request,
        }
    }

    /// Replace any pending output with a generated error page for `code`.
    pub fn send_error_page(
        &mut self,
        code: u16,
        engine: &mut dyn ScriptEngine,
    ) -> Result<(), ScriptError> {
        self.output.begin_capture();
        let styled = engine.print_style(&mut self.writer());
        let mut style = self.output.end_capture();
        styled?;

        let mut page = ErrorPage {
            version: self.request.version,
            code,
            host: self.request.header("Host"),
            request_uri: &self.request.request_uri,
        }
        .render(&mut style);
        self.output.sender = ContentSender::new();
        self.output.sender.buffer.append_buffer(&mut page);
        info!(
            "{}: {} - Sending error page ({})",
            self.peer, self.request.request_uri, code
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs;
    use std::io::Write;
    use std::net::TcpListener;

    use crate::parser::ParseError;
    use crate::script::{RequestContext, RouterVerdict};

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (socket, peer) = listener.accept().unwrap();
        socket.set_nonblocking(true).unwrap();
        (Connection::new(socket, peer), client)
    }

    /// Run the sender until it finishes, close, and hand back what the client got.
    fn deliver(mut conn: Connection, client: &mut TcpStream) -> String {
        while conn.on_writable().unwrap() == SendStatus::Pending {}
        drop(conn);
        let mut received = String::new();
        client.read_to_string(&mut received).unwrap();
        received
    }

    struct StyledEngine;

    impl ScriptEngine for StyledEngine {
        fn route(
            &mut self,
            _router: &Path,
            _context: &RequestContext<'_>,
            _sink: &mut dyn ResponseSink,
        ) -> Result<RouterVerdict, ScriptError> {
            Ok(RouterVerdict::Declined)
        }

        fn execute(
            &mut self,
            _context: &RequestContext<'_>,
            _sink: &mut dyn ResponseSink,
        ) -> Result<(), ScriptError> {
            Ok(())
        }

        fn print_style(&mut self, sink: &mut dyn ResponseSink) -> Result<(), ScriptError> {
            sink.write(b"<style>");
            sink.write(b"</style>");
            Ok(())
        }
    }

    #[test]
    fn request_arrives_in_pieces() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.txt"), "a").unwrap();
        let (mut conn, mut client) = pair();
        let index: &[&str] = &["index.html"];

        // nothing to read yet
        assert!(!conn.read_request(root.path(), index).unwrap());
        client.write_all(b"GET /a.t").unwrap();
        for _ in 0..10 {
            assert!(!conn.read_request(root.path(), index).unwrap());
        }
        client.write_all(b"xt HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        assert!(read_until_done(&mut conn, root.path()).unwrap());
        assert!(conn.request_read());
        assert_eq!(conn.request.vpath, "/a.txt");
        assert_eq!(conn.request.extension, "txt");
        assert_eq!(conn.request.path_translated, Some(root.path().join("a.txt")));
    }

    fn read_until_done(conn: &mut Connection, root: &Path) -> Result<bool, RequestError> {
        for _ in 0..1000 {
            if conn.read_request(root, &["index.html"])? {
                return Ok(true);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Ok(false)
    }

    #[test]
    fn malformed_and_truncated_requests() {
        let (mut conn, mut client) = pair();
        client.write_all(b"NOT A REQUEST\r\n").unwrap();
        assert!(matches!(
            read_until_done(&mut conn, Path::new("/nonexistent")),
            Err(RequestError::Malformed(ParseError::Version))
        ));

        let (mut conn, mut client) = pair();
        client.write_all(b"GET / HTTP/1.1\r\n").unwrap();
        drop(client);
        assert!(matches!(
            read_until_done(&mut conn, Path::new("/nonexistent")),
            Err(RequestError::UnexpectedEof)
        ));
    }

    #[test]
    fn script_output_gets_a_header_block() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"GET /x.php HTTP/1.0\r\nHost: h:1\r\n\r\n")
            .unwrap();
        assert!(read_until_done(&mut conn, Path::new("/nonexistent")).unwrap());

        let mut writer = conn.writer();
        writer.set_status(201);
        writer.add_header("X-Thing: yes");
        writer.write(b"hello ");
        writer.set_status(500);
        writer.write(b"world");
        writer.finish();
        assert!(conn.output.headers_sent());

        let received = deliver(conn, &mut client);
        assert_eq!(
            received,
            "HTTP/1.0 201 Created\r\nHost: h:1\r\nConnection: closed\r\nX-Thing: yes\r\n\
             Content-Type: text/html; charset=UTF-8\r\n\r\nhello world"
        );
    }

    #[test]
    fn error_page_uses_captured_style() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"GET /missing?<b> HTTP/1.1\r\n\r\n")
            .unwrap();
        assert!(read_until_done(&mut conn, Path::new("/nonexistent")).unwrap());

        conn.send_error_page(404, &mut StyledEngine).unwrap();
        assert!(!conn.output.headers_sent());
        let received = deliver(conn, &mut client);
        let (head, body) = received.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\nConnection: closed\r\n"));
        assert!(head.ends_with(&format!("Content-Length: {}", body.len())));
        assert!(body.starts_with("<html><head><title>404 Not Found</title><style></style></head>"));
        assert!(body.contains("/missing?&lt;b&gt;"));
    }
}
