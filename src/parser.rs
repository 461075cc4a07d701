//! Incremental HTTP/1.x request parser.
//!
//! The parser is fed whatever `recv` returned and reports the pieces of the request through
//! [`ParserCallbacks`] as soon as they are complete. It never needs the whole request at once.

use thiserror::Error;

/// Upper bound on the request line plus headers.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Upper bound on the decoded request body.
pub const MAX_BODY_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request line")]
    RequestLine,
    #[error("invalid method")]
    Method,
    #[error("unsupported protocol version")]
    Version,
    #[error("malformed header line")]
    Header,
    #[error("invalid Content-Length")]
    ContentLength,
    #[error("invalid chunk size")]
    ChunkSize,
    #[error("request header too large")]
    HeaderTooLarge,
    #[error("request body too large")]
    BodyTooLarge,
}

/// Protocol version from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_1_0: Self = Self { major: 1, minor: 0 };
    pub const HTTP_1_1: Self = Self { major: 1, minor: 1 };

    /// `major * 100 + minor`.
    pub fn number(self) -> u32 {
        u32::from(self.major) * 100 + u32::from(self.minor)
    }
}

/// Receives the parts of a request. All methods default to doing nothing.
pub trait ParserCallbacks {
    /// Method and raw request target, once the request line is complete.
    fn on_url(&mut self, _method: &str, _url: &str) {}
    fn on_path(&mut self, _path: &str) {}
    fn on_query_string(&mut self, _query: &str) {}
    fn on_fragment(&mut self, _fragment: &str) {}
    fn on_header_field(&mut self, _name: &[u8]) {}
    /// Value for the most recent header field.
    fn on_header_value(&mut self, _value: &[u8]) {}
    fn on_headers_complete(&mut self) {}
    /// A piece of the (de-chunked) body. May be called many times.
    fn on_body(&mut self, _data: &[u8]) {}
    fn on_message_complete(&mut self, _version: Version) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Headers,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Complete,
}

#[derive(Debug)]
pub struct RequestParser {
    state: State,
    /// Partial line carried over between calls.
    line: Vec<u8>,
    head_len: usize,
    version: Version,
    content_length: Option<u64>,
    chunked: bool,
    /// Sum of the chunk sizes announced so far.
    chunked_len: u64,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self {
            state: State::RequestLine,
            line: Vec::new(),
            head_len: 0,
            version: Version::HTTP_1_0,
            content_length: None,
            chunked: false,
            chunked_len: 0,
        }
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Parse `data`, invoking `callbacks` along the way.
    ///
    /// Returns the number of bytes consumed. This is less than `data.len()` only when the
    /// message completed before the end of `data`.
    pub fn execute<C: ParserCallbacks>(
        &mut self,
        data: &[u8],
        callbacks: &mut C,
    ) -> Result<usize, ParseError> {
        let mut pos = 0;
        while pos < data.len() {
            match self.state {
                State::Complete => break,
                State::Body { remaining } => {
                    let n = take_len(remaining, data.len() - pos);
                    callbacks.on_body(&data[pos..pos + n]);
                    pos += n;
                    let remaining = remaining - n as u64;
                    if remaining == 0 {
                        self.finish(callbacks);
                    } else {
                        self.state = State::Body { remaining };
                    }
                }
                State::ChunkData { remaining } => {
                    let n = take_len(remaining, data.len() - pos);
                    callbacks.on_body(&data[pos..pos + n]);
                    pos += n;
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        State::ChunkDataEnd
                    } else {
                        State::ChunkData { remaining }
                    };
                }
                _ => match data[pos..].iter().position(|&b| b == b'\n') {
                    Some(i) => {
                        let end = pos + i + 1;
                        self.buffer_line(&data[pos..end])?;
                        pos = end;
                        let mut line = std::mem::take(&mut self.line);
                        let result = self.process_line(trim_eol(&line), callbacks);
                        line.clear();
                        self.line = line;
                        result?;
                    }
                    None => {
                        self.buffer_line(&data[pos..])?;
                        pos = data.len();
                    }
                },
            }
        }
        Ok(pos)
    }

    fn buffer_line(&mut self, bytes: &[u8]) -> Result<(), ParseError> {
        if matches!(
            self.state,
            State::RequestLine | State::Headers | State::Trailers
        ) {
            self.head_len += bytes.len();
            if self.head_len > MAX_HEAD_SIZE {
                return Err(ParseError::HeaderTooLarge);
            }
        }
        if self.line.len() + bytes.len() > MAX_HEAD_SIZE {
            return Err(ParseError::HeaderTooLarge);
        }
        self.line.extend_from_slice(bytes);
        Ok(())
    }

    fn process_line<C: ParserCallbacks>(
        &mut self,
        line: &[u8],
        callbacks: &mut C,
    ) -> Result<(), ParseError> {
        match self.state {
            State::RequestLine => {
                // tolerate stray blank lines ahead of the request
                if !line.is_empty() {
                    self.parse_request_line(line, callbacks)?;
                    self.state = State::Headers;
                }
            }
            State::Headers => {
                if line.is_empty() {
                    callbacks.on_headers_complete();
                    self.begin_body(callbacks);
                } else {
                    self.parse_header(line, callbacks)?;
                }
            }
            State::ChunkSize => {
                let size = parse_chunk_size(line)?;
                self.chunked_len = self.chunked_len.saturating_add(size);
                if self.chunked_len > MAX_BODY_SIZE {
                    return Err(ParseError::BodyTooLarge);
                }
                self.state = if size == 0 {
                    State::Trailers
                } else {
                    State::ChunkData { remaining: size }
                };
            }
            State::ChunkDataEnd => {
                if !line.is_empty() {
                    return Err(ParseError::ChunkSize);
                }
                self.state = State::ChunkSize;
            }
            State::Trailers => {
                if line.is_empty() {
                    self.finish(callbacks);
                }
            }
            State::Body { .. } | State::ChunkData { .. } | State::Complete => {}
        }
        Ok(())
    }

    fn parse_request_line<C: ParserCallbacks>(
        &mut self,
        line: &[u8],
        callbacks: &mut C,
    ) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::RequestLine)?;
        let mut parts = line.split(' ');
        let (method, target, protocol) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(target), Some(protocol)) if parts.next().is_none() => {
                (method, target, protocol)
            }
            _ => return Err(ParseError::RequestLine),
        };
        if method.is_empty() || !method.bytes().all(is_token_byte) {
            return Err(ParseError::Method);
        }
        self.version = parse_version(protocol)?;

        let path_and_query = origin_form(target).ok_or(ParseError::RequestLine)?;
        callbacks.on_url(method, target);
        let (rest, fragment) = match path_and_query.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment)),
            None => (path_and_query, None),
        };
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };
        callbacks.on_path(path);
        if let Some(query) = query {
            callbacks.on_query_string(query);
        }
        if let Some(fragment) = fragment {
            callbacks.on_fragment(fragment);
        }
        Ok(())
    }

    fn parse_header<C: ParserCallbacks>(
        &mut self,
        line: &[u8],
        callbacks: &mut C,
    ) -> Result<(), ParseError> {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::Header)?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().copied().all(is_token_byte) {
            return Err(ParseError::Header);
        }
        let value = trim_ows(&line[colon + 1..]);
        callbacks.on_header_field(name);
        callbacks.on_header_value(value);

        if name.eq_ignore_ascii_case(b"content-length") {
            let length = std::str::from_utf8(value)
                .ok()
                .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|v| v.parse::<u64>().ok())
                .ok_or(ParseError::ContentLength)?;
            if length > MAX_BODY_SIZE {
                return Err(ParseError::BodyTooLarge);
            }
            match self.content_length {
                Some(previous) if previous != length => return Err(ParseError::ContentLength),
                _ => self.content_length = Some(length),
            }
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            self.chunked = value
                .rsplit(|&b| b == b',')
                .next()
                .map(|coding| trim_ows(coding).eq_ignore_ascii_case(b"chunked"))
                .unwrap_or(false);
        }
        Ok(())
    }

    fn begin_body<C: ParserCallbacks>(&mut self, callbacks: &mut C) {
        if self.chunked {
            self.state = State::ChunkSize;
        } else {
            match self.content_length {
                Some(length) if length > 0 => self.state = State::Body { remaining: length },
                _ => self.finish(callbacks),
            }
        }
    }

    fn finish<C: ParserCallbacks>(&mut self, callbacks: &mut C) {
        self.state = State::Complete;
        callbacks.on_message_complete(self.version);
    }
}

fn take_len(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |remaining| remaining.min(available))
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

/// RFC 7230 `tchar`.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn parse_version(protocol: &str) -> Result<Version, ParseError> {
    match protocol.strip_prefix("HTTP/").map(str::as_bytes) {
        Some(&[major, b'.', minor]) if major.is_ascii_digit() && minor.is_ascii_digit() => {
            Ok(Version {
                major: major - b'0',
                minor: minor - b'0',
            })
        }
        _ => Err(ParseError::Version),
    }
}

/// Path and query of a request target, dropping the scheme and authority of absolute-form.
fn origin_form(target: &str) -> Option<&str> {
    if target.starts_with('/') || target == "*" {
        return Some(target);
    }
    let (scheme, rest) = target.split_once("://")?;
    if scheme.is_empty() || !scheme.bytes().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }
    match rest.find(|c| matches!(c, '/' | '?' | '#')) {
        Some(i) if rest.as_bytes()[i] == b'/' => Some(&rest[i..]),
        _ => Some("/"),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let size = line.split(|&b| b == b';').next().unwrap_or_default();
    let size = std::str::from_utf8(trim_ows(size)).map_err(|_| ParseError::ChunkSize)?;
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ParseError::ChunkSize);
    }
    u64::from_str_radix(size, 16).map_err(|_| ParseError::ChunkSize)
}
