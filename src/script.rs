//! The interface to script execution, and a CGI-style engine that runs scripts as commands.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use thiserror::Error;
use tracing::{debug, warn};

use crate::request::Request;
use crate::response::DEFAULT_STYLE;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to run {path:?}: {source}")]
    Spawn { path: PathBuf, source: io::Error },
    #[error("failed to collect script output: {0}")]
    Io(#[from] io::Error),
    #[error("script failed with {0}")]
    Failed(ExitStatus),
}

/// Where a script's response goes.
pub trait ResponseSink {
    fn set_status(&mut self, code: u16);
    /// A complete `Name: value` header line, without line terminator.
    fn add_header(&mut self, line: &str);
    fn write(&mut self, data: &[u8]);
}

/// Holds a response until it is known whether to send it.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    pub status: Option<u16>,
    pub headers: Vec<String>,
    pub body: Vec<u8>,
}

impl BufferedResponse {
    /// Pass everything on to `sink` in the order a script would have.
    pub fn replay(self, sink: &mut dyn ResponseSink) {
        if let Some(code) = self.status {
            sink.set_status(code);
        }
        for line in &self.headers {
            sink.add_header(line);
        }
        if !self.body.is_empty() {
            sink.write(&self.body);
        }
    }
}

impl ResponseSink for BufferedResponse {
    fn set_status(&mut self, code: u16) {
        self.status = Some(code);
    }

    fn add_header(&mut self, line: &str) {
        self.headers.push(line.to_string());
    }

    fn write(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterVerdict {
    /// The router produced the response.
    Handled,
    /// Fall through to script or static handling; router output is discarded.
    Declined,
}

/// Everything a script gets to see about the request being served.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub request: &'a Request,
    pub document_root: &'a Path,
    /// Host the server is bound to, as given on the command line.
    pub server_host: &'a str,
    pub server_port: u16,
    pub peer: SocketAddr,
}

impl RequestContext<'_> {
    pub fn content_type(&self) -> Option<&str> {
        self.request.header("Content-Type")
    }

    /// Server variables exposed to scripts.
    pub fn server_vars(&self) -> Vec<(String, String)> {
        let request = self.request;
        let mut vars = vec![
            var("DOCUMENT_ROOT", self.document_root.display()),
            var(
                "HTTP_HOST",
                format!("{}:{}", self.server_host, self.server_port),
            ),
        ];
        if let Some(cookie) = request.header("Cookie") {
            vars.push(var("HTTP_COOKIE", cookie));
        }
        if let Some(referer) = request.header("Referer") {
            vars.push(var("HTTP_REFERER", referer));
        }
        vars.push(var("REQUEST_URI", &request.request_uri));
        vars.push(var("REQUEST_METHOD", &request.method));
        vars.push(var("PHP_SELF", &request.vpath));
        if let Some(path) = &request.path_translated {
            vars.push(var("SCRIPT_FILENAME", path.display()));
        }
        if let Some(path_info) = &request.path_info {
            vars.push(var("PATH_INFO", path_info));
        }
        if let Some(query) = &request.query_string {
            vars.push(var("QUERY_STRING", query));
        }
        vars.push(var("REMOTE_ADDR", self.peer.ip()));
        vars
    }
}

fn var(name: &str, value: impl ToString) -> (String, String) {
    (name.to_string(), value.to_string())
}

pub trait ScriptEngine {
    /// Run the router script. An `Err` is treated as a decline by the dispatcher.
    fn route(
        &mut self,
        router: &Path,
        context: &RequestContext<'_>,
        sink: &mut dyn ResponseSink,
    ) -> Result<RouterVerdict, ScriptError>;

    /// Run the script at the request's translated path.
    fn execute(
        &mut self,
        context: &RequestContext<'_>,
        sink: &mut dyn ResponseSink,
    ) -> Result<(), ScriptError>;

    /// Emit the stylesheet used by generated error pages.
    fn print_style(&mut self, sink: &mut dyn ResponseSink) -> Result<(), ScriptError> {
        sink.write(DEFAULT_STYLE.as_bytes());
        Ok(())
    }
}

/// Runs scripts as child processes with a CGI/1.1 environment.
///
/// Scripts are run directly, or as an argument to `interpreter` when one is set. A router that
/// exits non-zero declines the request.
#[derive(Debug, Default)]
pub struct CommandEngine {
    interpreter: Option<PathBuf>,
}

struct Output {
    status: ExitStatus,
    stdout: Vec<u8>,
}

impl CommandEngine {
    pub fn new(interpreter: Option<PathBuf>) -> Self {
        Self { interpreter }
    }

    fn run(&self, script: &Path, context: &RequestContext<'_>) -> Result<Output, ScriptError> {
        let mut command = match &self.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(script);
                command
            }
            None => Command::new(script),
        };
        command
            .env_clear()
            .envs(std::env::var_os("PATH").map(|path| ("PATH", path)))
            .envs(cgi_environment(script, context))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let spawn_error = |source| ScriptError::Spawn {
            path: script.to_path_buf(),
            source,
        };
        let mut child = command.spawn().map_err(spawn_error)?;
        debug!("started {} as pid {}", script.display(), child.id());

        // feed the body from another thread so a chatty script can't deadlock us
        let writer = child.stdin.take().map(|mut stdin| {
            let body = context.request.body.clone();
            thread::spawn(move || {
                if let Err(e) = stdin.write_all(&body) {
                    debug!("script did not read its whole input: {}", e);
                }
            })
        });
        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            let _ = writer.join();
        }
        Ok(Output {
            status: output.status,
            stdout: output.stdout,
        })
    }
}

impl ScriptEngine for CommandEngine {
    fn route(
        &mut self,
        router: &Path,
        context: &RequestContext<'_>,
        sink: &mut dyn ResponseSink,
    ) -> Result<RouterVerdict, ScriptError> {
        let output = self.run(router, context)?;
        if !output.status.success() {
            return Ok(RouterVerdict::Declined);
        }
        emit_cgi_output(&output.stdout, sink);
        Ok(RouterVerdict::Handled)
    }

    fn execute(
        &mut self,
        context: &RequestContext<'_>,
        sink: &mut dyn ResponseSink,
    ) -> Result<(), ScriptError> {
        let script = context.request.path_translated.as_deref().ok_or_else(|| {
            ScriptError::Io(io::Error::new(io::ErrorKind::NotFound, "no script to run"))
        })?;
        let output = self.run(script, context)?;
        if !output.status.success() {
            if output.stdout.is_empty() {
                return Err(ScriptError::Failed(output.status));
            }
            warn!("{} exited with {}", script.display(), output.status);
        }
        emit_cgi_output(&output.stdout, sink);
        Ok(())
    }
}

/// Environment for a CGI/1.1 script: the server variables plus the protocol ones.
pub fn cgi_environment(script: &Path, context: &RequestContext<'_>) -> Vec<(String, String)> {
    let request = context.request;
    let mut env = context.server_vars();
    env.push(var("GATEWAY_INTERFACE", "CGI/1.1"));
    env.push(var(
        "SERVER_SOFTWARE",
        format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    ));
    env.push(var("SERVER_PROTOCOL", request.version_string()));
    env.push(var("SERVER_NAME", context.server_host));
    env.push(var("SERVER_PORT", context.server_port));
    env.push(var("REMOTE_PORT", context.peer.port()));
    env.push(var("SCRIPT_NAME", &request.vpath));
    env.push(var("REDIRECT_STATUS", 200));
    if !env.iter().any(|(name, _)| name == "SCRIPT_FILENAME") {
        env.push(var("SCRIPT_FILENAME", script.display()));
    }
    if let Some(content_type) = context.content_type() {
        env.push(var("CONTENT_TYPE", content_type));
    }
    if !request.body.is_empty() {
        env.push(var("CONTENT_LENGTH", request.body.len()));
    }

    let mut headers: Vec<_> = request.headers.iter().collect();
    headers.sort();
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-type") || name.eq_ignore_ascii_case("content-length")
        {
            continue;
        }
        let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        if !env.iter().any(|(existing, _)| *existing == key) {
            env.push((key, value.clone()));
        }
    }
    env
}

/// Split CGI output into its header block and body and hand both to `sink`.
///
/// Output that doesn't start with a header block is all body.
pub fn emit_cgi_output(output: &[u8], sink: &mut dyn ResponseSink) {
    let (headers, body) = split_cgi_output(output);
    for line in headers {
        match line.split_once(':') {
            Some((name, value)) if name.eq_ignore_ascii_case("status") => {
                let code = value.trim().split(' ').next().and_then(|c| c.parse().ok());
                match code {
                    Some(code) => sink.set_status(code),
                    None => warn!("ignoring bad Status header from script: {}", line),
                }
            }
            _ => sink.add_header(line),
        }
    }
    sink.write(body);
}

fn split_cgi_output(output: &[u8]) -> (Vec<&str>, &[u8]) {
    let mut headers = Vec::new();
    let mut rest = output;
    loop {
        let end = match rest.iter().position(|&b| b == b'\n') {
            Some(end) => end,
            None => return (Vec::new(), output),
        };
        let line = &rest[..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        rest = &rest[end + 1..];
        if line.is_empty() {
            return (headers, rest);
        }
        match std::str::from_utf8(line) {
            Ok(line) if is_header_line(line) => headers.push(line),
            _ => return (Vec::new(), output),
        }
    }
}

fn is_header_line(line: &str) -> bool {
    match line.split_once(':') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        }
        None => false,
    }
}
