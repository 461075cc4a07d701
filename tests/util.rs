#![allow(dead_code)]

use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use tempfile::{tempdir, TempDir};

pub const BINARY: &str = env!("CARGO_BIN_EXE_devhttpd");

pub fn docroot() -> TempDir {
    tempdir().expect("failed to create tempdir")
}

pub fn write_file(root: &Path, name: &str, contents: impl AsRef<[u8]>) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("failed to create directory");
    }
    fs::write(path, contents).expect("failed to write file");
}

/// Write a shell script, executable.
pub fn write_script(root: &Path, name: &str, contents: &str) {
    write_file(root, name, contents);
    fs::set_permissions(root.join(name), fs::Permissions::from_mode(0o755))
        .expect("failed to make script executable");
}

/// A running server process, killed on drop.
pub struct Server {
    child: Child,
    _stdout: BufReader<ChildStdout>,
    port: u16,
    root: TempDir,
}

impl Server {
    pub fn start(root: TempDir) -> Self {
        Self::with_args(root, &[])
    }

    pub fn with_args(root: TempDir, args: &[&str]) -> Self {
        let mut child = Command::new(BINARY)
            .args(["-S", "127.0.0.1:0", "-i", "/bin/sh", "-t"])
            .arg(root.path())
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn server");
        let mut stdout = BufReader::new(child.stdout.take().expect("no stdout"));
        let port = match read_port(&mut stdout) {
            Some(port) => port,
            None => {
                child.kill().ok();
                child.wait().ok();
                panic!("server did not report its port");
            }
        };
        Self {
            child,
            _stdout: stdout,
            port,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    pub fn stream(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect");
        // keep a broken server from hanging the tests
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send `raw` and read until the server closes the connection.
    pub fn request(&self, raw: &[u8]) -> Vec<u8> {
        let mut stream = self.stream();
        stream.write_all(raw).unwrap();
        read_to_close(&mut stream).unwrap()
    }

    pub fn get(&self, path: &str) -> Response {
        Response::parse(&self.request(
            format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes(),
        ))
    }

    /// Wait for the process to exit by itself.
    pub fn wait(mut self, timeout: Duration) -> Option<ExitStatus> {
        wait_timeout(&mut self.child, timeout)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

fn read_port<R: BufRead>(stdout: &mut R) -> Option<u16> {
    for line in stdout.lines() {
        let line = line.ok()?;
        if let Some(address) = line.strip_prefix("Listening on ") {
            return address.rsplit(':').next()?.parse().ok();
        }
    }
    None
}

pub fn wait_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().expect("failed to wait") {
            return Some(status);
        }
        sleep(Duration::from_millis(10));
    }
    None
}

pub fn read_to_close(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut received = Vec::new();
    stream.read_to_end(&mut received)?;
    Ok(received)
}

/// A response read to connection close.
#[derive(Debug)]
pub struct Response {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn parse(raw: &[u8]) -> Self {
        let split = raw
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .expect("response has no header block");
        let head = std::str::from_utf8(&raw[..split]).expect("header is not valid UTF-8");
        let mut lines = head.split("\r\n");
        let status_line = lines.next().expect("no status line").to_string();
        let headers = lines
            .map(|line| {
                let (name, value) = line.split_once(": ").expect("invalid header");
                (name.to_string(), value.to_string())
            })
            .collect();
        Self {
            status_line,
            headers,
            body: raw[split + 4..].to_vec(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status_line
            .split(' ')
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("invalid status line")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).expect("body is not valid UTF-8")
    }
}
