//! The event loop and the dispatcher that turns a complete request into a response.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::buffer::SendStatus;
use crate::config::Config;
use crate::connection::{Connection, ResponseWriter};
use crate::listener::listen;
use crate::request::{Request, RequestError};
use crate::reactor::{Interest, Reactor};
use crate::response::{content_type_value, fixed_length_header, MimeMap};
use crate::script::{BufferedResponse, RequestContext, RouterVerdict, ScriptEngine};

/// Longest the loop waits before rechecking the shutdown token.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Where requests are served from, fixed once the listener is bound.
#[derive(Debug)]
pub struct Site {
    pub host: String,
    pub port: u16,
    pub document_root: PathBuf,
    pub router: Option<PathBuf>,
    pub script_extension: String,
    pub index_files: Vec<String>,
    pub mime_map: MimeMap,
}

impl Site {
    fn context<'a>(&'a self, request: &'a Request, peer: SocketAddr) -> RequestContext<'a> {
        RequestContext {
            request,
            document_root: &self.document_root,
            server_host: &self.host,
            server_port: self.port,
            peer,
        }
    }
}

/// What to do with a connection after handling an event.
#[derive(Debug, PartialEq, Eq)]
pub enum Next {
    /// Wait for more of the request.
    Read,
    /// A response is buffered; wait for the socket to take it.
    Send,
    Close,
}

/// Route a complete request and leave its response in the connection's sender.
pub fn dispatch(conn: &mut Connection, site: &Site, engine: &mut dyn ScriptEngine) -> Next {
    if let Some(router) = &site.router {
        let mut routed = BufferedResponse::default();
        let context = site.context(&conn.request, conn.peer);
        match engine.route(router, &context, &mut routed) {
            Ok(RouterVerdict::Handled) => {
                let mut writer = conn.writer();
                routed.replay(&mut writer);
                writer.finish();
                return Next::Send;
            }
            Ok(RouterVerdict::Declined) => {}
            Err(e) => warn!("{}: router failed: {}", conn.peer, e),
        }
    }

    if conn.request.extension == site.script_extension && conn.request.path_translated.is_some() {
        execute_script(conn, site, engine)
    } else {
        send_static(conn, site, engine)
    }
}

fn execute_script(conn: &mut Connection, site: &Site, engine: &mut dyn ScriptEngine) -> Next {
    let context = site.context(&conn.request, conn.peer);
    let mut writer = ResponseWriter {
        output: &mut conn.output,
        request: &conn.request,
    };
    match engine.execute(&context, &mut writer) {
        Ok(()) => {
            writer.finish();
            Next::Send
        }
        Err(e) => {
            warn!("{}: {} - {}", conn.peer, conn.request.request_uri, e);
            if conn.output.headers_sent() {
                Next::Send
            } else {
                send_error_page(conn, 500, engine)
            }
        }
    }
}

fn send_static(conn: &mut Connection, site: &Site, engine: &mut dyn ScriptEngine) -> Next {
    let opened = match &conn.request.path_translated {
        Some(path) => OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .and_then(|file| file.metadata().map(|meta| (file, meta.len()))),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "No such file or directory",
        )),
    };
    let (file, length) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            info!("{}: {} - {}", conn.peer, conn.request.request_uri, e);
            return send_error_page(conn, 404, engine);
        }
    };

    let mimetype = site
        .mime_map
        .extension_content_type(&conn.request.extension);
    let header = fixed_length_header(
        conn.request.version,
        200,
        conn.request.header("Host"),
        &content_type_value(mimetype),
        length,
    );
    conn.output.sender.buffer.append(header);
    conn.output.sender.stream_file(file);
    Next::Send
}

fn send_error_page(conn: &mut Connection, code: u16, engine: &mut dyn ScriptEngine) -> Next {
    match conn.send_error_page(code, engine) {
        Ok(()) => Next::Send,
        Err(e) => {
            warn!("{}: failed to build error page: {}", conn.peer, e);
            Next::Close
        }
    }
}

pub struct Server {
    listener: TcpListener,
    reactor: Reactor,
    site: Site,
    engine: Box<dyn ScriptEngine>,
    connections: HashMap<RawFd, Connection>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Bind the listener described by `config`.
    pub fn bind(config: &Config, engine: Box<dyn ScriptEngine>) -> Result<Self> {
        let bound = listen(&config.host, config.port)?;
        debug!(
            "listening on {:?} with {:?}",
            bound.listener.local_addr(),
            bound.domain
        );
        let site = Site {
            host: config.host.clone(),
            port: bound.port,
            document_root: config.document_root.clone(),
            router: config.router.clone(),
            script_extension: config.script_extension.clone(),
            index_files: config.index_files(),
            mime_map: MimeMap::default(),
        };
        Ok(Self {
            listener: bound.listener,
            reactor: Reactor::new().context("failed to create poller")?,
            site,
            engine,
            connections: HashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn host(&self) -> &str {
        &self.site.host
    }

    /// Bound port; differs from the configured one when that was 0.
    pub fn port(&self) -> u16 {
        self.site.port
    }

    pub fn document_root(&self) -> &Path {
        &self.site.document_root
    }

    /// Setting this makes [`Server::run`] return after its current wake-up.
    pub fn shutdown_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Serve until the shutdown token is set.
    pub fn run(&mut self) -> Result<()> {
        let listener_fd = self.listener.as_raw_fd();
        self.reactor
            .watch(listener_fd, Interest::Read)
            .context("failed to watch listener")?;

        while !self.shutdown.load(Ordering::Relaxed) {
            let ready = match self.reactor.wait(POLL_TIMEOUT) {
                Ok(ready) => ready,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to wait for events"),
            };

            if ready
                .iter()
                .any(|(fd, readiness)| *fd == listener_fd && readiness.readable)
            {
                self.accept_connection();
            }
            for (fd, readiness) in ready {
                if fd == listener_fd {
                    continue;
                }
                if readiness.readable {
                    self.on_readable(fd);
                }
                if readiness.writable {
                    self.on_writable(fd);
                }
            }
        }

        self.reactor.unwatch(listener_fd, Interest::Read)?;
        for fd in self.connections.keys().copied().collect::<Vec<_>>() {
            self.close_connection(fd);
        }
        Ok(())
    }

    fn accept_connection(&mut self) {
        let (socket, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("Failed to accept a client (reason: {})", e);
                return;
            }
        };
        if let Err(e) = socket.set_nonblocking(true) {
            warn!("{}: failed to set non-blocking mode: {}", peer, e);
            return;
        }
        let fd = socket.as_raw_fd();
        if let Err(e) = self.reactor.watch(fd, Interest::Read) {
            warn!("{}: failed to watch: {}", peer, e);
            return;
        }
        debug!("{}: Accepted", peer);
        self.connections.insert(fd, Connection::new(socket, peer));
        // read straight away rather than going through another wait
        self.on_readable(fd);
    }

    fn on_readable(&mut self, fd: RawFd) {
        let conn = match self.connections.get_mut(&fd) {
            Some(conn) if !conn.request_read() => conn,
            _ => return,
        };
        let next = match conn.read_request(&self.site.document_root, &self.site.index_files) {
            Ok(false) => Next::Read,
            Ok(true) => {
                info!("{}: {}", conn.peer, conn.request.request_uri);
                match self.reactor.unwatch(fd, Interest::Read) {
                    Ok(()) => dispatch(conn, &self.site, self.engine.as_mut()),
                    Err(e) => {
                        warn!("{}: failed to unwatch: {}", conn.peer, e);
                        Next::Close
                    }
                }
            }
            Err(RequestError::UnexpectedEof) => {
                debug!("{}: Unexpected EOF", conn.peer);
                Next::Close
            }
            Err(e) => {
                info!("{}: Invalid request ({})", conn.peer, e);
                Next::Close
            }
        };
        self.follow(fd, next);
    }

    fn on_writable(&mut self, fd: RawFd) {
        let conn = match self.connections.get_mut(&fd) {
            Some(conn) => conn,
            None => return,
        };
        let next = match conn.on_writable() {
            Ok(SendStatus::Pending) => Next::Send,
            Ok(SendStatus::Finished) => Next::Close,
            Err(e) => {
                debug!("{}: send failed: {}", conn.peer, e);
                Next::Close
            }
        };
        if next == Next::Close {
            self.close_connection(fd);
        }
    }

    fn follow(&mut self, fd: RawFd, next: Next) {
        match next {
            Next::Read => {}
            Next::Send => {
                if !self.reactor.is_watched(fd, Interest::Write) {
                    if let Err(e) = self.reactor.watch(fd, Interest::Write) {
                        warn!("failed to watch for writes: {}", e);
                        self.close_connection(fd);
                    }
                }
            }
            Next::Close => self.close_connection(fd),
        }
    }

    fn close_connection(&mut self, fd: RawFd) {
        if let Some(conn) = self.connections.remove(&fd) {
            for interest in [Interest::Read, Interest::Write] {
                if let Err(e) = self.reactor.unwatch(fd, interest) {
                    debug!("{}: failed to unwatch: {}", conn.peer, e);
                }
            }
            debug!("{}: Closing", conn.peer);
        }
    }
}
