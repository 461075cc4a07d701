//! Listening socket setup.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};

use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
#[error("Failed to listen on {host}:{port} (reason: {reason})")]
pub struct ListenError {
    pub host: String,
    pub port: u16,
    pub reason: String,
}

/// A bound, listening, non-blocking socket.
#[derive(Debug)]
pub struct Bound {
    pub listener: TcpListener,
    /// Actual port, which differs from the requested one when that was 0.
    pub port: u16,
    pub domain: Domain,
}

/// Resolve `host` and listen on the first candidate address that binds.
pub fn listen(host: &str, port: u16) -> Result<Bound, ListenError> {
    let fail = |reason: String| ListenError {
        host: host.to_string(),
        port,
        reason,
    };

    let mut candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| fail(e.to_string()))?
        .collect();
    // stable sort keeps resolver order within each family
    candidates.sort_by_key(|addr| !addr.is_ipv6());

    let mut last_error = String::from("no usable address");
    for addr in candidates {
        match bind(addr) {
            Ok(socket) => return finish(socket, addr).map_err(|e| fail(e.to_string())),
            Err(e) if matches!(e.raw_os_error(), Some(libc::EADDRINUSE) | Some(libc::EINVAL)) => {
                return Err(fail(e.to_string()));
            }
            Err(e) => {
                debug!("bind to {} failed: {}", addr, e);
                last_error = e.to_string();
            }
        }
    }
    Err(fail(last_error))
}

fn bind(addr: SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

fn finish(socket: Socket, addr: SocketAddr) -> io::Result<Bound> {
    let port = match addr.port() {
        0 => socket
            .local_addr()?
            .as_socket()
            .map(|local| local.port())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "not an inet socket"))?,
        port => port,
    };
    socket.listen(libc::SOMAXCONN)?;
    let listener = TcpListener::from(socket);
    listener.set_nonblocking(true)?;
    Ok(Bound {
        listener,
        port,
        domain: Domain::for_address(addr),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ephemeral_port_is_read_back() {
        let bound = listen("127.0.0.1", 0).unwrap();
        assert_ne!(bound.port, 0);
        assert_eq!(bound.domain, Domain::IPV4);
        assert_eq!(bound.listener.local_addr().unwrap().port(), bound.port);
    }

    #[test]
    fn port_in_use_fails() {
        let first = listen("127.0.0.1", 0).unwrap();
        let err = listen("127.0.0.1", first.port).unwrap_err();
        assert_eq!(err.port, first.port);
        assert!(err
            .to_string()
            .starts_with(&format!("Failed to listen on 127.0.0.1:{} (reason: ", first.port)));
    }

    #[test]
    fn unresolvable_host_fails() {
        assert!(listen("no such host.invalid", 0).is_err());
    }
}
