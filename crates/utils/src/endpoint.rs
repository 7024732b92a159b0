//! Endpoint binder: turns a `unix:`/`local:`/`inet:`/`inet4:`/`inet6:` URI
//! into one or more bound, listening, non-blocking sockets.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::lock::Lock;

const LISTEN_BACKLOG: i32 = 16;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("unsupported endpoint '{0}'")]
    Unsupported(String),
    #[error("expected a non-empty file path for a unix socket")]
    EmptyUnixPath,
    #[error("expected a closing ']' in socket address '{0}'")]
    UnterminatedBracket(String),
    #[error("expected ':' separator in socket address '{0}'")]
    MissingPortSeparator(String),
    #[error("expected a port number in socket address '{0}'")]
    MissingPort(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A single bound, listening, non-blocking endpoint. Kept as `std` types so
/// the caller decides which async runtime (or none) to hand them to;
/// `into_tokio` does that conversion for the common case.
pub enum Listener {
    Unix {
        listener: StdUnixListener,
        /// Held for the lifetime of the listener; removes the `.lock`
        /// sidecar file on drop. `None` when no lock was acquired because
        /// another live process already holds the socket (in which case we
        /// never got this far - `bind` would have failed first).
        _lock: Lock,
    },
    Tcp(std::net::TcpListener),
}

impl Listener {
    pub fn into_tokio(self) -> io::Result<TokioListener> {
        match self {
            Listener::Unix { listener, _lock } => {
                listener.set_nonblocking(true)?;
                Ok(TokioListener::Unix(
                    tokio::net::UnixListener::from_std(listener)?,
                    _lock,
                ))
            }
            Listener::Tcp(listener) => {
                listener.set_nonblocking(true)?;
                Ok(TokioListener::Tcp(tokio::net::TcpListener::from_std(
                    listener,
                )?))
            }
        }
    }
}

pub enum TokioListener {
    Unix(tokio::net::UnixListener, Lock),
    Tcp(tokio::net::TcpListener),
}

/// Binds `spec` (a `unix:`/`local:`/`inet:`/`inet4:`/`inet6:` URI) into up to
/// `max_fds` listening sockets.
pub fn bind(spec: &str, max_fds: usize) -> Result<Vec<Listener>, EndpointError> {
    if max_fds == 0 {
        return Ok(Vec::new());
    }
    if let Some(path) = spec.strip_prefix("unix:").or_else(|| spec.strip_prefix("local:")) {
        return Ok(vec![bind_unix(path)?]);
    }
    if let Some(addr) = spec.strip_prefix("inet:") {
        return bind_inet(addr, None, max_fds);
    }
    if let Some(addr) = spec.strip_prefix("inet4:") {
        return bind_inet(addr, Some(Domain::IPV4), max_fds);
    }
    if let Some(addr) = spec.strip_prefix("inet6:") {
        return bind_inet(addr, Some(Domain::IPV6), max_fds);
    }
    Err(EndpointError::Unsupported(spec.to_string()))
}

fn bind_unix(path: &str) -> Result<Listener, EndpointError> {
    if path.is_empty() {
        return Err(EndpointError::EmptyUnixPath);
    }
    let lock = Lock::acquire(path)?;
    let lock = match lock {
        Some(lock) => {
            // We hold the lock exclusively, so any socket file left behind
            // belongs to a process that is no longer running.
            let _ = std::fs::remove_file(path);
            lock
        }
        None => {
            return Err(EndpointError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("'{path}' is locked by another process"),
            )))
        }
    };
    let listener = StdUnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
    Ok(Listener::Unix {
        listener,
        _lock: lock,
    })
}

/// Parses `addr` as `[v6]:port`, `host:port`, or `*:port`/`port`-only, and
/// binds every address that resolution yields, up to `max_fds`.
fn bind_inet(
    addr: &str,
    family: Option<Domain>,
    max_fds: usize,
) -> Result<Vec<Listener>, EndpointError> {
    let (node, service) = split_host_port(addr)?;
    let candidates = resolve(node.as_deref(), service)?;

    let mut listeners = Vec::new();
    for candidate in candidates.into_iter().take(max_fds) {
        if let Some(want) = family {
            let is_v6 = candidate.is_ipv6();
            if (want == Domain::IPV6) != is_v6 {
                continue;
            }
        }
        match bind_one_tcp(candidate) {
            Ok(listener) => listeners.push(Listener::Tcp(listener)),
            Err(e) => {
                tracing::warn!("failed to bind {candidate}: {e}");
            }
        }
    }
    Ok(listeners)
}

fn bind_one_tcp(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    // Fall back silently if the platform lacks SO_REUSEPORT; SO_REUSEADDR
    // alone is still enough to rebind quickly after a restart.
    let _ = socket.set_reuse_port(true);
    let _ = socket.set_reuse_address(true);
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

fn split_host_port(addr: &str) -> Result<(Option<String>, &str), EndpointError> {
    if let Some(rest) = addr.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| EndpointError::UnterminatedBracket(addr.to_string()))?;
        let node = &rest[..end];
        let after = &rest[end + 1..];
        let service = after
            .strip_prefix(':')
            .ok_or_else(|| EndpointError::MissingPortSeparator(addr.to_string()))?;
        if service.is_empty() {
            return Err(EndpointError::MissingPort(addr.to_string()));
        }
        return Ok((Some(node.to_string()), service));
    }
    match addr.rsplit_once(':') {
        Some((node, service)) => {
            if service.is_empty() {
                return Err(EndpointError::MissingPort(addr.to_string()));
            }
            if node.is_empty() || node == "*" {
                Ok((None, service))
            } else if node == "localhost" {
                Ok((None, service))
            } else {
                Ok((Some(node.to_string()), service))
            }
        }
        None => {
            if addr.is_empty() {
                Err(EndpointError::MissingPort(addr.to_string()))
            } else {
                Ok((None, addr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_and_rebinds_a_unix_socket_after_the_process_exits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srs.sock");
        let listeners = bind(&format!("unix:{}", path.display()), 1).unwrap();
        assert_eq!(listeners.len(), 1);
        drop(listeners);
        // the socket file and lockfile are both gone once the listener drops.
        let listeners_again = bind(&format!("unix:{}", path.display()), 1).unwrap();
        assert_eq!(listeners_again.len(), 1);
    }

    #[test]
    fn rejects_an_empty_unix_path() {
        assert!(matches!(bind("unix:", 1), Err(EndpointError::EmptyUnixPath)));
    }

    #[test]
    fn rejects_an_unsupported_scheme() {
        assert!(matches!(
            bind("sctp:127.0.0.1:2000", 1),
            Err(EndpointError::Unsupported(_))
        ));
    }

    #[test]
    fn max_fds_zero_binds_nothing() {
        let listeners = bind("inet:127.0.0.1:0", 0).unwrap();
        assert!(listeners.is_empty());
    }

    #[test]
    fn splits_bracketed_ipv6_host_port() {
        let (host, port) = split_host_port("[::1]:2000").unwrap();
        assert_eq!(host.as_deref(), Some("::1"));
        assert_eq!(port, "2000");
    }

    #[test]
    fn splits_plain_host_port() {
        let (host, port) = split_host_port("mail.example.com:2000").unwrap();
        assert_eq!(host.as_deref(), Some("mail.example.com"));
        assert_eq!(port, "2000");
    }

    #[test]
    fn wildcard_host_resolves_to_no_node() {
        let (host, port) = split_host_port("*:2000").unwrap();
        assert_eq!(host, None);
        assert_eq!(port, "2000");
    }

    #[test]
    fn rejects_missing_port() {
        assert!(matches!(
            split_host_port("mail.example.com"),
            Err(EndpointError::MissingPort(_))
        ));
    }
}

fn resolve(node: Option<&str>, service: &str) -> Result<Vec<SocketAddr>, EndpointError> {
    let host = node.unwrap_or("0.0.0.0");
    let query = format!("{host}:{service}");
    if node.is_none() {
        let port: u16 = service
            .parse()
            .map_err(|_| EndpointError::MissingPort(service.to_string()))?;
        return Ok(vec![
            SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), port),
            SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), port),
        ]);
    }
    Ok(query.to_socket_addrs()?.collect())
}
