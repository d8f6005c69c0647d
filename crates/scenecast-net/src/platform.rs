//! TCP socket configuration.
//!
//! [`SocketConfig`] gathers the socket options applied to the listener and to
//! every accepted client socket.

use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};

/// Socket options applied to the listener and accepted connections.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
    /// Upper bound on a single blocking socket write. Default: 5s.
    pub write_timeout: Option<Duration>,
    /// Enable `SO_REUSEADDR` on the listener. Default: true except on Windows.
    pub reuse_addr: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            write_timeout: Some(Duration::from_secs(5)),
            reuse_addr: !cfg!(target_os = "windows"),
        }
    }
}

/// Apply socket configuration to an accepted [`TcpStream`].
///
/// The stream is left in blocking mode so writes complete or time out.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(config.tcp_nodelay)?;
    stream.set_write_timeout(config.write_timeout)?;

    if config.keepalive_enabled {
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Create a non-blocking listener bound to `addr`.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

/// Bind the first free port in `port ..= port + port_range` on `ip`.
pub fn bind_in_range(
    ip: IpAddr,
    port: u16,
    port_range: u16,
    config: &SocketConfig,
) -> std::io::Result<TcpListener> {
    let last = port.saturating_add(port_range);
    let mut last_error = None;
    for candidate in port..=last {
        match create_listener(SocketAddr::new(ip, candidate), config) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                tracing::debug!(port = candidate, error = %e, "bind failed");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| std::io::Error::other("empty port range")))
}

/// True if the peer has closed `stream`.
///
/// Uses a non-blocking peek; pending unread data counts as open.
pub fn peer_closed(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let mut probe = [0u8; 1];
    let closed = match stream.peek(&mut probe) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => !matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
        ),
    };
    if stream.set_nonblocking(false).is_err() {
        return true;
    }
    closed
}
