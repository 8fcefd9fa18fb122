//! Network utility functions
//!
//! This module provides utility functions for network operations:
//! address parsing and resolution, and the listener setup used by the
//! proxy (port-increment binding) and by tunnels (dual-stack binding).

use std::net::{SocketAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use super::error::{ProxyError, Result};

/// Listen backlog for all listeners created by this crate
const LISTEN_BACKLOG: i32 = 128;

/// Number of successive ports tried when port-increment binding is enabled
const PORT_INCREMENT_ATTEMPTS: u16 = 100;

/// Parse a socket address
///
/// Tries direct parsing first, then host:port resolution via the
/// system resolver.
///
/// # Parameters
///
/// * `addr` - The address string to parse
///
/// # Returns
///
/// The parsed `SocketAddr`
pub fn parse_socket_addr(addr: &str) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;

    // Try direct parsing first
    if let Ok(socket_addr) = SocketAddr::from_str(addr) {
        return Ok(socket_addr);
    }

    // Try using ToSocketAddrs trait
    match addr.to_socket_addrs() {
        Ok(mut addrs) => addrs
            .next()
            .ok_or_else(|| ProxyError::Network(format!("No addresses found for: {}", addr))),
        Err(e) => Err(ProxyError::Network(format!(
            "Failed to parse address {}: {}",
            addr, e
        ))),
    }
}

/// Resolve a destination host and port
///
/// Accepts a literal IPv4/IPv6 address or a DNS name.
///
/// # Parameters
///
/// * `host` - Destination host (literal address or DNS name)
/// * `port` - Destination port
pub async fn resolve_host_port(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProxyError::Network(format!("Failed to resolve {}:{}: {}", host, port, e)))?;

    addrs
        .next()
        .ok_or_else(|| ProxyError::Network(format!("No addresses found for {}:{}", host, port)))
}

/// Bind a listener on `base_port`, optionally retrying the next port
///
/// When `increment` is set, an `AddrInUse` failure moves to the next
/// port, up to a bounded number of attempts.
///
/// # Returns
///
/// The bound listener together with the port actually used.
pub async fn bind_with_increment(base_port: u16, increment: bool) -> Result<(TcpListener, u16)> {
    let attempts = if increment { PORT_INCREMENT_ATTEMPTS } else { 1 };

    for offset in 0..attempts {
        let port = match base_port.checked_add(offset) {
            Some(p) => p,
            None => break,
        };

        match TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await {
            Ok(listener) => {
                let port = listener
                    .local_addr()
                    .map_err(ProxyError::Io)?
                    .port();
                debug!("Bound data listener on port {}", port);
                return Ok((listener, port));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && increment => {
                debug!("Port {} in use, trying {}", port, port + 1);
            }
            Err(e) => return Err(ProxyError::Io(e)),
        }
    }

    Err(ProxyError::Network(format!(
        "No free port in range {}..{}",
        base_port,
        base_port.saturating_add(attempts)
    )))
}

/// Bind IPv4 and IPv6 listeners on the same port
///
/// Both listeners get `SO_REUSEADDR`; the IPv6 listener is restricted to
/// v6 traffic so the pair can share one port. A port of 0 binds the v4
/// listener to an ephemeral port and reuses that port for v6. Binding is
/// best-effort per family; only a total failure is an error.
///
/// # Returns
///
/// The bound listeners (either may be absent) and the port in use.
pub fn bind_dual_stack(port: u16) -> Result<(Option<TcpListener>, Option<TcpListener>, u16)> {
    let v4 = match bind_family(Domain::IPV4, SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))) {
        Ok(listener) => Some(listener),
        Err(e) => {
            warn!("IPv4 bind on port {} failed: {}", port, e);
            None
        }
    };

    // An ephemeral v4 port is reused for the v6 listener
    let port = match &v4 {
        Some(listener) => listener.local_addr().map_err(ProxyError::Io)?.port(),
        None => port,
    };

    let v6 = match bind_family(Domain::IPV6, SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0))) {
        Ok(listener) => Some(listener),
        Err(e) => {
            warn!("IPv6 bind on port {} failed: {}", port, e);
            None
        }
    };

    let port = match (&v4, &v6) {
        (Some(listener), _) | (None, Some(listener)) => {
            listener.local_addr().map_err(ProxyError::Io)?.port()
        }
        (None, None) => {
            return Err(ProxyError::Tunnel(format!(
                "Failed to bind port {} on any address family",
                port
            )))
        }
    };

    Ok((v4, v6, port))
}

fn bind_family(domain: Domain, addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_socket_addr() {
        // Test valid address
        let addr = parse_socket_addr("127.0.0.1:8080");
        assert!(addr.is_ok(), "Should be able to parse a valid address");

        if let Ok(socket_addr) = addr {
            assert_eq!(socket_addr.port(), 8080);
        }

        // Test invalid address
        let addr = parse_socket_addr("invalid-address");
        assert!(addr.is_err(), "Should fail to parse an invalid address");
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let addr = resolve_host_port("127.0.0.1", 31094).await.unwrap();
        assert_eq!(addr.port(), 31094);
        assert!(addr.is_ipv4());

        let addr = resolve_host_port("::1", 31094).await.unwrap();
        assert!(addr.is_ipv6());
    }

    #[tokio::test]
    async fn test_bind_with_increment() {
        // Occupy a port, then ask for the same port with increment enabled
        let (first, port) = bind_with_increment(0, false).await.unwrap();
        let (_second, next) = bind_with_increment(port, true).await.unwrap();
        assert_ne!(port, next, "Increment binding should move past a busy port");
        drop(first);
    }

    #[tokio::test]
    async fn test_bind_dual_stack_ephemeral() {
        let (v4, _v6, port) = bind_dual_stack(0).unwrap();
        assert!(port != 0);
        assert!(v4.is_some(), "IPv4 loopback bind should succeed");
    }
}
