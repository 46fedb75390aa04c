//! Transport Session Seam
//!
//! Tunnels never talk to sockets or SSH channels directly. They go through a
//! [`Transport`], which hands out [`Listener`]s and dialed [`Connection`]s.
//!
//! Two implementations exist:
//! - [`TcpTransport`]: plain tokio TCP on the local machine
//! - [`crate::ssh::SshTransport`]: `tcpip-forward` / `direct-tcpip` over one SSH session

mod tcp;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::forwarding::ForwardError;

pub use tcp::{TcpTransport, TcpTransportListener};

/// A bidirectional byte stream produced by `accept()` or `dial()`.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased connection
pub type BoxedConn = Box<dyn Connection>;

/// Accepts inbound connections on one address.
///
/// `accept` takes `&self` so a watcher can call [`Listener::close`] while an
/// accept loop is parked inside `accept`. After `close`, every pending and
/// future `accept` fails with [`ForwardError::ListenerClosed`].
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection
    async fn accept(&self) -> Result<BoxedConn, ForwardError>;

    /// Stop listening. Idempotent.
    async fn close(&self) -> Result<(), ForwardError>;

    /// Address this listener is bound to (`host:port`)
    fn address(&self) -> &str;

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;
}

/// `Listen`/`Dial` primitives of an already-authenticated session.
///
/// Both operations must be usable concurrently from many tunnels.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start listening on `address` (`host:port`)
    async fn listen(&self, address: &str) -> Result<Arc<dyn Listener>, ForwardError>;

    /// Open a connection to `address` (`host:port`)
    async fn dial(&self, address: &str) -> Result<BoxedConn, ForwardError>;
}

/// Split a `host:port` string, accepting bracketed IPv6 hosts.
pub fn split_host_port(address: &str) -> Result<(String, u16), ForwardError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ForwardError::InvalidAddress(address.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ForwardError::InvalidAddress(address.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

/// Join a host and port into `host:port`; IPv6 hosts get brackets.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("localhost", 8080), "localhost:8080");
        assert_eq!(join_host_port("0.0.0.0", 22), "0.0.0.0:22");
        assert_eq!(join_host_port("::1", 3000), "[::1]:3000");
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("localhost:8080").unwrap(),
            ("localhost".to_string(), 8080)
        );
        assert_eq!(split_host_port("[::1]:3000").unwrap(), ("::1".to_string(), 3000));
        assert!(split_host_port("localhost").is_err());
        assert!(split_host_port("localhost:http").is_err());
        assert!(split_host_port("localhost:70000").is_err());
    }
}
