//! Plain TCP transport on the local machine

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BoxedConn, Listener, Transport};
use crate::forwarding::ForwardError;

/// Listens and dials with tokio TCP sockets
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }

    /// Bind a listener and keep the concrete type (tests need the bound port)
    pub async fn bind(&self, address: &str) -> Result<TcpTransportListener, ForwardError> {
        let listener = TcpListener::bind(address).await.map_err(|e| {
            let reason = match e.kind() {
                std::io::ErrorKind::AddrInUse => {
                    "port already in use, another application may be using it".to_string()
                }
                std::io::ErrorKind::PermissionDenied => {
                    "permission denied, ports below 1024 require elevated privileges".to_string()
                }
                std::io::ErrorKind::AddrNotAvailable => {
                    "address not available on this system".to_string()
                }
                _ => e.to_string(),
            };
            ForwardError::ListenerUnavailable {
                address: address.to_string(),
                reason,
            }
        })?;

        let local_addr = listener.local_addr()?;
        debug!("Listening on {} (bound {})", address, local_addr);

        Ok(TcpTransportListener {
            address: address.to_string(),
            local_addr,
            inner: Mutex::new(Some(Arc::new(listener))),
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, address: &str) -> Result<Arc<dyn Listener>, ForwardError> {
        Ok(Arc::new(self.bind(address).await?))
    }

    async fn dial(&self, address: &str) -> Result<BoxedConn, ForwardError> {
        let stream = TcpStream::connect(address).await?;
        // Disable Nagle's algorithm for low-latency forwarding
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        Ok(Box::new(stream))
    }
}

/// TCP listener that can be closed while another task is blocked in `accept`
pub struct TcpTransportListener {
    address: String,
    local_addr: SocketAddr,
    /// Dropped on close; a pending accept holds its own clone until it returns
    inner: Mutex<Option<Arc<TcpListener>>>,
    closed: CancellationToken,
}

impl TcpTransportListener {
    /// Actual bound socket address (differs from the requested one for port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for TcpTransportListener {
    async fn accept(&self) -> Result<BoxedConn, ForwardError> {
        let listener = self
            .inner
            .lock()
            .clone()
            .ok_or_else(|| ForwardError::ListenerClosed(self.address.clone()))?;

        tokio::select! {
            biased;

            _ = self.closed.cancelled() => Err(ForwardError::ListenerClosed(self.address.clone())),

            accepted = listener.accept() => {
                let (stream, peer_addr) = accepted?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                debug!("Accepted connection from {} on {}", peer_addr, self.address);
                Ok(Box::new(stream) as BoxedConn)
            }
        }
    }

    async fn close(&self) -> Result<(), ForwardError> {
        self.closed.cancel();
        if self.inner.lock().take().is_some() {
            debug!("Closed listener on {}", self.address);
        }
        Ok(())
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
