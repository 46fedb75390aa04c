//! SSH Session Transport
//!
//! `dial` opens a `direct-tcpip` channel; `listen` asks the server for a
//! `tcpip-forward` and yields the `forwarded-tcpip` channels it opens.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::Msg;
use russh::Channel;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::SshError;
use super::handle_owner::HandleController;
use super::router::ForwardedChannelRouter;
use crate::forwarding::ForwardError;
use crate::transport::{split_host_port, BoxedConn, Listener, Transport};

/// Reported to the server as the origin of dialed channels
const ORIGINATOR_HOST: &str = "127.0.0.1";

fn channel_conn(channel: Channel<Msg>) -> BoxedConn {
    Box::new(Box::pin(channel.into_stream()))
}

/// Listen/Dial over one authenticated SSH session
#[derive(Clone)]
pub struct SshTransport {
    controller: HandleController,
    router: Arc<ForwardedChannelRouter>,
}

impl SshTransport {
    pub fn new(controller: HandleController, router: Arc<ForwardedChannelRouter>) -> Self {
        Self { controller, router }
    }

    pub fn controller(&self) -> &HandleController {
        &self.controller
    }

    pub fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    /// Close the SSH connection. Tunnels notice through the session watchdog.
    pub async fn disconnect(&self) {
        self.controller.disconnect().await;
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn listen(&self, address: &str) -> Result<Arc<dyn Listener>, ForwardError> {
        let (host, port) = split_host_port(address)?;
        let port = u32::from(port);

        // Route first: the server may open a channel before the reply arrives
        let incoming = self.router.register(&host, port);
        let route = RouteGuard {
            router: &self.router,
            host: &host,
            port,
        };

        let bound_port = self
            .controller
            .tcpip_forward(&host, port)
            .await
            .map_err(|e| ForwardError::ListenerUnavailable {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        // The route now belongs to the listener
        std::mem::forget(route);

        info!("Remote listener on {} (server bound port {})", address, bound_port);

        Ok(Arc::new(SshListener {
            address: address.to_string(),
            host,
            port,
            controller: self.controller.clone(),
            router: self.router.clone(),
            incoming: Mutex::new(incoming),
            closed: CancellationToken::new(),
        }))
    }

    async fn dial(&self, address: &str) -> Result<BoxedConn, ForwardError> {
        let (host, port) = split_host_port(address)?;
        let channel = self
            .controller
            .open_direct_tcpip(&host, u32::from(port), ORIGINATOR_HOST, 0)
            .await?;
        debug!("Opened direct-tcpip channel to {}", address);
        Ok(channel_conn(channel))
    }
}

/// Removes a route registered by an unfinished `listen`, including one
/// whose future was dropped mid-request
struct RouteGuard<'a> {
    router: &'a ForwardedChannelRouter,
    host: &'a str,
    port: u32,
}

impl Drop for RouteGuard<'_> {
    fn drop(&mut self) {
        self.router.unregister(self.host, self.port);
    }
}

/// Server-side listener created with `tcpip-forward`
pub struct SshListener {
    address: String,
    host: String,
    port: u32,
    controller: HandleController,
    router: Arc<ForwardedChannelRouter>,
    incoming: Mutex<mpsc::Receiver<Channel<Msg>>>,
    closed: CancellationToken,
}

#[async_trait]
impl Listener for SshListener {
    async fn accept(&self) -> Result<BoxedConn, ForwardError> {
        let next = async { self.incoming.lock().await.recv().await };

        tokio::select! {
            biased;

            _ = self.closed.cancelled() => Err(ForwardError::ListenerClosed(self.address.clone())),

            channel = next => match channel {
                Some(channel) => Ok(channel_conn(channel)),
                None => Err(ForwardError::ListenerClosed(self.address.clone())),
            },
        }
    }

    async fn close(&self) -> Result<(), ForwardError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        self.router.unregister(&self.host, self.port);

        match self.controller.cancel_tcpip_forward(&self.host, self.port).await {
            Ok(()) => {
                debug!("Cancelled remote listener on {}", self.address);
                Ok(())
            }
            // The server dropped every forward with the session
            Err(SshError::Disconnected) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::ssh::handle_owner::tests::fake_owner;
    use crate::ssh::handle_owner::PingResult;

    fn transport() -> SshTransport {
        SshTransport::new(fake_owner(PingResult::Ok), Arc::new(ForwardedChannelRouter::new()))
    }

    #[tokio::test]
    async fn test_listen_registers_route_and_close_removes_it() {
        let transport = transport();
        let listener = transport.listen("0.0.0.0:9090").await.unwrap();
        assert_eq!(listener.address(), "0.0.0.0:9090");
        assert_eq!(transport.router.len(), 1);

        listener.close().await.unwrap();
        assert!(listener.is_closed());
        assert!(transport.router.is_empty());

        // Idempotent
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let transport = transport();
        let listener = transport.listen("0.0.0.0:9090").await.unwrap();

        let pending = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("accept should unblock")
            .unwrap();
        assert!(matches!(result, Err(ForwardError::ListenerClosed(_))));
    }

    #[tokio::test]
    async fn test_listen_after_disconnect_fails() {
        let transport = transport();
        transport.disconnect().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = transport.listen("0.0.0.0:9090").await;
        assert!(matches!(result, Err(ForwardError::ListenerUnavailable { .. })));
        assert!(transport.router.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_listen_removes_route() {
        // Owner that never answers: tcpip-forward stays pending
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        let transport = SshTransport::new(
            HandleController::new(cmd_tx),
            Arc::new(ForwardedChannelRouter::new()),
        );

        let pending =
            tokio::time::timeout(Duration::from_millis(50), transport.listen("0.0.0.0:9090")).await;
        assert!(pending.is_err());
        assert!(transport.router.is_empty());
    }

    #[tokio::test]
    async fn test_dial_failure_is_transport_error() {
        let result = transport().dial("localhost:4000").await;
        assert!(matches!(result, Err(ForwardError::Transport(_))));
    }

    #[tokio::test]
    async fn test_malformed_address() {
        let result = transport().listen("no-port").await;
        assert!(matches!(result, Err(ForwardError::InvalidAddress(_))));
    }
}
