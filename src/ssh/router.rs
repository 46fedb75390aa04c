//! Forwarded Channel Router
//!
//! The server opens a `forwarded-tcpip` channel for every connection that
//! reaches a remote listener. The client handler only sees the channel and
//! the address it arrived on; the router hands it to the `SshListener`
//! registered for that address.

use dashmap::DashMap;
use russh::client::Msg;
use russh::Channel;
use tokio::sync::mpsc;
use tracing::debug;

/// Inbound channels waiting for `accept`, per listener
const ROUTE_BACKLOG: usize = 128;

/// Routes server-opened channels to their listener
pub struct ForwardedChannelRouter<C = Channel<Msg>> {
    routes: DashMap<(String, u32), mpsc::Sender<C>>,
}

impl<C> ForwardedChannelRouter<C> {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    /// Register `address:port`, replacing any previous route
    pub fn register(&self, address: &str, port: u32) -> mpsc::Receiver<C> {
        let (tx, rx) = mpsc::channel(ROUTE_BACKLOG);
        self.routes.insert((address.to_string(), port), tx);
        debug!("Registered forwarded route {}:{}", address, port);
        rx
    }

    pub fn unregister(&self, address: &str, port: u32) {
        if self.routes.remove(&(address.to_string(), port)).is_some() {
            debug!("Unregistered forwarded route {}:{}", address, port);
        }
    }

    /// Deliver `channel` to the listener for `address:port`.
    ///
    /// Servers may report a concrete address for a wildcard listener, so a
    /// route on the same port is used when no exact match exists. Gives the
    /// channel back when no listener takes it.
    pub fn route(&self, address: &str, port: u32, channel: C) -> Result<(), C> {
        let sender = self
            .routes
            .get(&(address.to_string(), port))
            .map(|entry| entry.value().clone())
            .or_else(|| {
                self.routes
                    .iter()
                    .find(|entry| entry.key().1 == port)
                    .map(|entry| entry.value().clone())
            });

        match sender {
            Some(sender) => sender.try_send(channel).map_err(|e| match e {
                mpsc::error::TrySendError::Full(channel) => channel,
                mpsc::error::TrySendError::Closed(channel) => channel,
            }),
            None => Err(channel),
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<C> Default for ForwardedChannelRouter<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exact_route() {
        let router = ForwardedChannelRouter::<u32>::new();
        let mut rx = router.register("0.0.0.0", 9090);

        router.route("0.0.0.0", 9090, 7).unwrap();
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_falls_back_to_port() {
        let router = ForwardedChannelRouter::<u32>::new();
        let mut rx = router.register("0.0.0.0", 9090);

        router.route("127.0.0.1", 9090, 1).unwrap();
        assert_eq!(rx.recv().await, Some(1));
    }

    #[test]
    fn test_unknown_route_gives_channel_back() {
        let router = ForwardedChannelRouter::<u32>::new();
        let _rx = router.register("0.0.0.0", 9090);
        assert_eq!(router.route("0.0.0.0", 9091, 3), Err(3));
    }

    #[test]
    fn test_unregister_and_closed_receiver() {
        let router = ForwardedChannelRouter::<u32>::new();
        let rx = router.register("0.0.0.0", 9090);
        drop(rx);
        assert_eq!(router.route("0.0.0.0", 9090, 4), Err(4));

        router.unregister("0.0.0.0", 9090);
        assert!(router.is_empty());
    }
}
