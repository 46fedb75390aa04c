//! Tunnels
//!
//! A tunnel owns a local and a remote address, a state, and an accept loop
//! that pairs every inbound connection with a freshly dialed one.
//!
//! - **Forward**: listens on the local address, dials the remote address
//!   through the session (single attempt).
//! - **Reverse**: listens on the remote address through the pooled session
//!   listener, dials the local address with the retrying connector.
//!
//! Both variants share one accept loop; only [`Tunnel::acquire_listener`],
//! [`Tunnel::release_listener`] and [`Tunnel::dial_peer`] differ.
//!
//! # Shutdown ordering
//!
//! A watcher task waits for cancellation, marks the tunnel `Disconnected`
//! and only then closes the listener. The accept error caused by the close
//! therefore always reads as a shutdown, never as a transient failure.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connector::RetryingConnector;
use super::error::ForwardError;
use super::events::ForwardEventEmitter;
use super::pool::ListenerPool;
use super::relay::{relay, ForwardStats, ForwardStatsAtomic};
use crate::transport::{BoxedConn, Listener, Transport};

/// Tunnel direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    /// Local listener relays to a remote endpoint
    Forward,
    /// Remote listener relays to a local endpoint
    Reverse,
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelKind::Forward => write!(f, "forward"),
            TunnelKind::Reverse => write!(f, "reverse"),
        }
    }
}

/// `Idle -> Connecting -> Connected -> Disconnected`; `Disconnected` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// Registered, not started
    Idle,
    /// Acquiring the listener
    Connecting,
    /// Listening and accepting
    Connected,
    /// Cancelled or failed to acquire its listener
    Disconnected,
}

/// Serializable snapshot of a tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub id: String,
    pub kind: TunnelKind,
    pub local_port: u16,
    pub local_address: String,
    pub remote_address: String,
    pub state: TunnelState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub stats: ForwardStats,
}

/// Everything a running tunnel needs from its manager
pub(crate) struct TunnelContext {
    /// The SSH session (or any remote transport)
    pub session: Arc<dyn Transport>,
    /// The developer machine
    pub local: Arc<dyn Transport>,
    /// Shared remote listeners for reverse tunnels
    pub pool: Arc<ListenerPool>,
    /// Dialer for the local side of reverse tunnels
    pub connector: RetryingConnector,
    pub accept_retry_interval: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_connections: Option<usize>,
    pub events: ForwardEventEmitter,
}

pub struct Tunnel {
    id: String,
    kind: TunnelKind,
    local_port: u16,
    local_address: String,
    remote_address: String,
    state: RwLock<TunnelState>,
    last_error: RwLock<Option<String>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    stats: ForwardStatsAtomic,
}

impl Tunnel {
    pub fn new(
        kind: TunnelKind,
        local_port: u16,
        local_address: impl Into<String>,
        remote_address: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            local_port,
            local_address: local_address.into(),
            remote_address: remote_address.into(),
            state: RwLock::new(TunnelState::Idle),
            last_error: RwLock::new(None),
            started_at: RwLock::new(None),
            stats: ForwardStatsAtomic::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TunnelKind {
        self.kind
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn state(&self) -> TunnelState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TunnelState::Connected
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.to_stats()
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id.clone(),
            kind: self.kind,
            local_port: self.local_port,
            local_address: self.local_address.clone(),
            remote_address: self.remote_address.clone(),
            state: self.state(),
            last_error: self.last_error(),
            started_at: *self.started_at.read(),
            stats: self.stats(),
        }
    }

    /// Move to `next`. Never leaves `Disconnected`. Returns whether the state changed.
    pub(crate) fn set_state(&self, next: TunnelState, events: &ForwardEventEmitter) -> bool {
        {
            let mut state = self.state.write();
            if *state == next || *state == TunnelState::Disconnected {
                return false;
            }
            *state = next;
        }
        debug!("{} -> {:?}", self, next);
        events.emit_status_changed(self.local_port, self.kind, next, self.last_error());
        true
    }

    /// Address this tunnel listens on
    pub fn listen_address(&self) -> &str {
        match self.kind {
            TunnelKind::Forward => &self.local_address,
            TunnelKind::Reverse => &self.remote_address,
        }
    }

    /// Address each accepted connection is relayed to
    pub fn peer_address(&self) -> &str {
        match self.kind {
            TunnelKind::Forward => &self.remote_address,
            TunnelKind::Reverse => &self.local_address,
        }
    }

    async fn acquire_listener(&self, ctx: &TunnelContext) -> Result<Arc<dyn Listener>, ForwardError> {
        match self.kind {
            TunnelKind::Forward => ctx.local.listen(&self.local_address).await,
            TunnelKind::Reverse => ctx.pool.get_listener(&self.remote_address).await,
        }
    }

    async fn release_listener(
        &self,
        ctx: &TunnelContext,
        listener: &Arc<dyn Listener>,
    ) -> Result<(), ForwardError> {
        match self.kind {
            TunnelKind::Forward => listener.close().await,
            TunnelKind::Reverse => ctx.pool.release(&self.remote_address).await,
        }
    }

    async fn dial_peer(
        &self,
        ctx: &TunnelContext,
        cancel: &CancellationToken,
    ) -> Result<BoxedConn, ForwardError> {
        match self.kind {
            TunnelKind::Forward => {
                RetryingConnector::once()
                    .connect(ctx.session.as_ref(), &self.remote_address, cancel)
                    .await
            }
            TunnelKind::Reverse => {
                ctx.connector
                    .connect(ctx.local.as_ref(), &self.local_address, cancel)
                    .await
            }
        }
    }

    /// Acquire the listener and serve until `cancel` fires.
    ///
    /// Returns only after the listener has been released and every relayed
    /// connection of this tunnel has finished.
    pub(crate) async fn run(self: Arc<Self>, ctx: Arc<TunnelContext>, cancel: CancellationToken) {
        if cancel.is_cancelled() {
            self.set_state(TunnelState::Disconnected, &ctx.events);
            return;
        }

        self.set_state(TunnelState::Connecting, &ctx.events);

        let acquired = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                self.set_state(TunnelState::Disconnected, &ctx.events);
                return;
            }

            acquired = self.acquire_listener(&ctx) => acquired,
        };

        // A listener failure at the chosen address is not transient: no retry
        let listener = match acquired {
            Ok(listener) => listener,
            Err(e) => {
                warn!("{} -> failed to listen on {}: {}", self, self.listen_address(), e);
                *self.last_error.write() = Some(e.to_string());
                self.set_state(TunnelState::Disconnected, &ctx.events);
                return;
            }
        };

        *self.started_at.write() = Some(Utc::now());
        self.set_state(TunnelState::Connected, &ctx.events);
        info!("{} -> listening", self);

        let watcher = tokio::spawn(self.clone().watch(
            ctx.clone(),
            listener.clone(),
            cancel.clone(),
        ));

        let connections = TaskTracker::new();
        self.accept_loop(&ctx, &listener, &cancel, &connections).await;

        // The loop only ends after cancellation, so the watcher is finishing too
        if let Err(e) = watcher.await {
            error!("{} -> listener watcher failed: {}", self, e);
        }

        connections.close();
        connections.wait().await;

        info!("{} -> done", self);
    }

    /// Wait for cancellation, then flag the tunnel down before closing the listener
    async fn watch(
        self: Arc<Self>,
        ctx: Arc<TunnelContext>,
        listener: Arc<dyn Listener>,
        cancel: CancellationToken,
    ) {
        cancel.cancelled().await;

        self.set_state(TunnelState::Disconnected, &ctx.events);
        if let Err(e) = self.release_listener(&ctx, &listener).await {
            info!("{} -> failed to close: {}", self, e);
        }
    }

    async fn accept_loop(
        self: &Arc<Self>,
        ctx: &Arc<TunnelContext>,
        listener: &Arc<dyn Listener>,
        cancel: &CancellationToken,
        connections: &TaskTracker,
    ) {
        let limiter = ctx.max_connections.map(|n| Arc::new(Semaphore::new(n)));

        loop {
            // Backpressure: do not accept past the per-tunnel cap
            let permit = match &limiter {
                Some(limiter) => tokio::select! {
                    biased;

                    _ = cancel.cancelled() => return,

                    permit = limiter.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                },
                None => None,
            };

            // A pooled listener may outlive this tunnel's release, so the
            // loop also watches its own token
            let accepted = tokio::select! {
                biased;

                _ = cancel.cancelled() => return,

                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    self.stats.connection_count.fetch_add(1, Ordering::Relaxed);
                    self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

                    let tunnel = self.clone();
                    let ctx = ctx.clone();
                    let cancel = cancel.clone();
                    connections.spawn(async move {
                        tunnel.handle(&ctx, conn, &cancel).await;
                        tunnel
                            .stats
                            .active_connections
                            .fetch_sub(1, Ordering::Relaxed);
                        drop(permit);
                    });
                }
                Err(e) => {
                    if !self.is_connected() {
                        return;
                    }

                    warn!("{} -> failed to accept connection: {}", self, e);
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => return,

                        _ = tokio::time::sleep(ctx.accept_retry_interval) => {}
                    }
                }
            }
        }
    }

    /// Dial the peer for one accepted connection and relay until either side closes
    async fn handle(&self, ctx: &TunnelContext, near: BoxedConn, cancel: &CancellationToken) {
        let peer = self.peer_address();

        let dialed = tokio::select! {
            _ = cancel.cancelled() => return,
            dialed = self.dial_peer(ctx, cancel) => dialed,
        };

        let far = match dialed {
            Ok(far) => far,
            Err(ForwardError::Cancelled) => return,
            Err(e) => {
                warn!("{} -> failed to connect to {}: {}", self, peer, e);
                ctx.events
                    .emit_connection_failed(self.local_port, peer, e.to_string());
                let mut near = near;
                if let Err(e) = near.shutdown().await {
                    debug!("Error closing accepted connection: {}", e);
                }
                return;
            }
        };

        debug!("{} -> relaying to {}", self, peer);

        tokio::select! {
            outcome = relay(near, far, ctx.idle_timeout, &self.stats) => {
                debug!(
                    "{} -> connection closed ({:?} finished first, {} bytes sent, {} bytes received)",
                    self, outcome.finished, outcome.bytes_sent, outcome.bytes_received
                );
            }
            _ = cancel.cancelled() => {
                debug!("{} -> connection dropped on shutdown", self);
            }
        }
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TunnelKind::Forward => {
                write!(f, "ssh forward {}->{}", self.local_address, self.remote_address)
            }
            TunnelKind::Reverse => write!(
                f,
                "ssh reverse forward {}<-{}",
                self.local_address, self.remote_address
            ),
        }
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("local_address", &self.local_address)
            .field("remote_address", &self.remote_address)
            .field("state", &self.state())
            .finish()
    }
}
