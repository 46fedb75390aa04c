//! Handle Owner Task
//!
//! One task owns the russh `Handle<ClientHandler>`. Tunnels reach it through
//! a cloneable [`HandleController`] that sends commands over an mpsc channel
//! and waits for the reply on a oneshot.
//!
//! When the owner task exits (disconnect requested, every controller dropped)
//! it broadcasts a disconnect notification, fails every queued command with
//! `Disconnect`, and closes the SSH connection.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

const COMMAND_QUEUE_CAPACITY: usize = 64;
const KEEPALIVE_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive probe outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply in time; may be network latency
    Timeout,
    /// The connection is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (forward tunnels dial through this)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Ask the server to listen (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Stop a server-side listener
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Keepalive probe
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Cloneable front-end of the Handle Owner Task.
///
/// Any holder has full control of the session, so it stays in-process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Controller over a raw command channel; `spawn_handle_owner_task` is the
    /// production constructor
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Receives `()` once the owner task has stopped
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    async fn request<T>(
        &self,
        cmd: HandleCommand,
        reply_rx: oneshot::Receiver<Result<T, russh::Error>>,
    ) -> Result<Result<T, russh::Error>, SshError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)
    }

    /// Open a direct-tcpip channel to `host:port` on the server side
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = HandleCommand::ChannelOpenDirectTcpip {
            host: host.to_string(),
            port,
            originator_host: originator_host.to_string(),
            originator_port,
            reply_tx,
        };
        self.request(cmd, reply_rx)
            .await?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Request a server-side listener. Returns the port the server bound.
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = HandleCommand::TcpipForward {
            address: address.to_string(),
            port,
            reply_tx,
        };
        self.request(cmd, reply_rx)
            .await?
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = HandleCommand::CancelTcpipForward {
            address: address.to_string(),
            port,
            reply_tx,
        };
        self.request(cmd, reply_rx)
            .await?
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))
    }

    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Whether the owner task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Move `handle` into its owner task and return the controller
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(COMMAND_QUEUE_CAPACITY);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let notify = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;
        info!("Handle owner task started for session {}", session_id);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        debug!("Caller gone before direct-tcpip to {}:{} opened", host, port);
                    }
                }

                HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.tcpip_forward(&address, port).await;
                    if let Ok(bound_port) = result {
                        if reply_tx.send(Ok(bound_port)).is_err() {
                            // Nobody owns this listener: cancel it right away
                            warn!(
                                "Caller gone after tcpip-forward on {}:{}, cancelling it",
                                address, bound_port
                            );
                            let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                        }
                    } else {
                        let _ = reply_tx.send(result);
                    }
                }

                HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Ping { reply_tx } => {
                    let result =
                        match tokio::time::timeout(KEEPALIVE_REPLY_TIMEOUT, handle.send_keepalive(true))
                            .await
                        {
                            Ok(Ok(())) => PingResult::Ok,
                            Ok(Err(russh::Error::Disconnect)) => PingResult::IoError,
                            Ok(Err(e)) => {
                                warn!("Keepalive error for session {}: {}", session_id, e);
                                PingResult::Timeout
                            }
                            Err(_) => {
                                warn!("Keepalive timeout for session {}", session_id);
                                PingResult::Timeout
                            }
                        };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for session {}", session_id);
                    break;
                }
            }
        }

        let _ = notify.send(());
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Fail every queued command with `Disconnect`
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
