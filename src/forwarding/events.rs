//! Tunnel Event System
//!
//! Status changes and per-connection failures are published on a tokio
//! broadcast channel. Callers that never subscribe pay nothing.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::tunnel::{TunnelKind, TunnelState};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tunnel events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TunnelEvent {
    /// Tunnel state changed
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        local_port: u16,
        kind: TunnelKind,
        state: TunnelState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// One relayed connection could not reach its peer
    #[serde(rename_all = "camelCase")]
    ConnectionFailed {
        local_port: u16,
        address: String,
        error: String,
    },
}

/// Event emitter shared by a manager and its tunnels
#[derive(Clone)]
pub struct ForwardEventEmitter {
    tx: broadcast::Sender<TunnelEvent>,
}

impl ForwardEventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; dropped silently when nobody is subscribed
    pub fn emit(&self, event: TunnelEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit_status_changed(
        &self,
        local_port: u16,
        kind: TunnelKind,
        state: TunnelState,
        error: Option<String>,
    ) {
        self.emit(TunnelEvent::StatusChanged {
            local_port,
            kind,
            state,
            error,
        });
    }

    pub fn emit_connection_failed(&self, local_port: u16, address: &str, error: String) {
        self.emit(TunnelEvent::ConnectionFailed {
            local_port,
            address: address.to_string(),
            error,
        });
    }
}

impl Default for ForwardEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ForwardEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardEventEmitter")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
