//! Port Forwarding Module
//!
//! Forward (local listener, remote dial) and reverse (remote listener, local
//! dial) tunnels multiplexed over one transport session.

pub mod config;
mod connector;
mod error;
pub mod events;
pub mod manager;
mod pool;
pub mod relay;
pub mod tunnel;

pub use config::{ConfigError, ForwardingConfig, PortMapping};
pub use connector::RetryingConnector;
pub use error::ForwardError;
pub use events::{ForwardEventEmitter, TunnelEvent};
pub use manager::ForwardManager;
pub use pool::ListenerPool;
pub use relay::{relay, Direction, ForwardStats, RelayOutcome};
pub use tunnel::{Tunnel, TunnelInfo, TunnelKind, TunnelState};
