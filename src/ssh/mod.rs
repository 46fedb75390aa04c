//! SSH module - the session transport tunnels run over
//!
//! # Features
//! - Password and key authentication with russh
//! - Host key fingerprint pinning
//! - `direct-tcpip` dialing and `tcpip-forward` listeners
//! - Keepalive watchdog that cancels tunnels when the session is lost

mod client;
mod config;
mod error;
mod handle_owner;
mod router;
mod session;
mod transport;

pub use client::{fingerprint, ClientHandler, SshClient};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use router::ForwardedChannelRouter;
pub use session::SshSession;
pub use transport::{SshListener, SshTransport};
