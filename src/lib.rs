//! OxideTunnel - forward and reverse port tunnels over one SSH session
//!
//! ```ignore
//! let cancel = CancellationToken::new();
//! let session = SshClient::new(ssh_config).connect().await?;
//! let transport = Arc::new(session.start(&cancel));
//!
//! let manager = ForwardManager::from_config(&forwarding_config, transport).await?;
//! manager.start(&cancel);
//! // ...
//! manager.stop().await;
//! ```

pub mod forwarding;
pub mod ssh;
pub mod transport;

pub use forwarding::{ForwardError, ForwardManager, ForwardingConfig};
pub use ssh::{SshClient, SshConfig, SshTransport};
pub use transport::{TcpTransport, Transport};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging from `RUST_LOG`, defaulting to `info`
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
