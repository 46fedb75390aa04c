//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::*;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::router::ForwardedChannelRouter;
use super::session::SshSession;
use crate::transport::join_host_port;

/// Connects and authenticates one SSH session
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn server_address(&self) -> String {
        join_host_port(&self.config.host, self.config.port)
    }

    /// Connect to the SSH server and return an authenticated session
    pub async fn connect(self) -> Result<SshSession, SshError> {
        let addr = self.server_address();

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        // Liveness is checked by the session watchdog
        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let router = Arc::new(ForwardedChannelRouter::new());
        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.host_key_fingerprint.clone(),
            self.config.strict_host_key_checking,
            router.clone(),
        );

        let mut handle = tokio::time::timeout(
            self.config.timeout(),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))??;

        debug!("SSH handshake completed");

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}@{}", self.config.username, addr);

        Ok(SshSession::new(
            handle,
            router,
            self.config.keepalive_interval(),
            self.config.keepalive_max_failures,
        ))
    }
}

/// `SHA256:<base64>` fingerprint, as printed by `ssh-keygen -lf`
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Decide whether a server key with `actual` fingerprint is accepted
fn verify_fingerprint(
    host: &str,
    expected: Option<&str>,
    strict: bool,
    actual: &str,
) -> Result<(), SshError> {
    match expected {
        Some(expected) if expected == actual => Ok(()),
        Some(expected) => Err(SshError::HostKeyRejected {
            host: host.to_string(),
            reason: format!("expected {}, got {}", expected, actual),
        }),
        None if strict => Err(SshError::HostKeyRejected {
            host: host.to_string(),
            reason: format!("no fingerprint configured for {}", actual),
        }),
        None => Ok(()),
    }
}

/// Client handler for russh callbacks
///
/// Verifies the server key and hands `forwarded-tcpip` channels to the
/// router.
pub struct ClientHandler {
    host: String,
    port: u16,
    expected_fingerprint: Option<String>,
    strict: bool,
    router: Arc<ForwardedChannelRouter>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        expected_fingerprint: Option<String>,
        strict: bool,
        router: Arc<ForwardedChannelRouter>,
    ) -> Self {
        Self {
            host,
            port,
            expected_fingerprint,
            strict,
            router,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);
        let host = join_host_port(&self.host, self.port);

        verify_fingerprint(&host, self.expected_fingerprint.as_deref(), self.strict, &actual)
            .inspect_err(|e| warn!("{}", e))?;

        if self.expected_fingerprint.is_some() {
            info!("Host key verified for {}", host);
        } else {
            info!("Accepting host key for {} ({})", host, actual);
        }
        Ok(true)
    }

    /// The server accepted a connection on one of our remote listeners
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Forwarded channel on {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        if let Err(channel) = self.router.route(connected_address, connected_port, channel) {
            warn!(
                "No listener for forwarded channel on {}:{}, dropping it",
                connected_address, connected_port
            );
            drop(channel);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(host: &str) -> SshClient {
        SshClient::new(SshConfig {
            host: host.to_string(),
            port: 2222,
            ..SshConfig::default()
        })
    }

    #[test]
    fn test_server_address_brackets_ipv6() {
        assert_eq!(client("example.com").server_address(), "example.com:2222");
        assert_eq!(client("::1").server_address(), "[::1]:2222");

        let resolved: Vec<_> = client("::1")
            .server_address()
            .to_socket_addrs()
            .unwrap()
            .collect();
        assert_eq!(resolved[0].port(), 2222);
        assert!(resolved[0].is_ipv6());
    }

    #[test]
    fn test_matching_fingerprint_accepted() {
        assert!(verify_fingerprint("h:22", Some("SHA256:abc"), true, "SHA256:abc").is_ok());
    }

    #[test]
    fn test_mismatched_fingerprint_rejected() {
        let err = verify_fingerprint("h:22", Some("SHA256:abc"), false, "SHA256:xyz").unwrap_err();
        assert!(matches!(err, SshError::HostKeyRejected { .. }));
        assert!(err.to_string().contains("SHA256:xyz"));
    }

    #[test]
    fn test_strict_requires_fingerprint() {
        assert!(verify_fingerprint("h:22", None, true, "SHA256:abc").is_err());
        assert!(verify_fingerprint("h:22", None, false, "SHA256:abc").is_ok());
    }
}
