//! Forwarding Configuration
//!
//! Bind interfaces, retry timings and the port mappings a manager is
//! created with. Stored as JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Configuration load/save errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One local/remote port pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub local: u16,
    pub remote: u16,
}

impl PortMapping {
    pub fn new(local: u16, remote: u16) -> Self {
        Self { local, remote }
    }
}

/// Forward manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// Interface local endpoints bind to / dial
    #[serde(default = "default_local_interface")]
    pub local_interface: String,

    /// Interface remote endpoints bind to / dial
    #[serde(default = "default_remote_interface")]
    pub remote_interface: String,

    /// Wait between accept attempts after a transient accept failure
    #[serde(default = "default_accept_retry_interval_ms")]
    pub accept_retry_interval_ms: u64,

    /// Dial attempts for the local side of a reverse tunnel
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: usize,

    /// Fixed wait between dial attempts
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    /// Close a relayed connection once neither direction moved data for
    /// this long (0 = never)
    #[serde(default)]
    pub idle_timeout_secs: u64,

    /// Concurrent relayed connections per tunnel (0 = unlimited)
    #[serde(default)]
    pub max_connections_per_tunnel: usize,

    /// Probe that a forward's local port can be bound before registering it.
    /// Off by default: a busy port then surfaces when the tunnel starts.
    #[serde(default)]
    pub check_local_availability: bool,

    #[serde(default)]
    pub forwards: Vec<PortMapping>,

    #[serde(default)]
    pub reverses: Vec<PortMapping>,
}

fn default_local_interface() -> String {
    "localhost".to_string()
}

fn default_remote_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_accept_retry_interval_ms() -> u64 {
    500
}

fn default_connect_attempts() -> usize {
    10
}

fn default_connect_backoff_ms() -> u64 {
    200
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            local_interface: default_local_interface(),
            remote_interface: default_remote_interface(),
            accept_retry_interval_ms: default_accept_retry_interval_ms(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_connect_backoff_ms(),
            idle_timeout_secs: 0,
            max_connections_per_tunnel: 0,
            check_local_availability: false,
            forwards: Vec::new(),
            reverses: Vec::new(),
        }
    }
}

impl ForwardingConfig {
    /// Set both bind interfaces
    pub fn with_interfaces(
        mut self,
        local_interface: impl Into<String>,
        remote_interface: impl Into<String>,
    ) -> Self {
        self.local_interface = local_interface.into();
        self.remote_interface = remote_interface.into();
        self
    }

    pub fn with_forward(mut self, local: u16, remote: u16) -> Self {
        self.forwards.push(PortMapping::new(local, remote));
        self
    }

    pub fn with_reverse(mut self, local: u16, remote: u16) -> Self {
        self.reverses.push(PortMapping::new(local, remote));
        self
    }

    pub fn accept_retry_interval(&self) -> Duration {
        Duration::from_millis(self.accept_retry_interval_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn max_connections(&self) -> Option<usize> {
        (self.max_connections_per_tunnel > 0).then_some(self.max_connections_per_tunnel)
    }

    /// Load configuration from a JSON file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration as pretty JSON, creating parent directories
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(self)?;

        // Write to a temp file first, then rename
        let tmp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&tmp_path, path).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = ForwardingConfig::default();
        assert_eq!(config.local_interface, "localhost");
        assert_eq!(config.remote_interface, "0.0.0.0");
        assert_eq!(config.accept_retry_interval(), Duration::from_millis(500));
        assert_eq!(config.connect_attempts, 10);
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.max_connections(), None);
        assert!(!config.check_local_availability);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ForwardingConfig = serde_json::from_str(
            r#"{ "reverses": [{ "local": 8080, "remote": 9090 }], "idle_timeout_secs": 60, "check_local_availability": true }"#,
        )
        .unwrap();
        assert_eq!(config.reverses, vec![PortMapping::new(8080, 9090)]);
        assert!(config.forwards.is_empty());
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(60)));
        assert!(config.check_local_availability);
        assert_eq!(config.connect_backoff(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("tunnels.json");

        let config = ForwardingConfig::default()
            .with_interfaces("127.0.0.1", "0.0.0.0")
            .with_forward(3000, 4000)
            .with_reverse(8080, 9090);
        config.save(&path).await.unwrap();

        let loaded = ForwardingConfig::load(&path).await.unwrap();
        assert_eq!(loaded.local_interface, "127.0.0.1");
        assert_eq!(loaded.forwards, vec![PortMapping::new(3000, 4000)]);
        assert_eq!(loaded.reverses, vec![PortMapping::new(8080, 9090)]);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let result = ForwardingConfig::load(dir.path().join("missing.json")).await;
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
