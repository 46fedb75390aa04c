//! SSH Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// SSH connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Keepalive probe interval in seconds (0 disables the probe)
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Consecutive timed-out probes before the session counts as lost
    #[serde(default = "default_keepalive_max_failures")]
    pub keepalive_max_failures: u32,

    /// Expected server key fingerprint (`SHA256:...`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,

    /// Reject the server when no fingerprint is configured
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive_interval() -> u64 {
    15
}

fn default_keepalive_max_failures() -> u32 {
    3
}

impl SshConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            auth: AuthMethod::Password {
                password: String::new(),
            },
            timeout_secs: default_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max_failures: default_keepalive_max_failures(),
            host_key_fingerprint: None,
            strict_host_key_checking: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{
            "host": "dev.example.com",
            "username": "alice",
            "auth": { "type": "key", "key_path": "~/.ssh/id_ed25519", "passphrase": null }
        }"#;
        let config: SshConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.port, 22);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.keepalive_interval(), Some(Duration::from_secs(15)));
        assert_eq!(config.keepalive_max_failures, 3);
        assert!(config.host_key_fingerprint.is_none());
        assert!(!config.strict_host_key_checking);
        assert!(matches!(config.auth, AuthMethod::Key { .. }));
    }

    #[test]
    fn test_zero_keepalive_disables_probe() {
        let config = SshConfig {
            keepalive_interval_secs: 0,
            ..SshConfig::default()
        };
        assert_eq!(config.keepalive_interval(), None);
    }

    #[test]
    fn test_auth_tagging() {
        let json = serde_json::to_string(&AuthMethod::password("secret")).unwrap();
        assert!(json.contains("\"type\":\"password\""));
    }
}
