//! Forwarding error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForwardError {
    /// Local port already registered by another forward or reverse
    #[error("port {port} is already taken by another forward")]
    Conflict { port: u16 },

    #[error("invalid port: {0}")]
    InvalidPort(u16),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Local port cannot be bound on this machine
    #[error("local port {address} is unavailable: {reason}")]
    PortUnavailable { address: String, reason: String },

    #[error("failed to listen on {address}: {reason}")]
    ListenerUnavailable { address: String, reason: String },

    #[error("failed to connect to {address} after {attempts} attempts: {last_error}")]
    ConnectionUnavailable {
        address: String,
        attempts: usize,
        last_error: String,
    },

    #[error("listener on {0} is closed")]
    ListenerClosed(String),

    #[error("no forward registered on port {0}")]
    NotFound(u16),

    #[error("cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForwardError {
    /// Registration-time errors are reported to the caller; everything else is
    /// handled inside the tunnel.
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            ForwardError::Conflict { .. }
                | ForwardError::InvalidPort(_)
                | ForwardError::InvalidAddress(_)
                | ForwardError::PortUnavailable { .. }
        )
    }
}

impl serde::Serialize for ForwardError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_port() {
        let err = ForwardError::Conflict { port: 3000 };
        assert!(err.to_string().contains("3000"));
        assert!(err.is_registration_error());
    }

    #[test]
    fn test_runtime_errors_are_not_registration_errors() {
        let err = ForwardError::ConnectionUnavailable {
            address: "localhost:8080".into(),
            attempts: 10,
            last_error: "connection refused".into(),
        };
        assert!(!err.is_registration_error());
        assert!(err.to_string().contains("after 10 attempts"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_serializes_as_string() {
        let err = ForwardError::NotFound(8080);
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"no forward registered on port 8080\"");
    }
}
