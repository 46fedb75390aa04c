//! Retrying Connector
//!
//! Dials an address a bounded number of times with a fixed delay between
//! attempts. Reverse tunnels use it because the local dev process behind them
//! often starts listening a little after the first remote connection arrives.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::ForwardError;
use crate::transport::{BoxedConn, Transport};

#[derive(Debug, Clone, Copy)]
pub struct RetryingConnector {
    max_attempts: usize,
    backoff: Duration,
}

impl RetryingConnector {
    /// `max_attempts` of 0 is treated as 1
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// A single attempt, no waiting
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Dial `address`, returning the first successful connection.
    ///
    /// Fails with [`ForwardError::ConnectionUnavailable`] carrying the last
    /// dial error once every attempt is used, or [`ForwardError::Cancelled`]
    /// if `cancel` fires during a backoff wait.
    pub async fn connect(
        &self,
        transport: &dyn Transport,
        address: &str,
        cancel: &CancellationToken,
    ) -> Result<BoxedConn, ForwardError> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match transport.dial(address).await {
                Ok(conn) => {
                    if attempt > 1 {
                        debug!("Connected to {} on attempt {}", address, attempt);
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(
                        "Connect attempt {}/{} to {} failed: {}",
                        attempt, self.max_attempts, address, e
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < self.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ForwardError::Cancelled),
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
        }

        Err(ForwardError::ConnectionUnavailable {
            address: address.to_string(),
            attempts: self.max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::transport::{Listener, TcpTransport};

    /// Refuses the first `failures` dials, then dials for real
    struct FlakyTransport {
        failures: usize,
        dials: AtomicUsize,
        inner: TcpTransport,
    }

    impl FlakyTransport {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                dials: AtomicUsize::new(0),
                inner: TcpTransport::new(),
            }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn listen(&self, address: &str) -> Result<Arc<dyn Listener>, ForwardError> {
            self.inner.listen(address).await
        }

        async fn dial(&self, address: &str) -> Result<BoxedConn, ForwardError> {
            let n = self.dials.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ForwardError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
            self.inner.dial(address).await
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let listener = TcpTransport::new().bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();

        let transport = FlakyTransport::new(3);
        let connector = RetryingConnector::new(5, Duration::from_millis(10));
        let conn = connector
            .connect(&transport, &addr, &CancellationToken::new())
            .await;

        assert!(conn.is_ok());
        assert_eq!(transport.dials.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_gives_up_after_exactly_max_attempts() {
        let transport = FlakyTransport::new(usize::MAX);
        let connector = RetryingConnector::new(4, Duration::from_millis(5));

        let result = connector
            .connect(&transport, "127.0.0.1:1", &CancellationToken::new())
            .await;

        match result {
            Err(ForwardError::ConnectionUnavailable {
                address,
                attempts,
                last_error,
            }) => {
                assert_eq!(address, "127.0.0.1:1");
                assert_eq!(attempts, 4);
                assert!(last_error.contains("connection refused"));
            }
            other => panic!("expected ConnectionUnavailable, got {:?}", other.map(|_| ())),
        }
        assert_eq!(transport.dials.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_once_makes_single_attempt() {
        let transport = FlakyTransport::new(usize::MAX);
        let result = RetryingConnector::once()
            .connect(&transport, "127.0.0.1:1", &CancellationToken::new())
            .await;
        assert!(result.is_err());
        assert_eq!(transport.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_is_one() {
        assert_eq!(RetryingConnector::new(0, Duration::ZERO).max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let transport = FlakyTransport::new(usize::MAX);
        let connector = RetryingConnector::new(100, Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            connector.connect(&transport, "127.0.0.1:1", &cancel),
        )
        .await
        .expect("cancel should interrupt the backoff");
        assert!(matches!(result, Err(ForwardError::Cancelled)));
        assert_eq!(transport.dials.load(Ordering::SeqCst), 1);
        canceller.await.unwrap();
    }
}
