//! Relay
//!
//! Copies bytes both ways between two open connections. Whichever direction
//! finishes first (EOF or error) ends the relay; both connections are then
//! shut down and dropped exactly once. With an idle timeout the relay also
//! ends once neither direction has moved a byte for that long.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

use crate::transport::BoxedConn;

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Statistics for a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (accepted side -> dialed side)
    pub bytes_sent: u64,
    /// Total bytes received (dialed side -> accepted side)
    pub bytes_received: u64,
}

/// Lock-free stats updated from connection tasks
#[derive(Debug, Default)]
pub struct ForwardStatsAtomic {
    pub connection_count: AtomicU64,
    pub active_connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl ForwardStatsAtomic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_stats(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Copy direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted connection -> dialed connection
    NearToFar,
    /// Dialed connection -> accepted connection
    FarToNear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Direction that finished first; `None` when the idle timeout ended it
    pub finished: Option<Direction>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Relay `near` (the accepted connection) and `far` (the dialed one) until
/// either direction finishes or both stay silent for `idle_timeout`.
pub async fn relay(
    near: BoxedConn,
    far: BoxedConn,
    idle_timeout: Option<Duration>,
    stats: &ForwardStatsAtomic,
) -> RelayOutcome {
    let (mut near_read, mut near_write) = tokio::io::split(near);
    let (mut far_read, mut far_write) = tokio::io::split(far);

    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);
    let activity = Activity::new();

    let finished = {
        let near_to_far = pump(
            &mut near_read,
            &mut far_write,
            &activity,
            &stats.bytes_sent,
            &sent,
        );
        let far_to_near = pump(
            &mut far_read,
            &mut near_write,
            &activity,
            &stats.bytes_received,
            &received,
        );

        // First completion wins; the other copy is dropped with this block
        tokio::select! {
            result = near_to_far => {
                if let Err(e) = result {
                    debug!("Relay near->far ended: {}", e);
                }
                Some(Direction::NearToFar)
            }
            result = far_to_near => {
                if let Err(e) = result {
                    debug!("Relay far->near ended: {}", e);
                }
                Some(Direction::FarToNear)
            }
            _ = activity.idle(idle_timeout) => {
                debug!("Relay idle in both directions, closing");
                None
            }
        }
    };

    let mut near = near_read.unsplit(near_write);
    let mut far = far_read.unsplit(far_write);
    if let Err(e) = near.shutdown().await {
        debug!("Shutdown of accepted connection failed: {}", e);
    }
    if let Err(e) = far.shutdown().await {
        debug!("Shutdown of dialed connection failed: {}", e);
    }
    drop(near);
    drop(far);

    RelayOutcome {
        finished,
        bytes_sent: sent.load(Ordering::Relaxed),
        bytes_received: received.load(Ordering::Relaxed),
    }
}

/// Last time either direction moved data, shared by both pumps
struct Activity {
    started: Instant,
    /// Millis since `started`
    last: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last.fetch_max(now, Ordering::Relaxed);
    }

    /// Resolves once nothing moved for `timeout`; never without a timeout
    async fn idle(&self, timeout: Option<Duration>) {
        let Some(timeout) = timeout else {
            return std::future::pending().await;
        };
        loop {
            let last = self.started + Duration::from_millis(self.last.load(Ordering::Relaxed));
            let deadline = last + timeout;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// Copy `reader` into `writer` until EOF
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: &Activity,
    total: &AtomicU64,
    counter: &AtomicU64,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        activity.touch();

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        activity.touch();

        total.fetch_add(n as u64, Ordering::Relaxed);
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    use tokio::io::{duplex, DuplexStream, ReadBuf};

    /// Counts shutdowns and drops of the wrapped stream; optionally fails every read
    struct TrackedConn {
        inner: DuplexStream,
        fail_reads: bool,
        shutdowns: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
    }

    impl TrackedConn {
        fn new(inner: DuplexStream, fail_reads: bool) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let shutdowns = Arc::new(AtomicUsize::new(0));
            let drops = Arc::new(AtomicUsize::new(0));
            let conn = Self {
                inner,
                fail_reads,
                shutdowns: shutdowns.clone(),
                drops: drops.clone(),
            };
            (conn, shutdowns, drops)
        }
    }

    impl Drop for TrackedConn {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AsyncRead for TrackedConn {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.fail_reads {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "reset",
                )));
            }
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for TrackedConn {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (near, mut client) = duplex(1024);
        let (far, mut server) = duplex(1024);
        let stats = Arc::new(ForwardStatsAtomic::new());

        let relay_task = {
            let stats = stats.clone();
            tokio::spawn(async move {
                relay(Box::new(near), Box::new(far), None, &stats).await
            })
        };

        client.write_all(b"hello remote").await.unwrap();
        let mut buf = [0u8; 12];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello remote");

        server.write_all(b"hi local").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi local");

        // Closing one side ends the relay and closes the other
        drop(client);
        let outcome = relay_task.await.unwrap();
        assert_eq!(outcome.finished, Some(Direction::NearToFar));
        assert_eq!(outcome.bytes_sent, 12);
        assert_eq!(outcome.bytes_received, 8);

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let snapshot = stats.to_stats();
        assert_eq!(snapshot.bytes_sent, 12);
        assert_eq!(snapshot.bytes_received, 8);
    }

    #[tokio::test]
    async fn test_far_side_close_ends_relay() {
        let (near, mut client) = duplex(1024);
        let (far, server) = duplex(1024);
        let stats = ForwardStatsAtomic::new();

        drop(server);
        let outcome = relay(Box::new(near), Box::new(far), None, &stats).await;
        assert_eq!(outcome.finished, Some(Direction::FarToNear));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_simultaneous_failure_closes_each_once() {
        let (near_inner, _client) = duplex(64);
        let (far_inner, _server) = duplex(64);
        let (near, near_shutdowns, near_drops) = TrackedConn::new(near_inner, true);
        let (far, far_shutdowns, far_drops) = TrackedConn::new(far_inner, true);

        let stats = ForwardStatsAtomic::new();
        let outcome = relay(Box::new(near), Box::new(far), None, &stats).await;

        assert_eq!(outcome.bytes_sent + outcome.bytes_received, 0);
        assert_eq!(near_shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(far_shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(near_drops.load(Ordering::SeqCst), 1);
        assert_eq!(far_drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_relay() {
        let (near, _client) = duplex(64);
        let (far, _server) = duplex(64);
        let stats = ForwardStatsAtomic::new();

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            relay(
                Box::new(near),
                Box::new(far),
                Some(Duration::from_millis(50)),
                &stats,
            ),
        )
        .await
        .expect("idle relay should time out");
        assert_eq!(outcome.finished, None);
        assert_eq!(outcome.bytes_sent, 0);
    }

    #[tokio::test]
    async fn test_one_way_stream_is_not_idle() {
        let (near, mut client) = duplex(1024);
        let (far, mut server) = duplex(1024);
        let stats = Arc::new(ForwardStatsAtomic::new());

        let relay_task = {
            let stats = stats.clone();
            tokio::spawn(async move {
                relay(
                    Box::new(near),
                    Box::new(far),
                    Some(Duration::from_millis(100)),
                    &stats,
                )
                .await
            })
        };

        // Far side streams for well past the idle timeout, near side never writes
        let streamer = tokio::spawn(async move {
            for _ in 0..15 {
                server.write_all(b"tick").await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            server
        });

        let mut buf = [0u8; 4];
        for _ in 0..15 {
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"tick");
        }
        assert!(!relay_task.is_finished());

        // Once the stream goes quiet the idle timeout applies
        let _server = streamer.await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), relay_task)
            .await
            .expect("quiet relay should time out")
            .unwrap();
        assert_eq!(outcome.finished, None);
        assert_eq!(outcome.bytes_received, 60);
        assert_eq!(outcome.bytes_sent, 0);
    }
}
