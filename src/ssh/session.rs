//! SSH Session management
//!
//! An authenticated session is turned into an [`SshTransport`] by `start`,
//! which also spawns a watchdog: losing the session cancels the token every
//! tunnel derives from.

use std::sync::Arc;
use std::time::Duration;

use russh::client::Handle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::handle_owner::{spawn_handle_owner_task, HandleController, PingResult};
use super::router::ForwardedChannelRouter;
use super::transport::SshTransport;

/// Authenticated SSH session, before its handle moves into the owner task
pub struct SshSession {
    handle: Handle<ClientHandler>,
    router: Arc<ForwardedChannelRouter>,
    keepalive_interval: Option<Duration>,
    keepalive_max_failures: u32,
}

impl SshSession {
    pub fn new(
        handle: Handle<ClientHandler>,
        router: Arc<ForwardedChannelRouter>,
        keepalive_interval: Option<Duration>,
        keepalive_max_failures: u32,
    ) -> Self {
        Self {
            handle,
            router,
            keepalive_interval,
            keepalive_max_failures,
        }
    }

    /// Spawn the Handle Owner Task and the session watchdog.
    ///
    /// `cancel` fires when the session is lost; pass the same token to
    /// `ForwardManager::start` so tunnels stop with the session.
    pub fn start(self, cancel: &CancellationToken) -> SshTransport {
        let session_id = uuid::Uuid::new_v4().to_string();
        info!("Starting SSH session {}", session_id);

        let controller = spawn_handle_owner_task(self.handle, session_id.clone());
        tokio::spawn(watch_session(
            controller.clone(),
            self.keepalive_interval,
            self.keepalive_max_failures,
            cancel.clone(),
            session_id,
        ));

        SshTransport::new(controller, self.router)
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Cancel `cancel` once the session disconnects or stops answering keepalives
pub(crate) async fn watch_session(
    controller: HandleController,
    keepalive_interval: Option<Duration>,
    max_failures: u32,
    cancel: CancellationToken,
    session_id: String,
) {
    let mut disconnect_rx = controller.subscribe_disconnect();
    let mut ticker = keepalive_interval.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Watchdog for session {} stopped", session_id);
                return;
            }

            _ = disconnect_rx.recv() => {
                warn!("SSH session {} disconnected, stopping tunnels", session_id);
                cancel.cancel();
                return;
            }

            _ = next_tick(&mut ticker) => {
                match controller.ping().await {
                    PingResult::Ok => failures = 0,
                    PingResult::Timeout => {
                        failures += 1;
                        warn!(
                            "Keepalive {}/{} missed for session {}",
                            failures, max_failures, session_id
                        );
                        if failures >= max_failures {
                            warn!("SSH session {} unresponsive, stopping tunnels", session_id);
                            cancel.cancel();
                            return;
                        }
                    }
                    PingResult::IoError => {
                        warn!("SSH session {} lost, stopping tunnels", session_id);
                        cancel.cancel();
                        return;
                    }
                }
            }
        }
    }
}
