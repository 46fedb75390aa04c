//! Port Forwarding Manager
//!
//! Registry of every forward and reverse tunnel of one session, keyed by
//! local port. Owns the listener pool and propagates one cancellation token
//! to all tunnels it starts.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::config::ForwardingConfig;
use super::connector::RetryingConnector;
use super::error::ForwardError;
use super::events::{ForwardEventEmitter, TunnelEvent};
use super::pool::ListenerPool;
use super::relay::ForwardStats;
use super::tunnel::{Tunnel, TunnelContext, TunnelInfo, TunnelKind};
use crate::transport::{join_host_port, TcpTransport, Transport};

#[derive(Default)]
struct Registry {
    forwards: HashMap<u16, Arc<Tunnel>>,
    reverses: HashMap<u16, Arc<Tunnel>>,
}

impl Registry {
    fn contains(&self, local_port: u16) -> bool {
        self.forwards.contains_key(&local_port) || self.reverses.contains_key(&local_port)
    }

    fn get(&self, local_port: u16) -> Option<&Arc<Tunnel>> {
        self.forwards
            .get(&local_port)
            .or_else(|| self.reverses.get(&local_port))
    }

    fn remove(&mut self, local_port: u16) -> Option<Arc<Tunnel>> {
        self.forwards
            .remove(&local_port)
            .or_else(|| self.reverses.remove(&local_port))
    }

    fn all(&self) -> Vec<Arc<Tunnel>> {
        self.forwards
            .values()
            .chain(self.reverses.values())
            .cloned()
            .collect()
    }
}

/// A started tunnel
struct TunnelTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Port forwarding manager
///
/// Registration validates and stores tunnels without doing I/O.
/// [`ForwardManager::start`] spawns one task per tunnel; anything registered
/// afterwards starts immediately.
pub struct ForwardManager {
    local_interface: String,
    remote_interface: String,
    check_local_availability: bool,
    ctx: Arc<TunnelContext>,
    registry: RwLock<Registry>,
    /// Child of the caller's token, set once by `start`
    root: Mutex<Option<CancellationToken>>,
    tasks: Mutex<HashMap<u16, TunnelTask>>,
}

impl ForwardManager {
    /// Manager whose local side is plain TCP on this machine
    pub fn new(config: &ForwardingConfig, session: Arc<dyn Transport>) -> Self {
        Self::with_local_transport(config, session, Arc::new(TcpTransport::new()))
    }

    pub fn with_local_transport(
        config: &ForwardingConfig,
        session: Arc<dyn Transport>,
        local: Arc<dyn Transport>,
    ) -> Self {
        let ctx = TunnelContext {
            pool: Arc::new(ListenerPool::new(session.clone())),
            session,
            local,
            connector: RetryingConnector::new(config.connect_attempts, config.connect_backoff()),
            accept_retry_interval: config.accept_retry_interval(),
            idle_timeout: config.idle_timeout(),
            max_connections: config.max_connections(),
            events: ForwardEventEmitter::new(),
        };

        Self {
            local_interface: config.local_interface.clone(),
            remote_interface: config.remote_interface.clone(),
            check_local_availability: config.check_local_availability,
            ctx: Arc::new(ctx),
            registry: RwLock::new(Registry::default()),
            root: Mutex::new(None),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a manager and register every mapping in `config`
    pub async fn from_config(
        config: &ForwardingConfig,
        session: Arc<dyn Transport>,
    ) -> Result<Self, ForwardError> {
        let manager = Self::new(config, session);
        for mapping in &config.forwards {
            manager.add_forward(mapping.local, mapping.remote).await?;
        }
        for mapping in &config.reverses {
            manager.add_reverse(mapping.local, mapping.remote).await?;
        }
        Ok(manager)
    }

    /// Relay connections accepted on `local_interface:local` to
    /// `remote_interface:remote` through the session
    pub async fn add_forward(&self, local: u16, remote: u16) -> Result<(), ForwardError> {
        self.add(TunnelKind::Forward, local, remote)
    }

    /// Relay connections the session accepts on `remote_interface:remote` to
    /// `local_interface:local`
    pub async fn add_reverse(&self, local: u16, remote: u16) -> Result<(), ForwardError> {
        self.add(TunnelKind::Reverse, local, remote)
    }

    fn add(&self, kind: TunnelKind, local: u16, remote: u16) -> Result<(), ForwardError> {
        let tunnel = self.register(kind, local, remote)?;
        info!("Registered {}", tunnel);

        let root = self.root.lock().clone();
        if let Some(root) = root {
            self.spawn_tunnel(tunnel, &root);
        }
        Ok(())
    }

    fn register(
        &self,
        kind: TunnelKind,
        local: u16,
        remote: u16,
    ) -> Result<Arc<Tunnel>, ForwardError> {
        if local == 0 {
            return Err(ForwardError::InvalidPort(local));
        }
        if remote == 0 {
            return Err(ForwardError::InvalidPort(remote));
        }

        let local_address = join_host_port(&self.local_interface, local);
        let remote_address = join_host_port(&self.remote_interface, remote);

        let mut registry = self.registry.write();
        if registry.contains(local) {
            return Err(ForwardError::Conflict { port: local });
        }

        if kind == TunnelKind::Forward && self.check_local_availability {
            probe_local_port(&local_address)?;
        }

        let tunnel = Arc::new(Tunnel::new(kind, local, local_address, remote_address));
        match kind {
            TunnelKind::Forward => registry.forwards.insert(local, tunnel.clone()),
            TunnelKind::Reverse => registry.reverses.insert(local, tunnel.clone()),
        };
        Ok(tunnel)
    }

    fn spawn_tunnel(&self, tunnel: Arc<Tunnel>, root: &CancellationToken) {
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&tunnel.local_port()) {
            return;
        }

        let cancel = root.child_token();
        let local_port = tunnel.local_port();
        let handle = tokio::spawn(tunnel.run(self.ctx.clone(), cancel.clone()));
        tasks.insert(local_port, TunnelTask { cancel, handle });
    }

    /// Start every registered tunnel. All of them stop when `cancel` fires.
    pub fn start(&self, cancel: &CancellationToken) {
        let root = {
            let mut slot = self.root.lock();
            if slot.is_some() {
                warn!("Forward manager already started");
                return;
            }
            let root = cancel.child_token();
            *slot = Some(root.clone());
            root
        };

        let tunnels = self.registry.read().all();
        info!("Starting {} tunnel(s)", tunnels.len());
        for tunnel in tunnels {
            self.spawn_tunnel(tunnel, &root);
        }
    }

    pub fn is_started(&self) -> bool {
        self.root.lock().is_some()
    }

    /// Cancel every tunnel and wait until all listeners are released
    pub async fn stop(&self) {
        if let Some(root) = self.root.lock().as_ref() {
            root.cancel();
        }
        self.wait().await;
    }

    /// Wait for every started tunnel to finish.
    ///
    /// Returns once all tunnel tasks have exited (after an external cancel)
    /// and the listener pool has been emptied. Tunnels added while waiting
    /// are waited for too.
    pub async fn wait(&self) {
        loop {
            let tasks: Vec<(u16, TunnelTask)> = self.tasks.lock().drain().collect();
            if tasks.is_empty() {
                break;
            }
            for (local_port, task) in tasks {
                if let Err(e) = task.handle.await {
                    error!("Tunnel on port {} panicked: {}", local_port, e);
                }
            }
        }

        self.ctx.pool.close_all().await;
        info!("All tunnels stopped");
    }

    /// Stop and unregister the tunnel on `local_port`
    pub async fn remove(&self, local_port: u16) -> Result<TunnelInfo, ForwardError> {
        let tunnel = self
            .registry
            .write()
            .remove(local_port)
            .ok_or(ForwardError::NotFound(local_port))?;

        let task = self.tasks.lock().remove(&local_port);
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                error!("{} panicked: {}", tunnel, e);
            }
        }

        info!("Removed {}", tunnel);
        Ok(tunnel.info())
    }

    /// Snapshot of every tunnel, ordered by local port
    pub fn list(&self) -> Vec<TunnelInfo> {
        let mut infos: Vec<TunnelInfo> = self
            .registry
            .read()
            .all()
            .iter()
            .map(|tunnel| tunnel.info())
            .collect();
        infos.sort_by_key(|info| info.local_port);
        infos
    }

    pub fn get(&self, local_port: u16) -> Option<TunnelInfo> {
        self.registry.read().get(local_port).map(|tunnel| tunnel.info())
    }

    pub fn stats(&self, local_port: u16) -> Option<ForwardStats> {
        self.registry
            .read()
            .get(local_port)
            .map(|tunnel| tunnel.stats())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.ctx.events.subscribe()
    }

    pub fn local_interface(&self) -> &str {
        &self.local_interface
    }

    pub fn remote_interface(&self) -> &str {
        &self.remote_interface
    }
}

impl Drop for ForwardManager {
    fn drop(&mut self) {
        if let Some(root) = self.root.lock().take() {
            root.cancel();
        }
    }
}

/// Fail early if a forward's local address cannot be bound
fn probe_local_port(address: &str) -> Result<(), ForwardError> {
    match std::net::TcpListener::bind(address) {
        Ok(_) => Ok(()),
        Err(e) => {
            let reason = match e.kind() {
                std::io::ErrorKind::AddrInUse => "port already in use".to_string(),
                std::io::ErrorKind::PermissionDenied => {
                    "permission denied, ports below 1024 require elevated privileges".to_string()
                }
                _ => e.to_string(),
            };
            Err(ForwardError::PortUnavailable {
                address: address.to_string(),
                reason,
            })
        }
    }
}
