//! Listener Pool
//!
//! Caches one listener per address on the session transport so two reverse
//! tunnels asking for the same remote address share a listener instead of
//! failing with "address in use".
//!
//! Entries are reference counted: every `get_listener` must be paired with a
//! `release`, and the listener is closed only when the last holder releases
//! it. `close_all` force-closes whatever is left when the session ends.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::ForwardError;
use crate::transport::{Listener, Transport};

struct PoolEntry {
    listener: Arc<dyn Listener>,
    refs: usize,
}

pub struct ListenerPool {
    transport: Arc<dyn Transport>,
    /// Held across `listen().await` so concurrent callers never create two
    /// listeners for one address
    listeners: Mutex<HashMap<String, PoolEntry>>,
}

impl ListenerPool {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Return the pooled listener for `address`, creating it on first use
    pub async fn get_listener(&self, address: &str) -> Result<Arc<dyn Listener>, ForwardError> {
        let mut listeners = self.listeners.lock().await;

        if let Some(entry) = listeners.get_mut(address) {
            if !entry.listener.is_closed() {
                entry.refs += 1;
                debug!("Reusing pooled listener on {} (refs={})", address, entry.refs);
                return Ok(entry.listener.clone());
            }
            // Closed behind our back (e.g. the session dropped the forward)
            warn!("Pooled listener on {} was closed, recreating", address);
            listeners.remove(address);
        }

        let listener = self.transport.listen(address).await?;
        listeners.insert(
            address.to_string(),
            PoolEntry {
                listener: listener.clone(),
                refs: 1,
            },
        );
        info!("Created pooled listener on {}", address);
        Ok(listener)
    }

    /// Drop one reference; closes and evicts the listener on the last one
    pub async fn release(&self, address: &str) -> Result<(), ForwardError> {
        let mut listeners = self.listeners.lock().await;

        let Some(entry) = listeners.get_mut(address) else {
            debug!("Release of unknown pooled listener {}", address);
            return Ok(());
        };

        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            debug!("Released pooled listener on {} (refs={})", address, entry.refs);
            return Ok(());
        }

        if let Some(entry) = listeners.remove(address) {
            entry.listener.close().await?;
            info!("Closed pooled listener on {}", address);
        }
        Ok(())
    }

    /// Close every pooled listener regardless of reference counts
    pub async fn close_all(&self) {
        let mut listeners = self.listeners.lock().await;
        for (address, entry) in listeners.drain() {
            if let Err(e) = entry.listener.close().await {
                warn!("Failed to close pooled listener on {}: {}", address, e);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.listeners.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.listeners.lock().await.is_empty()
    }

    /// Current reference count for `address` (0 when not pooled)
    pub async fn ref_count(&self, address: &str) -> usize {
        self.listeners
            .lock()
            .await
            .get(address)
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }
}
