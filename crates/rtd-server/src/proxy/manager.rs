//! Tunnel table keyed by (browser connection, path).

use super::tunnel::{BackendConnector, ProxyTunnel, ReplyMode, TunnelSettings, TunnelState};
use crate::connection::{Connection, ConnectionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identifies a tunnel: the browser connection that owns it and the path
/// it forwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    /// Owning browser connection.
    pub connection: ConnectionId,
    /// Request path forwarded to the backend, query included.
    pub path: String,
}

impl TunnelKey {
    pub fn new(connection: ConnectionId, path: impl Into<String>) -> Self {
        Self {
            connection,
            path: path.into(),
        }
    }
}

/// Live tunnels of every connection. At most one tunnel exists per key.
pub struct TunnelManager {
    /// One entry per (connection, path); closed tunnels are replaced on reopen.
    tunnels: DashMap<TunnelKey, Arc<ProxyTunnel>>,
    /// Shared by every tunnel this manager builds.
    connector: Arc<dyn BackendConnector>,
    /// Retry, timeout and frame limits handed to each new tunnel.
    settings: TunnelSettings,
}

impl TunnelManager {
    /// An empty table whose tunnels connect through `connector`.
    pub fn new(connector: Arc<dyn BackendConnector>, settings: TunnelSettings) -> Self {
        Self {
            tunnels: DashMap::new(),
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    /// Open the tunnel for `key`, or wait on the one already opening.
    ///
    /// A closed or abandoned tunnel under the same key is replaced.
    pub async fn open(
        &self,
        key: TunnelKey,
        browser: Arc<Connection>,
        target: &str,
        headers: &[(String, String)],
        mode: ReplyMode,
    ) -> TunnelState {
        let (tunnel, replaced) = match self.tunnels.entry(key.clone()) {
            Entry::Occupied(existing)
                if !existing.get().is_abandoned()
                    && existing.get().state() != TunnelState::Closed =>
            {
                debug!(conn_id = %key.connection, path = %key.path, "tunnel exists, waiting on it");
                (existing.get().clone(), None)
            }
            Entry::Occupied(mut stale) => {
                let tunnel = self.build(&key, browser, target, headers, mode);
                let old = stale.insert(tunnel.clone());
                (tunnel, Some(old))
            }
            Entry::Vacant(slot) => {
                let tunnel = self.build(&key, browser, target, headers, mode);
                slot.insert(tunnel.clone());
                (tunnel, None)
            }
        };
        if let Some(old) = replaced {
            old.close().await;
        }

        let state = tunnel.ensure_open().await;
        if state == TunnelState::Open {
            info!(
                conn_id = %key.connection,
                path = %key.path,
                target = %tunnel.target(),
                "proxy opened"
            );
        } else {
            warn!(conn_id = %key.connection, path = %key.path, state = ?state, "proxy not open");
        }
        state
    }

    fn build(
        &self,
        key: &TunnelKey,
        browser: Arc<Connection>,
        target: &str,
        headers: &[(String, String)],
        mode: ReplyMode,
    ) -> Arc<ProxyTunnel> {
        ProxyTunnel::new(
            key.path.clone(),
            target,
            headers.to_vec(),
            mode,
            browser,
            self.connector.clone(),
            self.settings.clone(),
        )
    }

    /// Forward `payload` over the tunnel for `key`. Returns whether it was written.
    pub async fn send(&self, key: &TunnelKey, payload: &str) -> bool {
        let Some(tunnel) = self.get(key) else {
            warn!(conn_id = %key.connection, path = %key.path, "no tunnel, message dropped");
            return false;
        };
        tunnel.send(payload).await
    }

    pub fn get(&self, key: &TunnelKey) -> Option<Arc<ProxyTunnel>> {
        self.tunnels.get(key).map(|t| t.value().clone())
    }

    pub fn state(&self, key: &TunnelKey) -> Option<TunnelState> {
        self.tunnels.get(key).map(|t| t.state())
    }

    pub fn contains(&self, key: &TunnelKey) -> bool {
        self.tunnels.contains_key(key)
    }

    /// Close and remove one tunnel.
    pub async fn close(&self, key: &TunnelKey) -> bool {
        match self.tunnels.remove(key) {
            Some((_, tunnel)) => {
                tunnel.close().await;
                debug!(conn_id = %key.connection, path = %key.path, "proxy closed");
                true
            }
            None => false,
        }
    }

    /// Close every tunnel owned by `connection`. Returns how many were closed.
    pub async fn close_all_for(&self, connection: &ConnectionId) -> usize {
        let keys: Vec<TunnelKey> = self
            .tunnels
            .iter()
            .filter(|t| &t.key().connection == connection)
            .map(|t| t.key().clone())
            .collect();
        let mut closed = 0;
        for key in keys {
            if self.close(&key).await {
                closed += 1;
            }
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}
