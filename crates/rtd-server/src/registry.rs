//! Connection registry.
//!
//! Maps connection ids to live connections and their remote addresses, and
//! tracks which workflow (if any) a connection serves.

use crate::connection::{Connection, ConnectionId, DEFAULT_SEND_TIMEOUT};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use rtd_core::transport::FrameSink;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Live connections by id, plus the workflow each one serves.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    addresses: DashMap<ConnectionId, IpAddr>,
    workflow_by_conn: DashMap<ConnectionId, String>,
    conn_by_workflow: DashMap<String, ConnectionId>,
    /// Applied to every connection created by `add`.
    send_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self {
            connections: DashMap::new(),
            addresses: DashMap::new(),
            workflow_by_conn: DashMap::new(),
            conn_by_workflow: DashMap::new(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl ConnectionRegistry {
    /// Empty registry using the default send timeout.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Register a new connection under a fresh id.
    pub fn add(&self, sink: Box<dyn FrameSink>, remote_addr: Option<IpAddr>) -> Arc<Connection> {
        loop {
            let id = ConnectionId::generate();
            if let Entry::Vacant(slot) = self.connections.entry(id.clone()) {
                let conn = Arc::new(
                    Connection::new(id.clone(), sink, remote_addr)
                        .with_send_timeout(self.send_timeout),
                );
                slot.insert(conn.clone());
                if let Some(ip) = remote_addr {
                    self.addresses.insert(id.clone(), ip);
                }
                debug!(conn_id = %id, "connection registered");
                return conn;
            }
        }
    }

    /// Register an already-constructed connection. Returns `false` if the id is taken.
    pub fn insert(&self, conn: Arc<Connection>) -> bool {
        match self.connections.entry(conn.id().clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                if let Some(ip) = conn.remote_addr() {
                    self.addresses.insert(conn.id().clone(), ip);
                }
                slot.insert(conn);
                true
            }
        }
    }

    pub fn get_by_id(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| c.value().clone())
    }

    pub fn remote_addr(&self, id: &ConnectionId) -> Option<IpAddr> {
        self.addresses.get(id).map(|a| *a.value())
    }

    /// Drop the socket and address entries without closing the socket.
    pub fn forget(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.addresses.remove(id);
        self.connections.remove(id).map(|(_, conn)| conn)
    }

    /// Close `conn` with a normal-closure code and drop its entries.
    ///
    /// The close goes through the handle, so a connection already forgotten
    /// by an eviction is still closed. Returns whether it was registered.
    pub async fn remove(&self, conn: &Arc<Connection>) -> bool {
        let registered = self.forget(conn.id()).is_some();
        if let Err(e) = conn.close("").await {
            debug!(conn_id = %conn.id(), error = %e, "close frame not delivered");
        }
        registered
    }

    /// Record that `id` serves `workflow`, replacing any earlier mapping.
    pub fn register_workflow(&self, id: &ConnectionId, workflow: &str) {
        if let Some(previous) = self.workflow_by_conn.insert(id.clone(), workflow.to_string()) {
            self.conn_by_workflow.remove_if(&previous, |_, owner| owner == id);
        }
        self.conn_by_workflow.insert(workflow.to_string(), id.clone());
        info!(conn_id = %id, workflow = %workflow, "workflow registered");
    }

    /// Remove and return the workflow registered against `id`.
    pub fn take_workflow(&self, id: &ConnectionId) -> Option<String> {
        let (_, workflow) = self.workflow_by_conn.remove(id)?;
        self.conn_by_workflow.remove_if(&workflow, |_, owner| owner == id);
        Some(workflow)
    }

    pub fn workflow_of(&self, id: &ConnectionId) -> Option<String> {
        self.workflow_by_conn.get(id).map(|w| w.value().clone())
    }

    pub fn connection_for_workflow(&self, workflow: &str) -> Option<Arc<Connection>> {
        let id = self.conn_by_workflow.get(workflow)?.value().clone();
        self.get_by_id(&id)
    }

    /// Snapshot of all registered connections.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    /// Send `payload` to every connection. Connections whose write fails are
    /// forgotten and returned.
    pub async fn broadcast(&self, payload: &str) -> Vec<ConnectionId> {
        let targets = self.snapshot();
        let results = join_all(targets.iter().map(|conn| conn.send(payload))).await;

        let mut failed = Vec::new();
        for (conn, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                warn!(conn_id = %conn.id(), error = %e, "broadcast send failed, evicting");
                self.forget(conn.id());
                failed.push(conn.id().clone());
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
