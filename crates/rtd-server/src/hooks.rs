//! Collaborators the hub calls out to: entity store, queue, workflow agents,
//! lab port allocation and the extension handler.
//!
//! Each has an in-memory or no-op implementation so the server runs
//! standalone.

use crate::auth::{AllowAll, Authorizer, InMemorySessionStore, NextHandler, NotFound, SessionStore};
use crate::connection::ConnectionId;
use dashmap::DashMap;
use rtd_core::{
    CodecRegistry, CrudMessage, CrudType, CrudValue, QueueMessage, RtdMessage, RtdResult,
};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

/// Generic key/value entity store, addressed by topic.
pub trait EntityStore: Send + Sync {
    /// Persist the named store.
    fn save(&self, store_id: &str) -> RtdResult<()>;

    /// Apply a CRUD mutation whose value has already been type-resolved.
    fn apply(&self, topic: &str, op: &CrudMessage, value: CrudValue) -> RtdResult<()>;
}

/// Receives queue items before they are shared.
pub trait QueueHook: Send + Sync {
    fn update_queue(&self, item: &QueueMessage) -> RtdResult<()>;
}

/// Controls the agents that belong to a workflow.
pub trait AgentControl: Send + Sync {
    fn stop_workflow_agents(&self, workflow: &str) -> RtdResult<()>;
}

/// Backend ports allocated to running lab workflows.
pub trait LabPorts: Send + Sync {
    fn backend_port(&self, session_cookie: &str, workflow: &str) -> Option<u16>;
}

/// Handles message types the hub does not know.
///
/// Returning `Some((topic, message))` shares `message` on `topic`.
pub trait ExtensionHandler: Send + Sync {
    fn handle<'a>(
        &'a self,
        sender: &'a ConnectionId,
        message: &'a RtdMessage,
        raw: &'a str,
    ) -> Pin<Box<dyn Future<Output = RtdResult<Option<(String, String)>>> + Send + 'a>>;
}

/// Entity store kept entirely in memory.
#[derive(Default)]
pub struct MemoryEntityStore {
    stores: DashMap<String, DashMap<String, Value>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, topic: &str, id: &str) -> Option<Value> {
        let store = self.stores.get(topic)?;
        let value = store.get(id)?.value().clone();
        Some(value)
    }

    pub fn len(&self, topic: &str) -> usize {
        self.stores.get(topic).map(|s| s.len()).unwrap_or(0)
    }
}

impl EntityStore for MemoryEntityStore {
    fn save(&self, store_id: &str) -> RtdResult<()> {
        info!(store = %store_id, entries = self.len(store_id), "store saved");
        Ok(())
    }

    fn apply(&self, topic: &str, op: &CrudMessage, value: CrudValue) -> RtdResult<()> {
        let store = self.stores.entry(topic.to_string()).or_default();
        let exists = store.contains_key(&op.id);
        match (exists, op.crud_type) {
            (true, CrudType::Delete) => {
                store.remove(&op.id);
            }
            (true, _) | (false, CrudType::Create | CrudType::Update) => {
                store.insert(op.id.clone(), value.into_json());
            }
            (false, _) => {
                debug!(topic = %topic, id = %op.id, "crud on missing entry ignored");
            }
        }
        Ok(())
    }
}

/// Accepts every queue item unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopQueueHook;

impl QueueHook for NoopQueueHook {
    fn update_queue(&self, item: &QueueMessage) -> RtdResult<()> {
        debug!(queue_id = %item.id, topic = %item.topic_id, "queue item updated");
        Ok(())
    }
}

/// Logs agent stop requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAgentControl;

impl AgentControl for NoopAgentControl {
    fn stop_workflow_agents(&self, workflow: &str) -> RtdResult<()> {
        info!(workflow = %workflow, "stopping workflow agents");
        Ok(())
    }
}

/// (session cookie, workflow id) → backend port.
#[derive(Default)]
pub struct LabPortTable {
    ports: DashMap<(String, String), u16>,
}

impl LabPortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_cookie: &str, workflow: &str, port: u16) {
        self.ports
            .insert((session_cookie.to_string(), workflow.to_string()), port);
    }

    pub fn remove(&self, session_cookie: &str, workflow: &str) {
        self.ports
            .remove(&(session_cookie.to_string(), workflow.to_string()));
    }
}

impl LabPorts for LabPortTable {
    fn backend_port(&self, session_cookie: &str, workflow: &str) -> Option<u16> {
        self.ports
            .get(&(session_cookie.to_string(), workflow.to_string()))
            .map(|p| *p.value())
    }
}

/// Everything the hub delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionStore>,
    pub authorizer: Arc<dyn Authorizer>,
    pub entities: Arc<dyn EntityStore>,
    pub queue: Arc<dyn QueueHook>,
    pub agents: Arc<dyn AgentControl>,
    pub labs: Arc<dyn LabPorts>,
    pub next: Arc<dyn NextHandler>,
    pub extension: Option<Arc<dyn ExtensionHandler>>,
    pub codecs: CodecRegistry,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            sessions: Arc::new(InMemorySessionStore::new()),
            authorizer: Arc::new(AllowAll),
            entities: Arc::new(MemoryEntityStore::new()),
            queue: Arc::new(NoopQueueHook),
            agents: Arc::new(NoopAgentControl),
            labs: Arc::new(LabPortTable::new()),
            next: Arc::new(NotFound),
            extension: None,
            codecs: CodecRegistry::new(),
        }
    }
}
