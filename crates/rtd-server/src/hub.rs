//! The hub: owns every registry and runs one read loop per connection.
//!
//! Accepted sockets are upgraded behind the session gate, registered, and
//! read with a growing-buffer frame reader. Each complete text message goes to
//! the dispatcher. When the loop ends, for whatever reason, the connection is
//! torn down: workflow agents stopped, subscriptions dropped, tunnels closed
//! and registry entries removed.

use crate::auth::{GateDecision, SessionGate};
use crate::connection::{Connection, ConnectionId, DEFAULT_SEND_TIMEOUT};
use crate::hooks::Collaborators;
use crate::proxy::{BackendConnector, ReplyMode, TunnelKey, TunnelManager, TunnelSettings};
use crate::registry::ConnectionRegistry;
use crate::subscriptions::SubscriptionTable;
use crate::transport::{split_stream, ws_config};
use chrono::Utc;
use rtd_core::transport::{FrameSink, FrameSource};
use rtd_core::{
    CrudMessage, Frame, FrameLimits, FrameReader, Identity, MessageType, QueueMessage, RtdError,
    RtdMessage, RtdResult,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, info, warn};

/// Runtime settings for a hub instance.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub limits: FrameLimits,
    pub cookie_name: String,
    /// Request paths with this prefix carry raw tunnel traffic.
    pub proxy_prefix: String,
    /// Wrap backend replies on envelope-opened tunnels in `ProxyContent`.
    pub wrap_envelope_replies: bool,
    /// CRUD messages whose `Class` matches are applied to the entity store.
    pub store_class: String,
    /// Re-validate cached subscriber identities older than this.
    pub identity_ttl: Option<Duration>,
    /// Bound on one write to a browser connection; on expiry the peer is evicted.
    pub send_timeout: Duration,
    pub tunnels: TunnelSettings,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            limits: FrameLimits::default(),
            cookie_name: "coflows".into(),
            proxy_prefix: "/lab/".into(),
            wrap_envelope_replies: true,
            store_class: "Kernel.M".into(),
            identity_ttl: None,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            tunnels: TunnelSettings::default(),
        }
    }
}

/// Everything known about an admitted connection.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub connection: Arc<Connection>,
    pub identity: Identity,
    /// Session cookie value the connection was admitted with.
    pub cookie: String,
    /// Path and query string of the upgrade request.
    pub path: String,
    /// Upgrade request headers, `%7C` decoded.
    pub headers: Vec<(String, String)>,
}

/// What the gate learned about an upgrade request.
struct Admission {
    identity: Identity,
    cookie: String,
    path: String,
    headers: Vec<(String, String)>,
}

/// Owns every registry; one instance is shared by all connection tasks.
pub struct Hub {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) subscriptions: SubscriptionTable,
    pub(crate) tunnels: TunnelManager,
    pub(crate) gate: SessionGate,
    pub(crate) collaborators: Collaborators,
    pub(crate) settings: HubSettings,
    shutdown_tx: broadcast::Sender<()>,
}

impl Hub {
    /// Build a hub around `collaborators`; tunnels connect through `connector`.
    pub fn new(
        settings: HubSettings,
        collaborators: Collaborators,
        connector: Arc<dyn BackendConnector>,
    ) -> Self {
        let mut subscriptions = SubscriptionTable::new();
        if let Some(ttl) = settings.identity_ttl {
            subscriptions =
                subscriptions.with_identity_refresh(ttl, collaborators.sessions.clone());
        }
        let gate = SessionGate::new(settings.cookie_name.clone(), collaborators.sessions.clone());
        let tunnels = TunnelManager::new(connector, settings.tunnels.clone());

        Self {
            registry: ConnectionRegistry::new().with_send_timeout(settings.send_timeout),
            subscriptions,
            tunnels,
            gate,
            collaborators,
            settings,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Upgrade `stream` behind the session gate and serve it until it closes.
    ///
    /// A declined request is answered by the next handler and is not an error.
    pub async fn handle_connection<S>(&self, stream: S, remote: Option<IpAddr>) -> RtdResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut admission: Option<Admission> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match self.gate.check(request) {
                GateDecision::Admit { identity, cookie } => {
                    admission = Some(Admission {
                        identity,
                        cookie,
                        path: request_path(request),
                        headers: request_headers(request),
                    });
                    Ok(response)
                }
                GateDecision::Decline(reason) => {
                    debug!(remote = ?remote, reason, "upgrade declined");
                    Err(self.collaborators.next.handle(request))
                }
            }
        };

        let handshake = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            callback,
            Some(ws_config(&self.settings.limits)),
        )
        .await;

        let (ws, admitted) = match (handshake, admission) {
            (Ok(ws), Some(admitted)) => (ws, admitted),
            (Err(e), None) => {
                debug!(remote = ?remote, error = %e, "upgrade not completed");
                return Ok(());
            }
            (Ok(_), None) => {
                return Err(RtdError::AuthenticationMissing("upgrade without session".into()))
            }
            (Err(e), Some(_)) => {
                return Err(RtdError::Transport(format!("WS handshake failed: {e}")))
            }
        };

        let (sink, source) = split_stream(ws);
        let ctx = self.admit(
            Box::new(sink),
            remote,
            admitted.identity,
            admitted.cookie,
            admitted.path,
            admitted.headers,
        );
        self.serve(ctx, source).await
    }

    /// Register an upgraded connection.
    pub fn admit(
        &self,
        sink: Box<dyn FrameSink>,
        remote: Option<IpAddr>,
        identity: Identity,
        cookie: String,
        path: String,
        headers: Vec<(String, String)>,
    ) -> ConnectionContext {
        let connection = self.registry.add(sink, remote);
        info!(
            conn_id = %connection.id(),
            remote = ?remote,
            user = %identity.id,
            path = %path,
            "connection accepted"
        );
        ConnectionContext {
            connection,
            identity,
            cookie,
            path,
            headers,
        }
    }

    /// Read loop for one connection. Tears the connection down when the peer
    /// closes, the read fails, or the hub shuts down.
    pub async fn serve<S: FrameSource>(&self, ctx: ConnectionContext, source: S) -> RtdResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.is_lab_path(&ctx.path) {
            self.open_lab_tunnel(&ctx, &ctx.path).await;
        }

        let conn_id = ctx.connection.id().clone();
        let mut reader = FrameReader::new(source, self.settings.limits);
        let outcome = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(conn_id = %conn_id, "shutdown signal received");
                    break Ok(());
                }
                next = reader.next_message() => match next {
                    Ok(Some(Frame::Text(text))) => self.dispatch(&ctx, &text).await,
                    Ok(Some(Frame::Binary(data))) => {
                        debug!(conn_id = %conn_id, len = data.len(), "binary frame ignored");
                    }
                    Ok(None) => {
                        debug!(conn_id = %conn_id, "peer closed");
                        break Ok(());
                    }
                    Err(e) => {
                        warn!(conn_id = %conn_id, error = %e, "connection read failed");
                        break Err(e);
                    }
                }
            }
        };

        self.teardown(&ctx).await;
        outcome
    }

    /// Stop the connection's workflow agents and drop every trace of it.
    pub async fn teardown(&self, ctx: &ConnectionContext) {
        let id = ctx.connection.id();
        if let Some(workflow) = self.registry.take_workflow(id) {
            if let Err(e) = self.collaborators.agents.stop_workflow_agents(&workflow) {
                warn!(conn_id = %id, workflow = %workflow, error = %e, "agent stop failed");
            }
        }
        self.subscriptions.unsubscribe_all(id);
        let tunnels = self.tunnels.close_all_for(id).await;
        self.registry.remove(&ctx.connection).await;
        info!(conn_id = %id, tunnels, "connection closed");
    }

    /// Fan `raw` out on `topic`, excluding `sender`. Evicted subscribers are
    /// also dropped from the registry.
    pub async fn share(
        &self,
        sender: Option<&ConnectionId>,
        topic: &str,
        raw: &str,
    ) -> Vec<ConnectionId> {
        let evicted = self
            .subscriptions
            .share(sender, topic, raw, self.collaborators.authorizer.as_ref())
            .await;
        for id in &evicted {
            self.registry.forget(id);
        }
        evicted
    }

    /// Server-originated fan-out of a raw message to every authorized
    /// subscriber of `topic`.
    ///
    /// Each subscriber gets one write attempt bounded by the send timeout. A
    /// failed WebSocket write leaves the socket unusable, so the subscriber
    /// is evicted rather than retried.
    pub async fn publish_to(&self, topic: &str, raw: &str) -> Vec<ConnectionId> {
        self.share(None, topic, raw).await
    }

    /// Publish a CRUD or queue message on the topic it names.
    pub async fn publish(&self, message: &RtdMessage) -> RtdResult<Vec<ConnectionId>> {
        let topic = match message.msg_type {
            MessageType::UpdateQueue => message.content_as::<QueueMessage>()?.topic_id,
            MessageType::Crud => message.content_as::<CrudMessage>()?.topic_id,
            other => {
                return Err(RtdError::HandlerFault(format!(
                    "{} messages carry no topic",
                    other.label()
                )))
            }
        };
        let raw = message.encode()?;
        Ok(self.publish_to(&topic, &raw).await)
    }

    /// Mark a queue item executed and publish it on its topic.
    pub async fn process_queue_message(
        &self,
        mut item: QueueMessage,
    ) -> RtdResult<Vec<ConnectionId>> {
        item.mark_executed(Utc::now());
        self.collaborators.queue.update_queue(&item)?;
        let message = RtdMessage::new(MessageType::UpdateQueue, serde_json::to_value(&item)?);
        self.publish(&message).await
    }

    /// Send `message` to every connection.
    pub async fn broadcast(&self, message: &RtdMessage) -> RtdResult<Vec<ConnectionId>> {
        let raw = message.encode()?;
        Ok(self.registry.broadcast(&raw).await)
    }

    /// Record that connection `id` serves `workflow`. `false` if `id` is unknown.
    pub fn register_workflow(&self, id: &ConnectionId, workflow: &str) -> bool {
        if self.registry.get_by_id(id).is_none() {
            return false;
        }
        self.registry.register_workflow(id, workflow);
        true
    }

    /// Stop every connection loop.
    pub fn shutdown(&self) {
        info!(connections = self.registry.len(), "broadcasting shutdown to connections");
        let _ = self.shutdown_tx.send(());
    }

    pub(crate) fn is_lab_path(&self, path: &str) -> bool {
        !self.settings.proxy_prefix.is_empty() && path.starts_with(&self.settings.proxy_prefix)
    }

    /// Workflow id of a lab path: `/lab/<workflow>/...`.
    pub(crate) fn lab_workflow<'p>(&self, path: &'p str) -> Option<&'p str> {
        let rest = path.strip_prefix(self.settings.proxy_prefix.as_str())?;
        let workflow = rest.split(['/', '?']).next()?;
        (!workflow.is_empty()).then_some(workflow)
    }

    /// Backend base URL allocated to the workflow of a lab path.
    pub(crate) fn lab_target(&self, cookie: &str, path: &str) -> Option<String> {
        let workflow = self.lab_workflow(path)?;
        let port = self.collaborators.labs.backend_port(cookie, workflow)?;
        Some(format!("ws://localhost:{port}"))
    }

    /// Open a raw tunnel for a lab path if its workflow has a backend.
    /// Returns whether a tunnel is registered afterwards.
    pub(crate) async fn open_lab_tunnel(&self, ctx: &ConnectionContext, path: &str) -> bool {
        let Some(target) = self.lab_target(&ctx.cookie, path) else {
            debug!(
                conn_id = %ctx.connection.id(),
                path = %path,
                "no backend allocated for lab path"
            );
            return false;
        };
        let key = TunnelKey::new(ctx.connection.id().clone(), path);
        self.tunnels
            .open(key, ctx.connection.clone(), &target, &ctx.headers, ReplyMode::Raw)
            .await;
        true
    }
}

fn request_path(request: &Request) -> String {
    request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

fn request_headers(request: &Request) -> Vec<(String, String)> {
    request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.as_str().to_string(), value.replace("%7C", "|")))
        })
        .collect()
}
