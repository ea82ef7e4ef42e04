//! Routing of inbound messages to their handlers.
//!
//! Every handler runs behind one boundary: an error is logged with the
//! message type and the message is dropped, the connection stays open.

use crate::hub::{ConnectionContext, Hub};
use crate::proxy::{ReplyMode, TunnelKey};
use chrono::Utc;
use rtd_core::codec::filter_value_text;
use rtd_core::{
    CrudMessage, CrudValue, HttpProxyRequest, MessageType, QueueMessage, RtdError, RtdMessage,
    RtdResult,
};
use tracing::{debug, warn};

impl Hub {
    /// Handle one complete text message from `ctx`.
    pub async fn dispatch(&self, ctx: &ConnectionContext, raw: &str) {
        let conn_id = ctx.connection.id();
        if raw.trim().is_empty() {
            debug!(conn_id = %conn_id, "empty message ignored");
            return;
        }
        if self.is_lab_path(&ctx.path) {
            self.forward_lab(ctx, raw).await;
            return;
        }

        let message = match RtdMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(conn_id = %conn_id, message_type = "unknown", error = %e, "envelope dropped");
                return;
            }
        };
        let message_type = message.msg_type.label();
        if let Err(e) = self.route(ctx, &message, raw).await {
            warn!(conn_id = %conn_id, message_type, error = %e, "handler fault, message dropped");
        }
    }

    async fn route(
        &self,
        ctx: &ConnectionContext,
        message: &RtdMessage,
        raw: &str,
    ) -> RtdResult<()> {
        match message.msg_type {
            MessageType::Subscribe => self.on_subscribe(ctx, message, raw).await,
            MessageType::SaveStore => {
                let store_id = message.content_text();
                self.collaborators.entities.save(&store_id)
            }
            MessageType::Ping => {
                let reply = RtdMessage::ping_reply(Utc::now()).encode()?;
                ctx.connection.send(&reply).await
            }
            MessageType::RegisterWorkflow => {
                let workflow = message.content_text();
                if workflow.is_empty() {
                    return Err(RtdError::HandlerFault("workflow registration without id".into()));
                }
                self.register_workflow(ctx.connection.id(), &workflow);
                Ok(())
            }
            MessageType::UpdateQueue => self.on_update_queue(ctx, message, raw).await,
            MessageType::Crud => self.on_crud(ctx, message, raw).await,
            MessageType::ProxyOpen => self.on_proxy_open(ctx, message).await,
            MessageType::ProxyContent => self.on_proxy_content(ctx, message).await,
            MessageType::ProxyClose => {
                let request: HttpProxyRequest = message.content_as()?;
                let key = TunnelKey::new(ctx.connection.id().clone(), request.url);
                if !self.tunnels.close(&key).await {
                    debug!(conn_id = %key.connection, path = %key.path, "close for unknown tunnel");
                }
                Ok(())
            }
            MessageType::Other(_) => self.on_extension(ctx, message, raw).await,
        }
    }

    async fn on_subscribe(
        &self,
        ctx: &ConnectionContext,
        message: &RtdMessage,
        raw: &str,
    ) -> RtdResult<()> {
        let topic = message.content_text();
        if topic.is_empty() {
            return Err(RtdError::HandlerFault("subscribe without topic".into()));
        }
        let outcome = self
            .subscriptions
            .subscribe(&topic, &ctx.connection, &ctx.identity);
        if outcome.trader_granted {
            ctx.connection.send(raw).await?;
        }
        Ok(())
    }

    async fn on_update_queue(
        &self,
        ctx: &ConnectionContext,
        message: &RtdMessage,
        raw: &str,
    ) -> RtdResult<()> {
        let item: QueueMessage = message.content_as()?;
        self.collaborators.queue.update_queue(&item)?;
        self.share(Some(ctx.connection.id()), &item.topic_id, raw).await;
        Ok(())
    }

    async fn on_crud(
        &self,
        ctx: &ConnectionContext,
        message: &RtdMessage,
        raw: &str,
    ) -> RtdResult<()> {
        let op: CrudMessage = message.content_as()?;
        if op.targets_class(&self.settings.store_class) {
            let value = match self
                .collaborators
                .codecs
                .resolve(op.value_type.as_deref(), &op.value)
            {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        topic = %op.topic_id,
                        value_type = ?op.value_type,
                        error = %e,
                        "value not decodable, storing text"
                    );
                    CrudValue::Opaque(filter_value_text(&op.value))
                }
            };
            self.collaborators.entities.apply(&op.topic_id, &op, value)?;
        }
        self.share(Some(ctx.connection.id()), &op.topic_id, raw).await;
        Ok(())
    }

    async fn on_proxy_open(&self, ctx: &ConnectionContext, message: &RtdMessage) -> RtdResult<()> {
        let request: HttpProxyRequest = message.content_as()?;
        let target = match request.content.as_deref() {
            Some(target) if !target.is_empty() => target.to_string(),
            _ => return Err(RtdError::HandlerFault("proxy open without target".into())),
        };
        let key = TunnelKey::new(ctx.connection.id().clone(), request.url.clone());
        self.tunnels
            .open(
                key,
                ctx.connection.clone(),
                &target,
                &request.header_tuples(),
                self.envelope_reply_mode(),
            )
            .await;
        Ok(())
    }

    async fn on_proxy_content(
        &self,
        ctx: &ConnectionContext,
        message: &RtdMessage,
    ) -> RtdResult<()> {
        let request: HttpProxyRequest = message.content_as()?;
        let key = TunnelKey::new(ctx.connection.id().clone(), request.url.clone());
        if !self.tunnels.contains(&key) {
            let Some(target) = self.lab_target(&ctx.cookie, &request.url) else {
                warn!(
                    conn_id = %key.connection,
                    path = %key.path,
                    "no tunnel for proxy content, dropped"
                );
                return Ok(());
            };
            self.tunnels
                .open(
                    key.clone(),
                    ctx.connection.clone(),
                    &target,
                    &ctx.headers,
                    self.envelope_reply_mode(),
                )
                .await;
        }
        self.tunnels
            .send(&key, request.content.as_deref().unwrap_or_default())
            .await;
        Ok(())
    }

    async fn on_extension(
        &self,
        ctx: &ConnectionContext,
        message: &RtdMessage,
        raw: &str,
    ) -> RtdResult<()> {
        let Some(handler) = &self.collaborators.extension else {
            debug!(
                conn_id = %ctx.connection.id(),
                message_type = i32::from(message.msg_type),
                "no extension handler, message dropped"
            );
            return Ok(());
        };
        if let Some((topic, outbound)) = handler.handle(ctx.connection.id(), message, raw).await? {
            self.share(Some(ctx.connection.id()), &topic, &outbound).await;
        }
        Ok(())
    }

    /// Raw traffic on a lab path goes to the connection's own tunnel.
    async fn forward_lab(&self, ctx: &ConnectionContext, raw: &str) {
        let key = TunnelKey::new(ctx.connection.id().clone(), ctx.path.clone());
        if !self.tunnels.contains(&key) && !self.open_lab_tunnel(ctx, &ctx.path).await {
            warn!(
                conn_id = %key.connection,
                path = %key.path,
                "lab message without backend, dropped"
            );
            return;
        }
        self.tunnels.send(&key, raw).await;
    }

    fn envelope_reply_mode(&self) -> ReplyMode {
        if self.settings.wrap_envelope_replies {
            ReplyMode::Envelope
        } else {
            ReplyMode::Raw
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::connection::ConnectionId;
    use crate::hooks::{Collaborators, ExtensionHandler, LabPortTable};
    use crate::hub::{ConnectionContext, Hub, HubSettings};
    use crate::testing::{user, DenyUsers, FakeConnector, RecordingSink, SinkProbe, SourceEvent};
    use rtd_core::{RtdMessage, RtdResult};
    use serde_json::json;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::time::Duration;

    fn hub_with(collaborators: Collaborators) -> (Hub, FakeConnector) {
        let connector = FakeConnector::default();
        let hub = Hub::new(HubSettings::default(), collaborators, Arc::new(connector.clone()));
        (hub, connector)
    }

    fn hub() -> (Hub, FakeConnector) {
        hub_with(Collaborators::default())
    }

    fn attach(hub: &Hub, name: &str) -> (ConnectionContext, SinkProbe) {
        let (sink, probe) = RecordingSink::new();
        let ctx = hub.admit(
            Box::new(sink),
            None,
            user(name),
            format!("cookie-{name}"),
            "/ws".into(),
            vec![("Cookie".into(), format!("coflows=cookie-{name}"))],
        );
        (ctx, probe)
    }

    async fn eventually<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn subscribe(topic: &str) -> String {
        json!({"Type": 1, "Content": topic}).to_string()
    }

    #[tokio::test]
    async fn queue_update_shared_with_others_only() {
        let (hub, _) = hub();
        let (a, a_probe) = attach(&hub, "a");
        let (b, b_probe) = attach(&hub, "b");
        hub.dispatch(&a, &subscribe("42")).await;
        hub.dispatch(&b, &subscribe("42")).await;

        let update = json!({
            "Type": 11,
            "Content": {"ID": "q1", "TopicID": "42", "Comment": "run"}
        })
        .to_string();
        hub.dispatch(&a, &update).await;

        assert!(a_probe.sent().is_empty());
        assert_eq!(b_probe.sent(), vec![update]);
    }

    #[tokio::test]
    async fn string_encoded_content_accepted() {
        let (hub, _) = hub();
        let (a, _) = attach(&hub, "a");
        let (b, b_probe) = attach(&hub, "b");
        hub.dispatch(&b, &subscribe("7")).await;

        let inner = json!({"ID": "q1", "TopicID": "7"}).to_string();
        let update = json!({"Type": 11, "Content": inner}).to_string();
        hub.dispatch(&a, &update).await;

        assert_eq!(b_probe.sent().len(), 1);
    }

    #[tokio::test]
    async fn trader_subscription_echoed_once() {
        let (hub, _) = hub();
        let (a, a_probe) = attach(&hub, "a");
        let (b, b_probe) = attach(&hub, "b");

        hub.dispatch(&a, &subscribe("$X")).await;
        hub.dispatch(&b, &subscribe("$X")).await;

        assert_eq!(a_probe.sent(), vec![subscribe("$X")]);
        assert!(b_probe.sent().is_empty());
        assert_eq!(hub.subscriptions().trader("X"), Some(a.connection.id().clone()));
        assert!(hub.subscriptions().is_subscribed("X", b.connection.id()));
    }

    #[tokio::test]
    async fn register_workflow_binds_connection() {
        let (hub, _) = hub();
        let (a, _) = attach(&hub, "worker");

        hub.dispatch(&a, r#"{"Type":16,"Content":"wf-9"}"#).await;
        hub.dispatch(&a, r#"{"Type":16,"Content":""}"#).await;

        assert_eq!(hub.registry().workflow_of(a.connection.id()).as_deref(), Some("wf-9"));
        let worker = hub.registry().connection_for_workflow("wf-9").unwrap();
        assert_eq!(worker.id(), a.connection.id());
    }

    #[tokio::test]
    async fn ping_replies_with_server_time() {
        let (hub, _) = hub();
        let (a, a_probe) = attach(&hub, "a");

        hub.dispatch(&a, r#"{"Type":15,"Content":"2020-01-01T00:00:00"}"#).await;

        let reply = &a_probe.sent_json()[0];
        assert_eq!(reply["Type"], json!(15));
        let stamp = reply["Content"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
    }

    #[tokio::test]
    async fn denied_subscriber_skipped_on_crud() {
        let collaborators = Collaborators {
            authorizer: Arc::new(DenyUsers::new(&["b"])),
            ..Collaborators::default()
        };
        let (hub, _) = hub_with(collaborators);
        let (a, _) = attach(&hub, "a");
        let (b, b_probe) = attach(&hub, "b");
        let (c, c_probe) = attach(&hub, "c");
        for ctx in [&a, &b, &c] {
            hub.dispatch(ctx, &subscribe("m-1")).await;
        }

        let crud = json!({
            "Type": 14,
            "Content": {"TopicID": "m-1", "ID": "e1", "Type": 2, "Value": "x"}
        })
        .to_string();
        hub.dispatch(&a, &crud).await;

        assert_eq!(b_probe.attempts(), 0);
        assert_eq!(c_probe.sent(), vec![crud]);
    }

    #[tokio::test]
    async fn garbage_and_empty_messages_dropped() {
        let (hub, _) = hub();
        let (a, a_probe) = attach(&hub, "a");

        hub.dispatch(&a, "   ").await;
        hub.dispatch(&a, "not json").await;
        hub.dispatch(&a, r#"{"Type":11,"Content":{"bad":true}}"#).await;

        assert!(a_probe.sent().is_empty());
        assert!(a.connection.is_open());
    }

    #[tokio::test]
    async fn proxy_open_then_two_contents_use_one_backend() {
        let (hub, connector) = hub();
        let (a, _) = attach(&hub, "a");

        let open = json!({
            "Type": 20,
            "Content": {
                "Url": "/lab/w1/",
                "Content": "ws://localhost:8888",
                "Headers": [
                    {"Key": "Sec-WebSocket-Key", "Value": "x"},
                    {"Key": "Origin", "Value": "https://coflows.quant.app"}
                ]
            }
        })
        .to_string();
        hub.dispatch(&a, &open).await;
        for payload in ["one", "two"] {
            let content = json!({"Type": 21, "Content": {"Url": "/lab/w1/", "Content": payload}});
            hub.dispatch(&a, &content.to_string()).await;
        }

        assert_eq!(connector.connects(), 1);
        assert_eq!(connector.backend(0).sent(), vec!["one", "two"]);
        let request = &connector.requests()[0];
        assert_eq!(request.url, "ws://localhost:8888/lab/w1/");
        assert!(request.headers.iter().all(|(k, _)| k != "Sec-WebSocket-Key"));
    }

    #[tokio::test]
    async fn envelope_tunnel_replies_are_wrapped() {
        let (hub, connector) = hub();
        let (a, a_probe) = attach(&hub, "a");
        let open = json!({"Type": 20, "Content": {"Url": "/k", "Content": "ws://localhost:1"}});
        hub.dispatch(&a, &open.to_string()).await;

        connector.backend_says(0, SourceEvent::Text("reply".into()));
        eventually(|| !a_probe.sent().is_empty()).await;

        let wrapped = &a_probe.sent_json()[0];
        assert_eq!(wrapped["Type"], json!(21));
        assert_eq!(wrapped["Content"]["Url"], json!("/k"));
        assert_eq!(wrapped["Content"]["Content"], json!("reply"));
    }

    #[tokio::test]
    async fn proxy_close_drops_tunnel() {
        let (hub, connector) = hub();
        let (a, _) = attach(&hub, "a");
        let open = json!({"Type": 20, "Content": {"Url": "/k", "Content": "ws://localhost:1"}});
        hub.dispatch(&a, &open.to_string()).await;
        assert_eq!(hub.tunnels().len(), 1);

        hub.dispatch(&a, &json!({"Type": 22, "Content": {"Url": "/k"}}).to_string())
            .await;

        assert!(hub.tunnels().is_empty());
        assert_eq!(connector.backend(0).close_count(), 1);
    }

    #[tokio::test]
    async fn proxy_content_without_tunnel_uses_lab_table() {
        let labs = Arc::new(LabPortTable::new());
        labs.insert("cookie-a", "w9", 9100);
        let collaborators = Collaborators {
            labs,
            ..Collaborators::default()
        };
        let (hub, connector) = hub_with(collaborators);
        let (a, _) = attach(&hub, "a");

        let content = json!({"Type": 21, "Content": {"Url": "/lab/w9/api", "Content": "hi"}});
        hub.dispatch(&a, &content.to_string()).await;

        assert_eq!(connector.requests()[0].url, "ws://localhost:9100/lab/w9/api");
        assert_eq!(connector.backend(0).sent(), vec!["hi"]);
    }

    #[tokio::test]
    async fn proxy_content_without_tunnel_or_lab_dropped() {
        let (hub, connector) = hub();
        let (a, _) = attach(&hub, "a");
        let content = json!({"Type": 21, "Content": {"Url": "/nowhere", "Content": "hi"}});
        hub.dispatch(&a, &content.to_string()).await;
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test]
    async fn lab_path_without_backend_drops_message() {
        let (hub, connector) = hub();
        let (sink, _) = RecordingSink::new();
        let ctx = hub.admit(
            Box::new(sink),
            None,
            user("a"),
            "c".into(),
            "/lab/w1/x".into(),
            vec![],
        );

        hub.dispatch(&ctx, "raw").await;
        assert_eq!(connector.connects(), 0);
        assert!(hub.tunnels().is_empty());
    }

    struct Relay;

    impl ExtensionHandler for Relay {
        fn handle<'a>(
            &'a self,
            _sender: &'a ConnectionId,
            message: &'a RtdMessage,
            _raw: &'a str,
        ) -> Pin<Box<dyn Future<Output = RtdResult<Option<(String, String)>>> + Send + 'a>> {
            Box::pin(async move {
                Ok(Some(("ext".to_string(), format!("relayed:{}", message.content_text()))))
            })
        }
    }

    #[tokio::test]
    async fn unknown_type_goes_to_extension() {
        let collaborators = Collaborators {
            extension: Some(Arc::new(Relay)),
            ..Collaborators::default()
        };
        let (hub, _) = hub_with(collaborators);
        let (a, a_probe) = attach(&hub, "a");
        let (b, b_probe) = attach(&hub, "b");
        hub.dispatch(&a, &subscribe("ext")).await;
        hub.dispatch(&b, &subscribe("ext")).await;

        hub.dispatch(&a, r#"{"Type":100,"Content":"tick"}"#).await;

        assert!(a_probe.sent().is_empty());
        assert_eq!(b_probe.sent(), vec!["relayed:tick".to_string()]);
    }

    #[tokio::test]
    async fn unknown_type_without_extension_is_dropped() {
        let (hub, _) = hub();
        let (a, a_probe) = attach(&hub, "a");
        hub.dispatch(&a, r#"{"Type":100,"Content":"tick"}"#).await;
        assert!(a_probe.sent().is_empty());
    }
}
