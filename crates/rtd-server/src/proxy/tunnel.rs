//! One outbound tunnel from the hub to a backend WebSocket server.
//!
//! State moves `Unconnected → Connecting → Open → Closed`, and back from
//! `Closed` to `Connecting` while the retry budget lasts. Transitions are
//! published on a watch channel; senders wait on it outside the send lock.

use super::headers::rewrite_headers;
use crate::connection::Connection;
use rtd_core::transport::{FrameSink, FrameSource};
use rtd_core::{
    Frame, FrameLimits, FrameReader, HttpProxyRequest, MessageType, RtdError, RtdMessage,
    RtdResult,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of a tunnel's backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Unconnected,
    Connecting,
    Open,
    Closed,
}

/// How backend replies reach the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Forward the backend text verbatim.
    Raw,
    /// Wrap each reply in a `ProxyContent` envelope carrying the tunnel path.
    Envelope,
}

/// Everything needed to open a backend connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

/// Both halves of an open backend connection.
pub struct BackendStream {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// Opens backend connections.
pub trait BackendConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        request: BackendRequest,
    ) -> Pin<Box<dyn Future<Output = RtdResult<BackendStream>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub connect_timeout: Duration,
    /// Public host name replaced by the backend authority in forwarded headers.
    pub public_host: String,
    pub limits: FrameLimits,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_backoff: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(30),
            public_host: String::new(),
            limits: FrameLimits::default(),
        }
    }
}

/// Bridges one browser connection to one backend path.
pub struct ProxyTunnel {
    path: String,
    target: String,
    headers: Vec<(String, String)>,
    mode: ReplyMode,
    browser: Arc<Connection>,
    connector: Arc<dyn BackendConnector>,
    settings: TunnelSettings,
    state: watch::Sender<TunnelState>,
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    retries: AtomicU32,
    generation: AtomicU64,
    abandoned: AtomicBool,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProxyTunnel {
    pub fn new(
        path: impl Into<String>,
        target: impl Into<String>,
        headers: Vec<(String, String)>,
        mode: ReplyMode,
        browser: Arc<Connection>,
        connector: Arc<dyn BackendConnector>,
        settings: TunnelSettings,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(TunnelState::Unconnected);
        Arc::new(Self {
            path: path.into(),
            target: target.into(),
            headers,
            mode,
            browser,
            connector,
            settings,
            state,
            sink: Mutex::new(None),
            retries: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            abandoned: AtomicBool::new(false),
            reader: std::sync::Mutex::new(None),
        })
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    fn backend_request(&self) -> BackendRequest {
        let base = if self.path.starts_with('/') {
            self.target.trim_end_matches('/')
        } else {
            self.target.as_str()
        };
        BackendRequest {
            url: format!("{base}{}", self.path),
            headers: rewrite_headers(&self.headers, &self.settings.public_host, &self.target),
        }
    }

    /// Claim the right to connect. Only one caller wins per attempt.
    fn begin_connect(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            TunnelState::Unconnected | TunnelState::Closed => {
                *state = TunnelState::Connecting;
                true
            }
            TunnelState::Connecting | TunnelState::Open => false,
        })
    }

    /// Connect to the backend. The caller must have won `begin_connect`.
    async fn connect(self: &Arc<Self>) -> RtdResult<()> {
        let request = self.backend_request();
        debug!(path = %self.path, url = %request.url, "connecting backend");

        let stream = match tokio::time::timeout(
            self.settings.connect_timeout,
            self.connector.connect(request),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state.send_replace(TunnelState::Closed);
                return Err(e);
            }
            Err(_) => {
                self.state.send_replace(TunnelState::Closed);
                return Err(RtdError::Timeout);
            }
        };

        // Install under the sink lock so a concurrent `close` either sees the
        // new sink and reader or is seen here.
        let BackendStream { sink, source } = stream;
        let mut rejected = {
            let mut slot = self.sink.lock().await;
            if self.is_abandoned() {
                Some(sink)
            } else {
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                *slot = Some(sink);
                self.retries.store(0, Ordering::Release);
                self.state.send_replace(TunnelState::Open);
                self.spawn_reader(source, generation);
                None
            }
        };

        if let Some(sink) = rejected.as_mut() {
            if let Err(e) = sink.close("tunnel closed").await {
                debug!(path = %self.path, error = %e, "backend close failed");
            }
            self.state.send_replace(TunnelState::Closed);
            return Err(RtdError::ConnectionClosed);
        }
        info!(path = %self.path, target = %self.target, "backend tunnel open");
        Ok(())
    }

    /// Wait until the tunnel is not `Connecting`, bounded by the connect timeout.
    async fn settle(&self) -> TunnelState {
        let mut rx = self.state.subscribe();
        let settled = match tokio::time::timeout(
            self.settings.connect_timeout,
            rx.wait_for(|s| *s != TunnelState::Connecting),
        )
        .await
        {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        };
        settled.unwrap_or_else(|| self.state())
    }

    /// Connect if nobody else is, then wait for the outcome.
    pub async fn ensure_open(self: &Arc<Self>) -> TunnelState {
        if self.begin_connect() {
            if let Err(e) = self.connect().await {
                warn!(path = %self.path, error = %e, "backend connect failed");
            }
        }
        self.settle().await
    }

    /// Forward `payload` to the backend, reconnecting while the retry budget
    /// lasts. Returns whether the payload was written. Exhausting the budget
    /// abandons the tunnel.
    pub async fn send(self: &Arc<Self>, payload: &str) -> bool {
        let mut attempts = 0u32;
        loop {
            if self.is_abandoned() {
                debug!(path = %self.path, "tunnel abandoned, message dropped");
                return false;
            }

            if self.settle().await == TunnelState::Open {
                let generation = self.generation.load(Ordering::Acquire);
                match self.write(payload).await {
                    Ok(()) => return true,
                    Err(e) => {
                        warn!(path = %self.path, error = %e, "backend write failed");
                        self.mark_closed(generation).await;
                    }
                }
            }

            let used = self.retries.fetch_add(1, Ordering::AcqRel) + 1;
            if used > self.settings.max_retries || attempts >= self.settings.max_retries {
                warn!(
                    path = %self.path,
                    retries = self.settings.max_retries,
                    "retry budget exhausted, abandoning tunnel"
                );
                self.abandon().await;
                return false;
            }
            if attempts > 0 {
                tokio::time::sleep(self.settings.retry_backoff).await;
            }
            attempts += 1;

            warn!(path = %self.path, attempt = used, "backend not open, reconnecting");
            if self.begin_connect() {
                if let Err(e) = self.connect().await {
                    warn!(
                        path = %self.path,
                        attempt = used,
                        error = %e,
                        "backend reconnect failed"
                    );
                }
            }
        }
    }

    async fn write(&self, payload: &str) -> RtdResult<()> {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink.send_text(payload).await,
            None => Err(RtdError::ConnectionClosed),
        }
    }

    /// Mark the connection of `generation` closed; later generations are untouched.
    async fn mark_closed(&self, generation: u64) {
        let mut sink = self.sink.lock().await;
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        sink.take();
        self.state.send_if_modified(|state| {
            if *state == TunnelState::Open {
                *state = TunnelState::Closed;
                true
            } else {
                false
            }
        });
    }

    async fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
        self.shutdown().await;
    }

    /// Close the backend connection and stop its reader.
    pub async fn close(&self) {
        self.abandoned.store(true, Ordering::Release);
        self.shutdown().await;
        debug!(path = %self.path, "tunnel closed");
    }

    async fn shutdown(&self) {
        let sink = {
            let mut slot = self.sink.lock().await;
            if let Ok(mut reader) = self.reader.lock() {
                if let Some(handle) = reader.take() {
                    handle.abort();
                }
            }
            slot.take()
        };
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close("tunnel closed").await {
                debug!(path = %self.path, error = %e, "backend close failed");
            }
        }
        self.state.send_replace(TunnelState::Closed);
    }

    fn spawn_reader(self: &Arc<Self>, source: Box<dyn FrameSource>, generation: u64) {
        let tunnel = Arc::clone(self);
        let handle = tokio::spawn(async move { tunnel.pump(source, generation).await });
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(previous) = reader.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Backend → browser.
    async fn pump(self: Arc<Self>, source: Box<dyn FrameSource>, generation: u64) {
        let mut reader = FrameReader::new(source, self.settings.limits);
        loop {
            match reader.next_message().await {
                Ok(Some(Frame::Text(text))) => {
                    let outbound = self.reply_payload(text);
                    if let Err(e) = self.browser.send(&outbound).await {
                        debug!(
                            path = %self.path,
                            error = %e,
                            "browser gone, stopping backend reader"
                        );
                        break;
                    }
                }
                Ok(Some(Frame::Binary(data))) => {
                    debug!(path = %self.path, len = data.len(), "binary backend frame ignored");
                }
                Ok(None) => {
                    info!(path = %self.path, "backend closed tunnel");
                    self.mark_closed(generation).await;
                    self.notify_browser_closed().await;
                    break;
                }
                Err(e) => {
                    warn!(path = %self.path, error = %e, "backend read failed");
                    self.mark_closed(generation).await;
                    break;
                }
            }
        }
    }

    fn reply_payload(&self, text: String) -> String {
        match self.mode {
            ReplyMode::Raw => text,
            ReplyMode::Envelope => self
                .envelope(MessageType::ProxyContent, Some(text.clone()))
                .unwrap_or(text),
        }
    }

    async fn notify_browser_closed(&self) {
        let result = match self.mode {
            ReplyMode::Raw => self.browser.close("backend closed").await,
            ReplyMode::Envelope => match self.envelope(MessageType::ProxyClose, None) {
                Some(message) => self.browser.send(&message).await,
                None => Ok(()),
            },
        };
        if let Err(e) = result {
            debug!(path = %self.path, error = %e, "close not propagated to browser");
        }
    }

    fn envelope(&self, msg_type: MessageType, content: Option<String>) -> Option<String> {
        let request = HttpProxyRequest {
            url: self.path.clone(),
            content,
            headers: Vec::new(),
        };
        let content = serde_json::to_value(request).ok()?;
        RtdMessage::new(msg_type, content).encode().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_connection, FakeConnector, SinkProbe, SourceEvent};
    use serde_json::json;
    use tokio::sync::Notify;

    /// Parks every connect until released.
    #[derive(Default)]
    struct GatedConnector {
        inner: FakeConnector,
        entered: Notify,
        release: Notify,
    }

    impl BackendConnector for GatedConnector {
        fn connect<'a>(
            &'a self,
            request: BackendRequest,
        ) -> Pin<Box<dyn Future<Output = RtdResult<BackendStream>> + Send + 'a>> {
            Box::pin(async move {
                self.entered.notify_one();
                self.release.notified().await;
                self.inner.connect(request).await
            })
        }
    }

    fn fast_settings() -> TunnelSettings {
        TunnelSettings {
            retry_backoff: Duration::from_millis(1),
            connect_timeout: Duration::from_secs(2),
            public_host: "hub.example.com".into(),
            ..TunnelSettings::default()
        }
    }

    fn tunnel(connector: &FakeConnector, mode: ReplyMode) -> (Arc<ProxyTunnel>, SinkProbe) {
        let (browser, probe) = test_connection("browser");
        let t = ProxyTunnel::new(
            "/lab/w1/api",
            "ws://localhost:8888",
            vec![("Origin".into(), "https://hub.example.com".into())],
            mode,
            browser,
            Arc::new(connector.clone()),
            fast_settings(),
        );
        (t, probe)
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

    #[tokio::test]
    async fn open_connects_once_with_rewritten_request() {
        let connector = FakeConnector::default();
        let (t, _) = tunnel(&connector, ReplyMode::Raw);

        assert_eq!(t.state(), TunnelState::Unconnected);
        assert_eq!(t.ensure_open().await, TunnelState::Open);
        assert_eq!(t.ensure_open().await, TunnelState::Open);

        assert_eq!(connector.connects(), 1);
        let request = &connector.requests()[0];
        assert_eq!(request.url, "ws://localhost:8888/lab/w1/api");
        assert_eq!(
            request.headers,
            vec![("Origin".to_string(), "http://localhost:8888".to_string())]
        );
    }

    #[tokio::test]
    async fn send_writes_to_open_backend() {
        let connector = FakeConnector::default();
        let (t, _) = tunnel(&connector, ReplyMode::Raw);
        t.ensure_open().await;

        assert!(t.send("one").await);
        assert!(t.send("two").await);
        assert_eq!(connector.backend(0).sent(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn unreachable_backend_bounds_retries() {
        let connector = FakeConnector::failing();
        let (t, _) = tunnel(&connector, ReplyMode::Raw);

        assert!(!t.send("lost").await);

        assert_eq!(connector.connects(), 10);
        assert!(t.is_abandoned());
        assert_eq!(t.state(), TunnelState::Closed);

        assert!(!t.send("also lost").await);
        assert_eq!(connector.connects(), 10);
    }

    #[tokio::test]
    async fn reconnect_after_backend_drop() {
        let connector = FakeConnector::default();
        let (t, _) = tunnel(&connector, ReplyMode::Raw);
        t.ensure_open().await;

        connector.close_backend(0);
        eventually(|| t.state() == TunnelState::Closed).await;

        assert!(t.send("again").await);
        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.backend(1).sent(), vec!["again"]);
    }

    #[tokio::test]
    async fn successful_connect_resets_budget() {
        let connector = FakeConnector::failing();
        let (t, _) = tunnel(&connector, ReplyMode::Raw);
        t.ensure_open().await;
        assert_eq!(t.state(), TunnelState::Closed);

        connector.set_failing(false);
        assert!(t.send("x").await);
        assert_eq!(t.retries.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn raw_replies_forwarded_verbatim() {
        let connector = FakeConnector::default();
        let (t, browser) = tunnel(&connector, ReplyMode::Raw);
        t.ensure_open().await;

        connector.backend_says(0, SourceEvent::Text("{\"msg\":1}".into()));
        eventually(|| browser.sent().len() == 1).await;
        assert_eq!(browser.sent(), vec!["{\"msg\":1}"]);
    }

    #[tokio::test]
    async fn envelope_replies_wrapped() {
        let connector = FakeConnector::default();
        let (t, browser) = tunnel(&connector, ReplyMode::Envelope);
        t.ensure_open().await;

        connector.backend_says(0, SourceEvent::Text("hello".into()));
        eventually(|| browser.sent().len() == 1).await;
        assert_eq!(
            browser.sent_json()[0],
            json!({
                "Type": 21,
                "Content": {"Url": "/lab/w1/api", "Content": "hello", "Headers": []}
            })
        );
    }

    #[tokio::test]
    async fn backend_close_propagates_to_browser() {
        let connector = FakeConnector::default();
        let (t, browser) = tunnel(&connector, ReplyMode::Raw);
        t.ensure_open().await;

        connector.close_backend(0);
        eventually(|| browser.close_count() == 1).await;
        assert_eq!(t.state(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn envelope_backend_close_sends_proxy_close() {
        let connector = FakeConnector::default();
        let (t, browser) = tunnel(&connector, ReplyMode::Envelope);
        t.ensure_open().await;

        connector.close_backend(0);
        eventually(|| browser.sent().len() == 1).await;
        assert_eq!(browser.sent_json()[0]["Type"], json!(22));
        assert_eq!(browser.close_count(), 0);
    }

    #[tokio::test]
    async fn close_abandons_and_closes_backend() {
        let connector = FakeConnector::default();
        let (t, _) = tunnel(&connector, ReplyMode::Raw);
        t.ensure_open().await;

        t.close().await;
        assert!(t.is_abandoned());
        assert_eq!(connector.backend(0).close_count(), 1);
        assert!(!t.send("late").await);
    }

    #[tokio::test]
    async fn close_during_connect_closes_late_backend() {
        let gate = Arc::new(GatedConnector::default());
        let (browser, _) = test_connection("browser");
        let t = ProxyTunnel::new(
            "/lab/w1/api",
            "ws://localhost:8888",
            Vec::new(),
            ReplyMode::Raw,
            browser,
            gate.clone(),
            fast_settings(),
        );

        let opening = {
            let t = t.clone();
            tokio::spawn(async move { t.ensure_open().await })
        };
        gate.entered.notified().await;
        t.close().await;
        gate.release.notify_one();

        assert_eq!(opening.await.unwrap(), TunnelState::Closed);
        assert_eq!(gate.inner.backend(0).close_count(), 1);
        assert!(t.reader.lock().unwrap().is_none());
        assert!(!t.send("late").await);
    }
}
