//! In-process fakes for sinks, sources, backends and authorization.

use crate::auth::Authorizer;
use crate::connection::Connection;
use crate::proxy::{BackendConnector, BackendRequest, BackendStream};
use rtd_core::transport::{drain_pending, Chunk, ChunkKind, FrameSink, FrameSource};
use rtd_core::{AccessType, Identity, RtdError, RtdResult};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct SinkState {
    sent: Mutex<Vec<String>>,
    attempts: AtomicUsize,
    closes: AtomicUsize,
    fail: AtomicBool,
    in_flight: AtomicUsize,
    overlaps: AtomicUsize,
}

/// Observes what a `RecordingSink` was asked to do.
#[derive(Clone, Default)]
pub struct SinkProbe {
    state: Arc<SinkState>,
}

impl SinkProbe {
    /// Text frames written so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.state.sent.lock().unwrap().clone()
    }

    /// `sent`, parsed as JSON.
    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    /// Write attempts, failed ones included.
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Close frames requested.
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Writes that started while another was still in flight.
    pub fn overlaps(&self) -> usize {
        self.state.overlaps.load(Ordering::SeqCst)
    }

    /// Make every later write fail.
    pub fn fail_sends(&self) {
        self.state.fail.store(true, Ordering::SeqCst);
    }
}

pub struct RecordingSink {
    probe: SinkProbe,
    yield_mid_write: bool,
}

impl RecordingSink {
    pub fn new() -> (Self, SinkProbe) {
        let probe = SinkProbe::default();
        (
            Self {
                probe: probe.clone(),
                yield_mid_write: false,
            },
            probe,
        )
    }

    /// Yield to the scheduler in the middle of every write.
    pub fn with_split_writes(mut self) -> Self {
        self.yield_mid_write = true;
        self
    }
}

impl FrameSink for RecordingSink {
    fn send_text<'a>(
        &'a mut self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = RtdResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let state = &self.probe.state;
            state.attempts.fetch_add(1, Ordering::SeqCst);
            if state.fail.load(Ordering::SeqCst) {
                return Err(RtdError::Transport("broken pipe".into()));
            }
            if state.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                state.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            if self.yield_mid_write {
                tokio::task::yield_now().await;
            }
            state.sent.lock().unwrap().push(text.to_string());
            state.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn close<'a>(
        &'a mut self,
        _reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = RtdResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.probe.state.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// A sink whose writes never complete, like a peer that stopped reading.
pub struct StalledSink;

impl FrameSink for StalledSink {
    fn send_text<'a>(
        &'a mut self,
        _text: &'a str,
    ) -> Pin<Box<dyn Future<Output = RtdResult<()>> + Send + 'a>> {
        Box::pin(std::future::pending())
    }

    fn close<'a>(
        &'a mut self,
        _reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = RtdResult<()>> + Send + 'a>> {
        Box::pin(std::future::pending())
    }
}

pub fn test_connection(id: &str) -> (Arc<Connection>, SinkProbe) {
    let (sink, probe) = RecordingSink::new();
    (Arc::new(Connection::new(id.into(), Box::new(sink), None)), probe)
}

/// What a `ChannelSource` delivers next.
pub enum SourceEvent {
    Text(String),
    Fail,
}

/// A frame source fed from a channel; closes when every sender is dropped.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<SourceEvent>,
    pending: Option<(Vec<u8>, usize, ChunkKind)>,
}

pub fn channel_source() -> (mpsc::UnboundedSender<SourceEvent>, ChannelSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelSource { rx, pending: None })
}

impl FrameSource for ChannelSource {
    fn receive<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = RtdResult<Chunk>> + Send + 'a>> {
        Box::pin(async move {
            if self.pending.is_none() {
                match self.rx.recv().await {
                    Some(SourceEvent::Text(t)) => {
                        self.pending = Some((t.into_bytes(), 0, ChunkKind::Text))
                    }
                    Some(SourceEvent::Fail) => {
                        return Err(RtdError::Transport("connection reset".into()))
                    }
                    None => return Ok(Chunk::close()),
                }
            }
            Ok(drain_pending(&mut self.pending, buf).unwrap_or_else(Chunk::close))
        })
    }
}

#[derive(Default)]
struct ConnectorState {
    connects: AtomicUsize,
    fail: AtomicBool,
    requests: Mutex<Vec<BackendRequest>>,
    backends: Mutex<Vec<(SinkProbe, mpsc::UnboundedSender<SourceEvent>)>>,
}

/// Backend connector that hands out in-memory streams.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<ConnectorState>,
}

impl FakeConnector {
    pub fn failing() -> Self {
        let c = Self::default();
        c.state.fail.store(true, Ordering::SeqCst);
        c
    }

    pub fn set_failing(&self, fail: bool) {
        self.state.fail.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<BackendRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Writes received by the `i`-th backend connection.
    pub fn backend(&self, i: usize) -> SinkProbe {
        self.state.backends.lock().unwrap()[i].0.clone()
    }

    /// Push a message from the `i`-th backend towards the hub.
    pub fn backend_says(&self, i: usize, event: SourceEvent) {
        let _ = self.state.backends.lock().unwrap()[i].1.send(event);
    }

    /// Drop the `i`-th backend's sender, which closes its stream.
    pub fn close_backend(&self, i: usize) {
        let (tx, _) = channel_source();
        self.state.backends.lock().unwrap()[i].1 = tx;
    }
}

impl BackendConnector for FakeConnector {
    fn connect<'a>(
        &'a self,
        request: BackendRequest,
    ) -> Pin<Box<dyn Future<Output = RtdResult<BackendStream>> + Send + 'a>> {
        Box::pin(async move {
            self.state.connects.fetch_add(1, Ordering::SeqCst);
            self.state.requests.lock().unwrap().push(request);
            if self.state.fail.load(Ordering::SeqCst) {
                return Err(RtdError::ProxyConnectFailure("connection refused".into()));
            }
            let (sink, probe) = RecordingSink::new();
            let (tx, source) = channel_source();
            self.state.backends.lock().unwrap().push((probe, tx));
            Ok(BackendStream {
                sink: Box::new(sink),
                source: Box::new(source),
            })
        })
    }
}

/// Denies the listed user ids on every topic; everyone else may write.
pub struct DenyUsers(pub HashSet<String>);

impl DenyUsers {
    pub fn new(ids: &[&str]) -> Self {
        Self(ids.iter().map(|s| s.to_string()).collect())
    }
}

impl Authorizer for DenyUsers {
    fn authorize(&self, _topic: &str, identity: &Identity) -> AccessType {
        if self.0.contains(&identity.id) {
            AccessType::Denied
        } else {
            AccessType::Write
        }
    }
}

pub fn user(id: &str) -> Identity {
    Identity::new(id, format!("{id}@example.com"))
}
