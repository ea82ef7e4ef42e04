//! A live inbound connection and its send serializer.
//!
//! Every outbound write goes through the connection's async mutex, so frames
//! from concurrent fan-outs never interleave on one socket. Lock wait plus
//! write is bounded by the send timeout; a peer that stops reading is marked
//! closed instead of stalling whoever is sending to it.

use rand::Rng;
use rtd_core::transport::FrameSink;
use rtd_core::{RtdError, RtdResult};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Default bound on one outbound write, lock wait included.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque per-socket identifier (32 hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Fresh random id.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One admitted browser socket: its outbound half and open flag.
pub struct Connection {
    id: ConnectionId,
    remote_addr: Option<IpAddr>,
    sink: Mutex<Box<dyn FrameSink>>,
    open: AtomicBool,
    send_timeout: Duration,
}

impl Connection {
    pub fn new(id: ConnectionId, sink: Box<dyn FrameSink>, remote_addr: Option<IpAddr>) -> Self {
        Self {
            id,
            remote_addr,
            sink: Mutex::new(sink),
            open: AtomicBool::new(true),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Write one text frame under the connection's send lock.
    ///
    /// A failed or timed-out write marks the connection closed; later sends
    /// fail without touching the socket.
    pub async fn send(&self, payload: &str) -> RtdResult<()> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        let write = async {
            let mut sink = self.sink.lock().await;
            // Closed while this send waited for the lock.
            if !self.is_open() {
                return Err(self.closed_error());
            }
            sink.send_text(payload)
                .await
                .map_err(|e| RtdError::SendFailure(e.to_string()))
        };
        let result = match tokio::time::timeout(self.send_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(RtdError::SendFailure(format!(
                "send to {} timed out after {:?}",
                self.id, self.send_timeout
            ))),
        };
        if result.is_err() {
            self.open.store(false, Ordering::Release);
        }
        result
    }

    /// Close with a normal-closure frame. Closing twice is a no-op.
    pub async fn close(&self, reason: &str) -> RtdResult<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let close = async {
            let mut sink = self.sink.lock().await;
            sink.close(reason).await
        };
        tokio::time::timeout(self.send_timeout, close)
            .await
            .map_err(|_| RtdError::Timeout)?
    }

    fn closed_error(&self) -> RtdError {
        RtdError::SendFailure(format!("connection {} closed", self.id))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("open", &self.is_open())
            .finish()
    }
}
