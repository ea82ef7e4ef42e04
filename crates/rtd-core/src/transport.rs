//! Abstract transport traits for the hub.
//!
//! The WebSocket listener and the backend proxy client both adapt their
//! streams to these traits so the frame reader, connection registry and
//! tunnel manager stay independent of the concrete socket type.

use crate::error::RtdResult;
use std::future::Future;
use std::pin::Pin;

/// Kind of message a received chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Text,
    Binary,
    Close,
}

/// Result of one transport read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Bytes written into the caller's buffer.
    pub count: usize,
    /// Whether this chunk completes the current message.
    pub end_of_message: bool,
    pub kind: ChunkKind,
}

impl Chunk {
    pub fn close() -> Self {
        Self {
            count: 0,
            end_of_message: true,
            kind: ChunkKind::Close,
        }
    }
}

/// Inbound half of a message transport.
pub trait FrameSource: Send {
    /// Read the next piece of the current message into `buf`.
    ///
    /// Implementations never write more than `buf.len()` bytes; a message
    /// that does not fit is continued on the next call.
    fn receive<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = RtdResult<Chunk>> + Send + 'a>>;
}

/// Outbound half of a message transport.
pub trait FrameSink: Send {
    /// Write one complete text message.
    fn send_text<'a>(
        &'a mut self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = RtdResult<()>> + Send + 'a>>;

    /// Send a normal-closure close frame.
    fn close<'a>(
        &'a mut self,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = RtdResult<()>> + Send + 'a>>;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn receive<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = RtdResult<Chunk>> + Send + 'a>> {
        (**self).receive(buf)
    }
}

impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    fn send_text<'a>(
        &'a mut self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = RtdResult<()>> + Send + 'a>> {
        (**self).send_text(text)
    }

    fn close<'a>(
        &'a mut self,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = RtdResult<()>> + Send + 'a>> {
        (**self).close(reason)
    }
}

/// Copy the unread part of `pending` into `buf`, producing the matching chunk.
///
/// `pending` holds a whole message and the read position within it; it is
/// cleared once the message has been handed out completely.
pub fn drain_pending(
    pending: &mut Option<(Vec<u8>, usize, ChunkKind)>,
    buf: &mut [u8],
) -> Option<Chunk> {
    let (data, pos, kind) = pending.as_mut()?;
    let n = (data.len() - *pos).min(buf.len());
    buf[..n].copy_from_slice(&data[*pos..*pos + n]);
    *pos += n;
    let chunk = Chunk {
        count: n,
        end_of_message: *pos == data.len(),
        kind: *kind,
    };
    if chunk.end_of_message {
        *pending = None;
    }
    Some(chunk)
}
