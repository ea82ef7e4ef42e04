//! Message assembly over a chunked transport.
//!
//! Each logical message is read into a buffer that starts small and grows in
//! tiers as the message keeps arriving, so large payloads amortize
//! reallocation instead of growing by a fixed small step.

use crate::error::{RtdError, RtdResult};
use crate::transport::{ChunkKind, FrameSource};

/// Buffer sizing for a frame reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub initial_buffer_size: usize,
    pub max_message_size: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            initial_buffer_size: 500,
            max_message_size: 1024 * 2_000_000,
        }
    }
}

/// A complete message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Bytes to add after `stalls` previous growths of the same message.
pub fn growth_increment(stalls: u32) -> usize {
    match stalls {
        0..=5 => 1024 * 10,
        6..=10 => 1024 * 100,
        11..=20 => 1024 * 1_000,
        21..=30 => 1024 * 10_000,
        31..=40 => 1024 * 100_000,
        _ => 1024 * 1_000_000,
    }
}

/// Assembles complete messages from a `FrameSource`.
pub struct FrameReader<S> {
    source: S,
    limits: FrameLimits,
    last_capacity: usize,
}

impl<S: FrameSource> FrameReader<S> {
    pub fn new(source: S, limits: FrameLimits) -> Self {
        Self {
            source,
            limits,
            last_capacity: 0,
        }
    }

    /// Buffer size reached by the most recent message.
    pub fn last_capacity(&self) -> usize {
        self.last_capacity
    }

    /// Read the next complete message. `None` once the peer closes.
    ///
    /// Fails with `FrameTooLarge` when the message cannot fit within
    /// `max_message_size`; transport failures pass through.
    pub async fn next_message(&mut self) -> RtdResult<Option<Frame>> {
        let mut buffer = vec![0u8; self.limits.initial_buffer_size.max(1)];
        let mut offset = 0;
        let mut stalls = 0u32;

        loop {
            if offset == buffer.len() {
                let grown = buffer
                    .len()
                    .saturating_add(growth_increment(stalls))
                    .min(self.limits.max_message_size);
                if grown <= buffer.len() {
                    return Err(RtdError::FrameTooLarge {
                        size: offset,
                        max: self.limits.max_message_size,
                    });
                }
                buffer.resize(grown, 0);
                stalls += 1;
            }
            self.last_capacity = buffer.len();

            let chunk = self.source.receive(&mut buffer[offset..]).await?;
            match chunk.kind {
                ChunkKind::Close => return Ok(None),
                ChunkKind::Text | ChunkKind::Binary => {}
            }
            offset += chunk.count.min(buffer.len() - offset);

            if chunk.end_of_message {
                buffer.truncate(offset);
                return match chunk.kind {
                    ChunkKind::Text => String::from_utf8(buffer)
                        .map(|s| Some(Frame::Text(s)))
                        .map_err(|e| RtdError::Transport(format!("invalid utf-8 text frame: {e}"))),
                    _ => Ok(Some(Frame::Binary(buffer))),
                };
            }
        }
    }

    pub fn into_inner(self) -> S {
        self.source
    }
}
