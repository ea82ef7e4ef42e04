//! rtd-core: Shared protocol library for the rtd real-time hub.
//!
//! Provides the JSON message envelope and payload types, identity and access
//! levels, the CRUD value codec registry, abstract transport traits, and the
//! growing-buffer frame reader that assembles logical messages.

pub mod codec;
pub mod error;
pub mod framing;
pub mod identity;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{CodecRegistry, CrudValue, ValueCodec};
pub use error::{RtdError, RtdResult};
pub use framing::{Frame, FrameLimits, FrameReader};
pub use identity::{AccessType, Identity};
pub use messages::{CrudMessage, CrudType, HttpProxyRequest, MessageType, QueueMessage, RtdMessage};
