//! rtd-server: real-time messaging hub.
//!
//! Accepts WebSocket connections behind a session-cookie gate, fans topic
//! updates out to authorized subscribers, and tunnels browser traffic to
//! backend WebSocket services.

pub mod auth;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod hooks;
pub mod hub;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod subscriptions;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{CliOverrides, ServerConfig};
pub use connection::{Connection, ConnectionId};
pub use hooks::Collaborators;
pub use hub::{ConnectionContext, Hub, HubSettings};
pub use server::RtdServer;
