//! Backend tunnels: browser messages forwarded to backend WebSocket servers.

pub mod headers;
pub mod manager;
pub mod tunnel;

pub use headers::{backend_authority, rewrite_headers};
pub use manager::{TunnelKey, TunnelManager};
pub use tunnel::{
    BackendConnector, BackendRequest, BackendStream, ProxyTunnel, ReplyMode, TunnelSettings,
    TunnelState,
};
