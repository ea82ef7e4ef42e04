pub mod websocket;

pub use websocket::{split_stream, ws_config, WsConnector, WsFrameSink, WsFrameSource};
