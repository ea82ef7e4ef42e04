//! tokio-tungstenite adapters for the frame traits, plus the backend
//! connector used by proxy tunnels.

use crate::proxy::{BackendConnector, BackendRequest, BackendStream};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rtd_core::transport::{drain_pending, Chunk, ChunkKind, FrameSink, FrameSource};
use rtd_core::{FrameLimits, RtdError, RtdResult};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError};
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// WebSocket settings matching the hub's frame limits.
///
/// tungstenite enforces the cap before buffering; `WsFrameSource` reports its
/// refusal as `FrameTooLarge`.
pub fn ws_config(limits: &FrameLimits) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(limits.max_message_size);
    config.max_frame_size = Some(limits.max_message_size);
    config
}

/// Inbound half of a WebSocket, handing messages out in buffer-sized pieces.
pub struct WsFrameSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
    pending: Option<(Vec<u8>, usize, ChunkKind)>,
}

/// Outbound half of a WebSocket.
pub struct WsFrameSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

pub fn split_stream<S>(ws: WebSocketStream<S>) -> (WsFrameSink<S>, WsFrameSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (
        WsFrameSink { sink },
        WsFrameSource {
            stream,
            pending: None,
        },
    )
}

impl<S> FrameSource for WsFrameSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn receive<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = RtdResult<Chunk>> + Send + 'a>> {
        Box::pin(async move {
            while self.pending.is_none() {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        self.pending = Some((text.into_bytes(), 0, ChunkKind::Text));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.pending = Some((data, 0, ChunkKind::Binary));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(frame = ?frame, "close frame received");
                        return Ok(Chunk::close());
                    }
                    // Pings are answered by tungstenite itself.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(recv_error(e)),
                    None => return Ok(Chunk::close()),
                }
            }
            Ok(drain_pending(&mut self.pending, buf).unwrap_or_else(Chunk::close))
        })
    }
}

impl<S> FrameSink for WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn send_text<'a>(
        &'a mut self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = RtdResult<()>> + Send + 'a>> {
        Box::pin(async move {
            self.sink
                .send(Message::Text(text.to_string()))
                .await
                .map_err(|e| RtdError::Transport(format!("WS send failed: {e}")))
        })
    }

    fn close<'a>(
        &'a mut self,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = RtdResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: reason.to_string().into(),
            };
            self.sink
                .send(Message::Close(Some(frame)))
                .await
                .map_err(|e| RtdError::Transport(format!("WS close failed: {e}")))
        })
    }
}

fn recv_error(e: WsError) -> RtdError {
    match e {
        WsError::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
            RtdError::FrameTooLarge {
                size,
                max: max_size,
            }
        }
        other => RtdError::Transport(format!("WS recv failed: {other}")),
    }
}

/// Opens backend tunnels with `connect_async`.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    limits: FrameLimits,
}

impl WsConnector {
    pub fn new(limits: FrameLimits) -> Self {
        Self { limits }
    }
}

impl BackendConnector for WsConnector {
    fn connect<'a>(
        &'a self,
        request: BackendRequest,
    ) -> Pin<Box<dyn Future<Output = RtdResult<BackendStream>> + Send + 'a>> {
        Box::pin(async move {
            let mut upgrade = request
                .url
                .as_str()
                .into_client_request()
                .map_err(|e| RtdError::ProxyConnectFailure(format!("{}: {e}", request.url)))?;
            for (name, value) in &request.headers {
                match (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    (Ok(name), Ok(value)) => {
                        upgrade.headers_mut().append(name, value);
                    }
                    _ => debug!(header = %name, "unrepresentable header skipped"),
                }
            }

            let (ws, response) = tokio_tungstenite::connect_async_with_config(
                upgrade,
                Some(ws_config(&self.limits)),
                true,
            )
            .await
            .map_err(|e| RtdError::ProxyConnectFailure(format!("{}: {e}", request.url)))?;
            debug!(url = %request.url, status = %response.status(), "backend handshake complete");

            let (sink, source) = split_stream(ws);
            Ok(BackendStream {
                sink: Box::new(sink),
                source: Box::new(source),
            })
        })
    }
}
