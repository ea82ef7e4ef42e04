use thiserror::Error;

/// Errors produced by the rtd hub and its wire protocol.
#[derive(Debug, Error)]
pub enum RtdError {
    #[error("authentication missing: {0}")]
    AuthenticationMissing(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("envelope undecodable: {0}")]
    EnvelopeUndecodable(String),

    #[error("handler fault: {0}")]
    HandlerFault(String),

    #[error("send failed: {0}")]
    SendFailure(String),

    #[error("proxy connect failed: {0}")]
    ProxyConnectFailure(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for RtdError {
    fn from(e: serde_json::Error) -> Self {
        RtdError::Codec(e.to_string())
    }
}

impl RtdError {
    /// Whether this error must terminate the connection it occurred on.
    ///
    /// Everything else is isolated to a single message or peer.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RtdError::FrameTooLarge { .. }
                | RtdError::Transport(_)
                | RtdError::ConnectionClosed
                | RtdError::Io(_)
        )
    }
}

pub type RtdResult<T> = Result<T, RtdError>;
