use thiserror::Error;

/// Failures surfaced by the multiplexing proxy.
///
/// `Clone` so a single creation failure can be handed to every subscriber
/// that was waiting on the same stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Engine rejected request: {0}")]
    EngineRejected(String),

    #[error("Engine timeout: {0}")]
    EngineTimeout(String),

    #[error("Engine protocol error: {0}")]
    EngineProtocolError(String),

    #[error("Engine unreachable: {0}")]
    EngineUnreachable(String),

    #[error("Upstream disconnected: {0}")]
    UpstreamDisconnected(String),

    /// Internal only: turned into an eviction, never returned to a caller
    #[error("Client unresponsive: {0}")]
    ClientUnresponsive(String),

    #[error("Stream closed: {0}")]
    StreamClosed(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// No new streams are admitted once shutdown has begun
    #[error("Proxy is shutting down")]
    ShuttingDown,
}

pub type StreamResult<T> = Result<T, StreamError>;

impl StreamError {
    /// Classify a transport error from a call to the engine's session API.
    pub(crate) fn from_engine_request(err: &reqwest::Error, what: &str) -> Self {
        if err.is_timeout() {
            Self::EngineTimeout(format!("{what}: no response from engine"))
        } else if err.is_decode() || err.is_body() {
            Self::EngineProtocolError(format!("{what}: {err}"))
        } else {
            Self::EngineUnreachable(format!("{what}: {err}"))
        }
    }
}
