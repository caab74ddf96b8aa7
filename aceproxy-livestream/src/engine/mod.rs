// Streaming engine abstraction
//
// The proxy only talks to the engine through `EngineApi`, so the stream
// lifecycle can be driven by `MockEngine` in tests without a live engine.

pub mod client;
#[cfg(test)]
pub mod mock_engine;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::error::StreamResult;

pub use client::HttpEngineClient;
#[cfg(test)]
pub use mock_engine::MockEngine;

/// Upstream byte chunks, in the order the engine produced them
pub type ChunkStream = BoxStream<'static, StreamResult<Bytes>>;

/// Query parameters forwarded verbatim to the engine's session call
pub type ExtraParams = Vec<(String, String)>;

/// One negotiated engine session. Immutable for the life of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamSession {
    pub key: String,
    pub playback_url: String,
    pub stat_url: Option<String>,
    pub command_url: String,
}

/// Session negotiation and termination against the external engine
#[async_trait]
pub trait EngineApi: Send + Sync {
    /// Negotiate a new playback session for `key`
    async fn fetch_session_info(
        &self,
        key: &str,
        extra_params: &[(String, String)],
    ) -> StreamResult<UpstreamSession>;

    /// Open the session's playback URL as a chunk stream.
    ///
    /// Read timeouts are the caller's concern; this only bounds connecting.
    async fn open_playback(&self, session: &UpstreamSession) -> StreamResult<ChunkStream>;

    /// Best-effort stop. Failures are logged, never returned.
    async fn stop_session(&self, session: &UpstreamSession);

    /// Poll the session's stat URL, if it has one
    async fn session_stats(&self, session: &UpstreamSession) -> Option<serde_json::Value>;
}
