//! HTTP client for the external streaming engine
//!
//! Wraps the engine's JSON session API:
//! - `GET /ace/getstream?id=<key>&format=json&pid=<uuid>` negotiates a session
//! - `GET <playback_url>` streams the media bytes
//! - `GET <command_url>?method=stop` tears the session down
//! - `GET <stat_url>` reports engine-side statistics

use std::time::Duration;

use async_trait::async_trait;
use aceproxy_core::config::EngineConfig;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ChunkStream, EngineApi, UpstreamSession};
use crate::error::{StreamError, StreamResult};

/// Session negotiation endpoint on the engine
pub const GETSTREAM_PATH: &str = "/ace/getstream";

/// Query keys the proxy sets itself; callers may not override them
const RESERVED_PARAMS: [&str; 4] = ["id", "format", "pid", "infohash"];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// `{"response": ..., "error": ...}` wrapper used by every engine call
#[derive(Debug, Deserialize)]
struct EngineEnvelope<T> {
    response: Option<T>,
    error: Option<serde_json::Value>,
}

impl<T> EngineEnvelope<T> {
    /// Engine error message, if the envelope carries a non-null one
    fn error_message(&self) -> Option<String> {
        match &self.error {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) if s.is_empty() => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    playback_url: String,
    command_url: String,
    #[serde(default)]
    stat_url: Option<String>,
}

/// Engine client over HTTP (reqwest)
pub struct HttpEngineClient {
    http: reqwest::Client,
    base_url: String,
    no_response_timeout: Duration,
    chunk_size: usize,
}

impl HttpEngineClient {
    /// Build a client for the engine described by `config`.
    pub fn new(config: &EngineConfig, chunk_size: usize) -> StreamResult<Self> {
        Self::with_base_url(config.base_url(), config.no_response_timeout(), chunk_size)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        no_response_timeout: Duration,
        chunk_size: usize,
    ) -> StreamResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StreamError::EngineUnreachable(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            no_response_timeout,
            chunk_size: chunk_size.max(1),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl EngineApi for HttpEngineClient {
    async fn fetch_session_info(
        &self,
        key: &str,
        extra_params: &[(String, String)],
    ) -> StreamResult<UpstreamSession> {
        // Fresh correlation id per call so the engine never merges two negotiations
        let pid = Uuid::new_v4().to_string();
        let url = format!("{}{GETSTREAM_PATH}", self.base_url);

        let mut query: Vec<(&str, &str)> = extra_params
            .iter()
            .filter(|(k, _)| !RESERVED_PARAMS.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        query.push(("format", "json"));
        query.push(("pid", &pid));
        query.push(("id", key));

        debug!(stream_key = %key, pid = %pid, "Requesting engine session");

        let response = self
            .http
            .get(&url)
            .query(&query)
            .timeout(self.no_response_timeout)
            .send()
            .await
            .map_err(|e| StreamError::from_engine_request(&e, "getstream"))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StreamError::from_engine_request(&e, "getstream body"))?;

        let envelope: EngineEnvelope<SessionPayload> = serde_json::from_str(&body).map_err(|e| {
            if status.is_success() {
                StreamError::EngineProtocolError(format!("malformed getstream response: {e}"))
            } else {
                StreamError::EngineProtocolError(format!("engine returned HTTP {status}: {body}"))
            }
        })?;

        if let Some(message) = envelope.error_message() {
            return Err(StreamError::EngineRejected(message));
        }
        if !status.is_success() {
            return Err(StreamError::EngineProtocolError(format!(
                "engine returned HTTP {status}"
            )));
        }

        let payload = envelope.response.ok_or_else(|| {
            StreamError::EngineProtocolError("getstream response has no response object".to_string())
        })?;

        Ok(UpstreamSession {
            key: key.to_string(),
            playback_url: payload.playback_url,
            stat_url: payload.stat_url.filter(|s| !s.is_empty()),
            command_url: payload.command_url,
        })
    }

    async fn open_playback(&self, session: &UpstreamSession) -> StreamResult<ChunkStream> {
        debug!(stream_key = %session.key, url = %session.playback_url, "Opening playback");

        let response = self
            .http
            .get(&session.playback_url)
            .send()
            .await
            .map_err(|e| StreamError::UpstreamDisconnected(format!("playback request failed: {e}")))?;

        if response.status() != StatusCode::OK {
            return Err(StreamError::UpstreamDisconnected(format!(
                "playback returned HTTP {}",
                response.status()
            )));
        }

        let chunk_size = self.chunk_size;
        let chunks = response
            .bytes_stream()
            .map_err(|e| StreamError::UpstreamDisconnected(format!("playback read failed: {e}")))
            .map_ok(move |bytes| stream::iter(split_chunks(bytes, chunk_size).into_iter().map(Ok::<Bytes, StreamError>)))
            .try_flatten()
            .boxed();

        Ok(chunks)
    }

    async fn stop_session(&self, session: &UpstreamSession) {
        debug!(stream_key = %session.key, "Stopping engine session");

        let response = match self
            .http
            .get(&session.command_url)
            .query(&[("method", "stop")])
            .timeout(self.no_response_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(stream_key = %session.key, "Failed to stop engine session: {e}");
                return;
            }
        };

        if response.status() != StatusCode::OK {
            warn!(
                stream_key = %session.key,
                status = %response.status(),
                "Engine refused stop command"
            );
            return;
        }

        match response.json::<EngineEnvelope<serde_json::Value>>().await {
            Ok(envelope) => {
                if let Some(message) = envelope.error_message() {
                    warn!(stream_key = %session.key, "Engine error while stopping session: {message}");
                }
            }
            Err(e) => {
                warn!(stream_key = %session.key, "Unreadable stop response: {e}");
            }
        }
    }

    async fn session_stats(&self, session: &UpstreamSession) -> Option<serde_json::Value> {
        let stat_url = session.stat_url.as_deref()?;

        let response = self
            .http
            .get(stat_url)
            .timeout(self.no_response_timeout)
            .send()
            .await
            .map_err(|e| warn!(stream_key = %session.key, "Failed to fetch engine stats: {e}"))
            .ok()?;

        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }
}

/// Split an upstream read into pieces of at most `max` bytes (zero-copy).
fn split_chunks(mut bytes: Bytes, max: usize) -> Vec<Bytes> {
    let mut out = Vec::with_capacity(bytes.len().div_ceil(max));
    while bytes.len() > max {
        out.push(bytes.split_to(max));
    }
    if !bytes.is_empty() {
        out.push(bytes);
    }
    out
}
