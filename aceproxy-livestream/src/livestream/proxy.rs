// Proxy service: the surface the front door and management callers use

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing as log;

use aceproxy_core::Config;

use super::client::{group_viewers, ClientId, ClientInfo, ClientMeta, ViewerInfo};
use super::registry::StreamRegistry;
use super::stream::{Stream, StreamSettings, StreamState};
use crate::engine::{EngineApi, ExtraParams, HttpEngineClient};
use crate::error::{StreamError, StreamResult};

/// Attach retries when the acquired stream closes under us
const ATTACH_ATTEMPTS: usize = 3;

/// Connections from one viewer opened this close together count as one
const VIEWER_MERGE_WINDOW_SECS: i64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub key: String,
    pub client_count: usize,
    pub created_at: DateTime<Utc>,
    pub state: StreamState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub key: String,
    pub client_count: usize,
    pub clients: Vec<ClientInfo>,
    pub created_at: DateTime<Utc>,
    pub state: StreamState,
    pub chunks_relayed: u64,
    /// Chunks waiting in client queues, summed over every client
    pub total_queued: usize,
    pub stat_url: Option<String>,
    pub upstream_stats: Option<serde_json::Value>,
}

/// A viewer's attachment to a stream.
///
/// Yields chunks in upstream order and ends when the stream closes.
/// Dropping it detaches the client.
#[derive(Debug)]
pub struct Subscription {
    stream: Arc<Stream>,
    client_id: ClientId,
    receiver: mpsc::Receiver<Bytes>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub const fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn key(&self) -> &str {
        self.stream.key()
    }

    pub const fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }
}

impl futures::Stream for Subscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stream.detach(self.client_id);
    }
}

/// Multiplexes any number of viewers per key onto one engine session
pub struct ProxyService {
    registry: StreamRegistry,
}

impl ProxyService {
    pub fn new(engine: Arc<dyn EngineApi>, settings: StreamSettings) -> Self {
        Self {
            registry: StreamRegistry::new(engine, settings),
        }
    }

    pub fn from_config(config: &Config) -> StreamResult<Self> {
        let engine = HttpEngineClient::new(&config.engine, config.streaming.chunk_size_bytes)?;
        Ok(Self::new(Arc::new(engine), StreamSettings::from_config(config)))
    }

    pub const fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Attach a viewer to `key`, starting the stream if needed.
    ///
    /// Returns once the first chunk has been relayed, or with the error that
    /// failed the stream's creation. Concurrent callers for the same key
    /// share one engine session.
    pub async fn subscribe(
        &self,
        key: &str,
        extra_params: ExtraParams,
        meta: ClientMeta,
    ) -> StreamResult<Subscription> {
        let (stream, client_id, receiver) = self.attach(key, &extra_params, meta)?;
        let subscription = Subscription {
            stream,
            client_id,
            receiver,
        };

        subscription.stream.ensure_started();
        // On failure the subscription drops and detaches itself
        subscription.stream.wait_ready().await?;
        Ok(subscription)
    }

    fn attach(
        &self,
        key: &str,
        extra_params: &ExtraParams,
        meta: ClientMeta,
    ) -> StreamResult<(Arc<Stream>, ClientId, mpsc::Receiver<Bytes>)> {
        let mut last_err = StreamError::StreamClosed(key.to_string());
        for _ in 0..ATTACH_ATTEMPTS {
            let stream = self.registry.acquire_or_create(key, extra_params)?;
            match stream.attach(meta.clone()) {
                Ok((id, receiver)) => return Ok((stream, id, receiver)),
                Err(err) => {
                    log::debug!(stream_key = %key, error = %err, "Stream closed during attach, retrying");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Detach a viewer. Idempotent, also after the stream closed.
    pub fn unsubscribe(&self, key: &str, client_id: ClientId) -> bool {
        self.registry
            .get(key)
            .is_some_and(|stream| stream.detach(client_id))
    }

    pub fn list_active_streams(&self) -> Vec<StreamSummary> {
        let mut summaries: Vec<StreamSummary> = self
            .registry
            .snapshot()
            .iter()
            .map(|stream| StreamSummary {
                key: stream.key().to_string(),
                client_count: stream.client_count(),
                created_at: stream.created_at(),
                state: stream.state(),
            })
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub fn active_stream_count(&self) -> usize {
        self.registry.len()
    }

    pub fn list_clients(&self, key: &str) -> StreamResult<Vec<ClientInfo>> {
        self.registry
            .get(key)
            .map(|stream| stream.client_snapshot())
            .ok_or_else(|| StreamError::StreamNotFound(key.to_string()))
    }

    /// Attached clients merged per viewer, for management listings
    pub fn list_viewers(&self, key: &str) -> StreamResult<Vec<ViewerInfo>> {
        let clients = self.list_clients(key)?;
        Ok(group_viewers(
            clients,
            chrono::Duration::seconds(VIEWER_MERGE_WINDOW_SECS),
        ))
    }

    /// Stats for one stream. Upstream stats are polled outside any lock and
    /// left empty if the engine does not answer.
    pub async fn stream_stats(&self, key: &str) -> StreamResult<StreamStats> {
        let stream = self
            .registry
            .get(key)
            .ok_or_else(|| StreamError::StreamNotFound(key.to_string()))?;

        let session = stream.session().cloned();
        let upstream_stats = match &session {
            Some(session) => self.registry.engine().session_stats(session).await,
            None => None,
        };
        let clients = stream.client_snapshot();
        let total_queued = clients.iter().map(|c| c.queued_chunks).sum();

        Ok(StreamStats {
            key: stream.key().to_string(),
            client_count: clients.len(),
            clients,
            created_at: stream.created_at(),
            state: stream.state(),
            chunks_relayed: stream.chunks_relayed(),
            total_queued,
            stat_url: session.and_then(|s| s.stat_url),
            upstream_stats,
        })
    }

    pub fn force_close(&self, key: &str) -> StreamResult<()> {
        let stream = self
            .registry
            .get(key)
            .ok_or_else(|| StreamError::StreamNotFound(key.to_string()))?;
        if stream.force_close() {
            log::info!(stream_key = %key, "Stream force closed");
        }
        Ok(())
    }

    /// Check that the engine can start `key` without keeping a session open
    pub async fn check_stream_available(&self, key: &str, extra_params: &ExtraParams) -> bool {
        let engine = self.registry.engine();
        match engine.fetch_session_info(key, extra_params).await {
            Ok(session) => {
                engine.stop_session(&session).await;
                true
            }
            Err(err) => {
                log::info!(stream_key = %key, error = %err, "Stream unavailable");
                false
            }
        }
    }

    /// Close every stream and stop their engine sessions
    pub async fn shutdown(&self, grace: Duration) {
        self.registry.shutdown(grace).await;
    }
}
