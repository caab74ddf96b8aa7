// Mock engine for testing without a live streaming engine

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};

use super::{ChunkStream, EngineApi, UpstreamSession};
use crate::error::{StreamError, StreamResult};

/// Scripted engine: counts every call and replays a fixed chunk list.
///
/// After the script the playback either stays open forever (default) or ends.
#[derive(Debug)]
pub struct MockEngine {
    session_error: Option<StreamError>,
    session_delay: Duration,
    playback_error: Option<StreamError>,
    script: Vec<Bytes>,
    chunk_interval: Duration,
    hold_open: bool,
    pub fetch_calls: AtomicUsize,
    pub open_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            session_error: None,
            session_delay: Duration::ZERO,
            playback_error: None,
            script: Vec::new(),
            chunk_interval: Duration::from_millis(1),
            hold_open: true,
            fetch_calls: AtomicUsize::new(0),
            open_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_chunks<I, B>(mut self, chunks: I, interval: Duration) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.script = chunks.into_iter().map(Into::into).collect();
        self.chunk_interval = interval;
        self
    }

    pub fn with_session_error(mut self, err: StreamError) -> Self {
        self.session_error = Some(err);
        self
    }

    pub fn with_session_delay(mut self, delay: Duration) -> Self {
        self.session_delay = delay;
        self
    }

    pub fn with_playback_error(mut self, err: StreamError) -> Self {
        self.playback_error = Some(err);
        self
    }

    /// End the playback after the scripted chunks instead of idling
    pub fn ending(mut self) -> Self {
        self.hold_open = false;
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineApi for MockEngine {
    async fn fetch_session_info(
        &self,
        key: &str,
        _extra_params: &[(String, String)],
    ) -> StreamResult<UpstreamSession> {
        let n = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.session_delay.is_zero() {
            tokio::time::sleep(self.session_delay).await;
        }
        if let Some(err) = &self.session_error {
            return Err(err.clone());
        }
        Ok(UpstreamSession {
            key: key.to_string(),
            playback_url: format!("mock://{key}/{n}/play"),
            stat_url: Some(format!("mock://{key}/{n}/stat")),
            command_url: format!("mock://{key}/{n}/cmd"),
        })
    }

    async fn open_playback(&self, _session: &UpstreamSession) -> StreamResult<ChunkStream> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.playback_error {
            return Err(err.clone());
        }

        let interval = self.chunk_interval;
        let head = stream::iter(self.script.clone()).then(move |chunk| async move {
            tokio::time::sleep(interval).await;
            Ok(chunk)
        });
        let tail: ChunkStream = if self.hold_open {
            stream::pending().boxed()
        } else {
            stream::empty().boxed()
        };
        Ok(head.chain(tail).boxed())
    }

    async fn stop_session(&self, _session: &UpstreamSession) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn session_stats(&self, session: &UpstreamSession) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "status": "dl", "key": session.key }))
    }
}
