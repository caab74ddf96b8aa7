// Key -> Stream registry

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tracing as log;

use super::stream::{CloseReason, Stream, StreamSettings};
use crate::engine::{EngineApi, ExtraParams};
use crate::error::{StreamError, StreamResult};

pub(crate) type StreamMap = DashMap<String, Arc<Stream>>;

/// Owns every live stream, at most one per key.
///
/// Admission goes through the map's entry lock, so concurrent callers for
/// the same key always end up on the same `Stream`. The entry lock is only
/// held for in-memory work; streams unregister themselves on close and only
/// remove the entry if it still points at them.
pub struct StreamRegistry {
    streams: Arc<StreamMap>,
    engine: Arc<dyn EngineApi>,
    settings: StreamSettings,
    shutting_down: AtomicBool,
}

impl StreamRegistry {
    pub fn new(engine: Arc<dyn EngineApi>, settings: StreamSettings) -> Self {
        Self {
            streams: Arc::new(DashMap::new()),
            engine,
            settings,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Return the live stream for `key`, creating it if absent.
    ///
    /// A closed stream still in the map (its close is in flight) is replaced.
    /// The new stream is not started here. Fails with
    /// [`StreamError::ShuttingDown`] once [`StreamRegistry::shutdown`] began.
    pub fn acquire_or_create(&self, key: &str, extra_params: &ExtraParams) -> StreamResult<Arc<Stream>> {
        let entry = self.streams.entry(key.to_string());
        // Checked under the entry lock so shutdown sees every admitted stream
        if self.is_shutting_down() {
            return Err(StreamError::ShuttingDown);
        }
        let stream = match entry {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Ok(Arc::clone(entry.get()));
                }
                let stream = self.new_stream(key, extra_params);
                entry.insert(Arc::clone(&stream));
                log::debug!(stream_key = %key, "Replaced closing stream");
                stream
            }
            Entry::Vacant(entry) => {
                let stream = self.new_stream(key, extra_params);
                entry.insert(Arc::clone(&stream));
                log::info!(stream_key = %key, "Created stream");
                stream
            }
        };
        Ok(stream)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn new_stream(&self, key: &str, extra_params: &ExtraParams) -> Arc<Stream> {
        Stream::new(
            key.to_string(),
            extra_params.clone(),
            Arc::clone(&self.engine),
            self.settings.clone(),
            Arc::downgrade(&self.streams),
        )
    }

    pub fn get(&self, key: &str) -> Option<Arc<Stream>> {
        self.streams
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|stream| !stream.is_closed())
    }

    /// Live streams, copied out of the map
    pub fn snapshot(&self) -> Vec<Arc<Stream>> {
        self.streams
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .filter(|stream| !stream.is_closed())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.snapshot().iter().map(|s| s.key().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn engine(&self) -> &Arc<dyn EngineApi> {
        &self.engine
    }

    pub const fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// Refuse new streams, close every stream and wait up to `grace` for
    /// their upstream sessions to be stopped. Fetch tasks still running after
    /// that are aborted. Safe to call more than once.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);

        // Streams admitted just before the flag flipped may land after a
        // pass, so drain until the map stays empty
        let mut streams: Vec<Arc<Stream>> = Vec::new();
        loop {
            let batch: Vec<Arc<Stream>> = self
                .streams
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            if batch.is_empty() {
                break;
            }
            for stream in batch {
                stream.close(CloseReason::Shutdown);
                self.streams
                    .remove_if(stream.key(), |_, current| Arc::ptr_eq(current, &stream));
                streams.push(stream);
            }
        }
        if streams.is_empty() {
            return;
        }

        log::info!(streams = streams.len(), "Shutting down streams");
        let all_finished = join_all(streams.iter().map(|s| s.finished()));
        if tokio::time::timeout(grace, all_finished).await.is_err() {
            log::warn!(grace_secs = grace.as_secs(), "Streams did not stop in time, aborting fetch tasks");
            for stream in &streams {
                stream.abort_fetch();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;
    use crate::livestream::client::ClientMeta;

    fn registry(engine: Arc<MockEngine>) -> StreamRegistry {
        StreamRegistry::new(engine, StreamSettings::default())
    }

    #[tokio::test]
    async fn test_acquire_returns_same_stream() {
        let registry = registry(Arc::new(MockEngine::new()));
        let a = registry.acquire_or_create("k", &Vec::new()).unwrap();
        let b = registry.acquire_or_create("k", &Vec::new()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.keys(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_close_unregisters_stream() {
        let registry = registry(Arc::new(MockEngine::new()));
        let stream = registry.acquire_or_create("k", &Vec::new()).unwrap();
        let (id, _rx) = stream.attach(ClientMeta::default()).unwrap();

        stream.detach(id);
        assert!(stream.is_closed());
        assert!(registry.get("k").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_closed_occupant_is_replaced() {
        let registry = registry(Arc::new(MockEngine::new()));
        let old = registry.acquire_or_create("k", &Vec::new()).unwrap();
        // Simulate a close still in flight: flag set, entry not yet removed
        old.close(CloseReason::Forced);
        registry.streams.insert("k".to_string(), Arc::clone(&old));

        let new = registry.acquire_or_create("k", &Vec::new()).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(!new.is_closed());
    }

    #[tokio::test]
    async fn test_stale_close_does_not_remove_replacement() {
        let registry = registry(Arc::new(MockEngine::new()));
        let old = registry.acquire_or_create("k", &Vec::new()).unwrap();
        let replacement = Stream::new(
            "k".to_string(),
            Vec::new(),
            Arc::clone(registry.engine()),
            StreamSettings::default(),
            Arc::downgrade(&registry.streams),
        );
        registry.streams.insert("k".to_string(), Arc::clone(&replacement));

        old.close(CloseReason::Forced);
        let current = registry.get("k").unwrap();
        assert!(Arc::ptr_eq(&current, &replacement));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_every_stream() {
        let engine = Arc::new(MockEngine::new().with_chunks(["x"], Duration::from_millis(1)));
        let registry = registry(engine.clone());

        let mut receivers = Vec::new();
        for key in ["a", "b"] {
            let stream = registry.acquire_or_create(key, &Vec::new()).unwrap();
            let (_id, rx) = stream.attach(ClientMeta::default()).unwrap();
            receivers.push(rx);
            stream.ensure_started();
            stream.wait_ready().await.unwrap();
        }

        registry.shutdown(Duration::from_secs(5)).await;
        assert!(registry.is_empty());
        assert_eq!(engine.stops(), 2);
        for mut rx in receivers {
            assert_eq!(rx.recv().await.unwrap(), bytes::Bytes::from_static(b"x"));
            assert!(rx.recv().await.is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_new_streams() {
        let engine = Arc::new(
            MockEngine::new()
                .with_session_delay(Duration::from_secs(10))
                .with_chunks(["x"], Duration::from_millis(1)),
        );
        let registry = Arc::new(registry(engine.clone()));

        let a = registry.acquire_or_create("a", &Vec::new()).unwrap();
        let (_id, _rx) = a.attach(ClientMeta::default()).unwrap();
        a.ensure_started();

        let shutting_down = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.shutdown(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(registry.is_shutting_down());
        let err = registry.acquire_or_create("b", &Vec::new()).unwrap_err();
        assert_eq!(err, StreamError::ShuttingDown);

        shutting_down.await.unwrap();
        registry.shutdown(Duration::from_secs(2)).await;
        assert!(registry.streams.is_empty());
        assert!(a.is_closed());
        assert_eq!(engine.fetches(), 1);
        assert_eq!(engine.opens(), 0);
    }
}
