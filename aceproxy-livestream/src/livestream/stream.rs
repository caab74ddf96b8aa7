// One upstream session shared by every client watching the same key.
//
// Lifecycle: Initializing -> Connecting -> Active -> Closed. A single fetch
// task owns the upstream read; it hands every chunk to the fan-out
// distributor. Closing is terminal and happens exactly once, whoever
// triggers it (last client leaving, upstream failure, admin, shutdown).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{self as log, Instrument};

use aceproxy_core::Config;

use super::client::{Client, ClientId, ClientInfo, ClientMeta};
use super::fanout::Distributor;
use super::registry::StreamMap;
use crate::engine::{ChunkStream, EngineApi, ExtraParams, UpstreamSession};
use crate::error::{StreamError, StreamResult};

/// Relayed chunks between two progress lines
const CHUNK_LOG_INTERVAL: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Initializing,
    Connecting,
    Active,
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Timing and sizing knobs a stream needs, lifted out of [`Config`]
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub engine_timeout: Duration,
    pub empty_timeout: Duration,
    pub first_chunk_timeout: Duration,
    pub client_queue_capacity: usize,
    pub client_send_retry: Duration,
    pub stale_client_threshold: Duration,
    pub stale_sweep_interval: Duration,
}

impl StreamSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            engine_timeout: config.engine.engine_timeout(),
            empty_timeout: config.streaming.empty_timeout(),
            first_chunk_timeout: config.streaming.first_chunk_timeout(),
            client_queue_capacity: config.streaming.client_queue_capacity,
            client_send_retry: config.streaming.client_send_retry(),
            stale_client_threshold: config.streaming.stale_client_threshold(),
            stale_sweep_interval: config.streaming.stale_sweep_interval(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Why a stream was closed
#[derive(Debug, Clone)]
pub enum CloseReason {
    LastClientLeft,
    Forced,
    Shutdown,
    UpstreamEnded,
    Failed(StreamError),
}

impl CloseReason {
    /// Error handed to subscribers still waiting for the stream to start
    fn waiter_error(&self, key: &str) -> StreamError {
        match self {
            Self::Failed(err) => err.clone(),
            Self::UpstreamEnded => {
                StreamError::UpstreamDisconnected(format!("{key}: upstream ended before any data"))
            }
            Self::LastClientLeft | Self::Forced | Self::Shutdown => {
                StreamError::StreamClosed(key.to_string())
            }
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LastClientLeft => f.write_str("last client left"),
            Self::Forced => f.write_str("force closed"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::UpstreamEnded => f.write_str("upstream ended"),
            Self::Failed(err) => write!(f, "{err}"),
        }
    }
}

/// Startup progress broadcast to subscribers waiting in [`Stream::wait_ready`]
#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    /// Playback opened, no bytes yet
    Started,
    /// At least one chunk relayed
    Flowing,
    Failed(StreamError),
}

#[derive(Debug)]
struct StreamInner {
    state: StreamState,
    clients: HashMap<ClientId, Arc<Client>>,
    fetch_spawned: bool,
}

pub struct Stream {
    key: String,
    extra_params: ExtraParams,
    created_at: DateTime<Utc>,
    engine: Arc<dyn EngineApi>,
    settings: StreamSettings,
    distributor: Distributor,
    streams: Weak<StreamMap>,
    inner: Mutex<StreamInner>,
    closed: AtomicBool,
    session: OnceLock<UpstreamSession>,
    readiness: watch::Sender<Readiness>,
    chunks_relayed: AtomicU64,
    cancel: CancellationToken,
    finished: CancellationToken,
    fetch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

impl Stream {
    /// Create a stream in `Initializing`. Nothing touches the engine until
    /// [`Stream::ensure_started`].
    pub(crate) fn new(
        key: String,
        extra_params: ExtraParams,
        engine: Arc<dyn EngineApi>,
        settings: StreamSettings,
        streams: Weak<StreamMap>,
    ) -> Arc<Self> {
        let (readiness, _) = watch::channel(Readiness::Pending);
        Arc::new(Self {
            key,
            extra_params,
            created_at: Utc::now(),
            engine,
            distributor: Distributor::new(settings.client_send_retry),
            settings,
            streams,
            inner: Mutex::new(StreamInner {
                state: StreamState::Initializing,
                clients: HashMap::new(),
                fetch_spawned: false,
            }),
            closed: AtomicBool::new(false),
            session: OnceLock::new(),
            readiness,
            chunks_relayed: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            fetch_handle: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn extra_params(&self) -> &[(String, String)] {
        &self.extra_params
    }

    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    /// Lock-free closed check, safe to call while holding the registry lock
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn session(&self) -> Option<&UpstreamSession> {
        self.session.get()
    }

    pub fn chunks_relayed(&self) -> u64 {
        self.chunks_relayed.load(Ordering::SeqCst)
    }

    pub fn client_snapshot(&self) -> Vec<ClientInfo> {
        self.client_handles().iter().map(|c| c.info()).collect()
    }

    #[cfg(test)]
    pub(crate) fn client(&self, id: ClientId) -> Option<Arc<Client>> {
        self.inner.lock().clients.get(&id).cloned()
    }

    /// Current clients, copied out so no I/O happens under the lock
    pub(crate) fn client_handles(&self) -> Vec<Arc<Client>> {
        self.inner.lock().clients.values().cloned().collect()
    }

    /// Register a new client. Fails once the stream is closed.
    pub fn attach(&self, meta: ClientMeta) -> StreamResult<(ClientId, mpsc::Receiver<Bytes>)> {
        let (client, receiver) = Client::new(meta, self.settings.client_queue_capacity);
        let id = client.id();

        let count = {
            let mut inner = self.inner.lock();
            if inner.state == StreamState::Closed {
                return Err(StreamError::StreamClosed(self.key.clone()));
            }
            inner.clients.insert(id, Arc::new(client));
            inner.clients.len()
        };

        log::info!(stream_key = %self.key, client_id = %id, clients = count, "Client attached");
        Ok((id, receiver))
    }

    /// Remove one client. Idempotent; closes the stream if it was the last one.
    pub fn detach(&self, id: ClientId) -> bool {
        let removed = self.remove_clients(&[id]) > 0;
        if removed {
            log::info!(stream_key = %self.key, client_id = %id, "Client detached");
        }
        removed
    }

    /// Remove the given clients, closing the stream if none remain
    pub(crate) fn remove_clients(&self, ids: &[ClientId]) -> usize {
        let (removed, now_empty) = {
            let mut inner = self.inner.lock();
            let removed = ids
                .iter()
                .filter(|id| inner.clients.remove(*id).is_some())
                .count();
            (removed, removed > 0 && inner.clients.is_empty())
        };

        if now_empty {
            // Re-checked under the lock: a client may have attached meanwhile
            self.close_with(CloseReason::LastClientLeft, |inner| inner.clients.is_empty());
        }
        removed
    }

    /// Evict every client whose last successful delivery is older than the
    /// staleness threshold
    pub fn sweep_stale(&self) -> usize {
        let now = Instant::now();
        let threshold = self.settings.stale_client_threshold;
        let stale: Vec<ClientId> = self
            .client_handles()
            .iter()
            .filter(|c| c.is_stale(now, threshold))
            .map(|c| c.id())
            .collect();

        if stale.is_empty() {
            return 0;
        }
        for id in &stale {
            log::info!(stream_key = %self.key, client_id = %id, "Evicting stale client");
        }
        self.remove_clients(&stale)
    }

    /// Administrative close regardless of client count
    pub fn force_close(&self) -> bool {
        self.close_with(CloseReason::Forced, |_| true)
    }

    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        self.close_with(reason, |_| true)
    }

    /// Transition to `Closed` if `should_close` holds under the stream lock.
    ///
    /// Returns false when the stream was already closed or the predicate failed.
    fn close_with(&self, reason: CloseReason, should_close: impl FnOnce(&StreamInner) -> bool) -> bool {
        let (clients, fetch_spawned) = {
            let mut inner = self.inner.lock();
            if inner.state == StreamState::Closed || !should_close(&inner) {
                return false;
            }
            inner.state = StreamState::Closed;
            self.closed.store(true, Ordering::SeqCst);
            (std::mem::take(&mut inner.clients), inner.fetch_spawned)
        };

        let error = reason.waiter_error(&self.key);
        self.readiness.send_if_modified(|r| match *r {
            Readiness::Pending | Readiness::Started => {
                *r = Readiness::Failed(error);
                true
            }
            Readiness::Flowing | Readiness::Failed(_) => false,
        });
        self.cancel.cancel();

        if let Some(streams) = self.streams.upgrade() {
            streams.remove_if(&self.key, |_, current| std::ptr::eq(Arc::as_ptr(current), self));
        }
        if !fetch_spawned {
            self.finished.cancel();
        }

        log::info!(
            stream_key = %self.key,
            reason = %reason,
            clients = clients.len(),
            chunks = self.chunks_relayed(),
            "Stream closed"
        );
        // Dropping the senders ends every remaining client after its queue drains
        drop(clients);
        true
    }

    /// Spawn the fetch task once. Later calls are no-ops.
    pub(crate) fn ensure_started(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.fetch_spawned || inner.state == StreamState::Closed {
                return;
            }
            inner.fetch_spawned = true;
        }

        let stream = Arc::clone(self);
        let span = log::info_span!("stream_fetch", stream_key = %self.key);
        let handle = tokio::spawn(async move { stream.run().await }.instrument(span));
        *self.fetch_handle.lock() = Some(handle);
    }

    /// Wait until the engine has produced the first chunk.
    ///
    /// Bounded by `engine_timeout` for the session to start and then by
    /// `first_chunk_timeout` for bytes to arrive.
    pub async fn wait_ready(&self) -> StreamResult<()> {
        let mut rx = self.readiness.subscribe();

        let started = match tokio::time::timeout(
            self.settings.engine_timeout,
            rx.wait_for(|r| !matches!(r, Readiness::Pending)),
        )
        .await
        {
            Ok(Ok(r)) => r.clone(),
            Ok(Err(_)) => return Err(StreamError::StreamClosed(self.key.clone())),
            Err(_) => {
                return Err(StreamError::EngineTimeout(format!(
                    "{}: stream did not start within {}s",
                    self.key,
                    self.settings.engine_timeout.as_secs()
                )))
            }
        };
        if let Readiness::Failed(err) = started {
            return Err(err);
        }

        let flowing = tokio::time::timeout(
            self.settings.first_chunk_timeout,
            rx.wait_for(|r| matches!(r, Readiness::Flowing | Readiness::Failed(_))),
        )
        .await;
        match flowing {
            Ok(Ok(r)) => match &*r {
                Readiness::Failed(err) => Err(err.clone()),
                _ => Ok(()),
            },
            Ok(Err(_)) => Err(StreamError::StreamClosed(self.key.clone())),
            Err(_) => Err(StreamError::EngineTimeout(format!(
                "{}: no data within {}s of start",
                self.key,
                self.settings.first_chunk_timeout.as_secs()
            ))),
        }
    }

    /// Resolves once the fetch task has stopped the upstream session
    pub async fn finished(&self) {
        self.finished.cancelled().await;
    }

    pub(crate) fn abort_fetch(&self) {
        if let Some(handle) = self.fetch_handle.lock().take() {
            handle.abort();
        }
    }

    fn set_state(&self, state: StreamState) {
        let mut inner = self.inner.lock();
        if inner.state != StreamState::Closed {
            inner.state = state;
        }
    }

    fn has_flowed(&self) -> bool {
        matches!(*self.readiness.borrow(), Readiness::Flowing)
    }

    async fn run(self: Arc<Self>) {
        let reason = match self.drive().await {
            Ok(()) => CloseReason::UpstreamEnded,
            Err(err @ StreamError::EngineProtocolError(_)) => {
                log::error!(error = %err, "Engine returned a malformed response");
                CloseReason::Failed(err)
            }
            Err(err) => {
                log::warn!(error = %err, "Stream fetch failed");
                CloseReason::Failed(err)
            }
        };

        // No-op when a client, an admin or shutdown already closed it
        self.close(reason);

        if let Some(session) = self.session.get() {
            self.engine.stop_session(session).await;
        }
        self.finished.cancel();
    }

    async fn drive(&self) -> StreamResult<()> {
        // Not raced against cancel: a session the engine already created must
        // still be stopped, so wait for it
        let session = self
            .engine
            .fetch_session_info(&self.key, &self.extra_params)
            .await?;
        log::info!(playback_url = %session.playback_url, "Engine session negotiated");
        let session = self.session.get_or_init(|| session);

        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.set_state(StreamState::Connecting);

        let empty_timeout = self.settings.empty_timeout;
        let upstream = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            opened = tokio::time::timeout(empty_timeout, self.engine.open_playback(session)) => match opened {
                Ok(upstream) => upstream?,
                Err(_) => {
                    return Err(StreamError::EngineTimeout(format!(
                        "playback did not respond within {}s",
                        empty_timeout.as_secs()
                    )))
                }
            },
        };

        self.set_state(StreamState::Active);
        self.readiness.send_if_modified(|r| {
            if *r == Readiness::Pending {
                *r = Readiness::Started;
                true
            } else {
                false
            }
        });
        log::info!("Upstream playback started");

        self.pump(upstream).await
    }

    async fn pump(&self, mut upstream: ChunkStream) -> StreamResult<()> {
        let empty_timeout = self.settings.empty_timeout;
        let idle = tokio::time::sleep(empty_timeout);
        tokio::pin!(idle);

        let period = self.settings.stale_sweep_interval;
        let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                () = &mut idle => {
                    return Err(StreamError::EngineTimeout(format!(
                        "no data from upstream for {}s",
                        empty_timeout.as_secs()
                    )));
                }
                _ = sweep.tick() => {
                    self.sweep_stale();
                    if self.is_closed() {
                        return Ok(());
                    }
                }
                next = upstream.next() => match next {
                    Some(Ok(chunk)) => {
                        idle.as_mut().reset(Instant::now() + empty_timeout);
                        let report = self.distributor.distribute(self, &chunk).await;
                        let relayed = self.chunks_relayed.fetch_add(1, Ordering::SeqCst) + 1;

                        if relayed == 1 {
                            self.readiness.send_if_modified(|r| {
                                if matches!(r, Readiness::Pending | Readiness::Started) {
                                    *r = Readiness::Flowing;
                                    true
                                } else {
                                    false
                                }
                            });
                            log::info!(bytes = chunk.len(), "First chunk relayed");
                        } else if relayed % CHUNK_LOG_INTERVAL == 0 {
                            log::debug!(
                                chunks = relayed,
                                delivered = report.delivered,
                                evicted = report.evicted,
                                "Relaying"
                            );
                        }

                        if self.is_closed() {
                            return Ok(());
                        }
                    }
                    Some(Err(err)) => return Err(err),
                    None => {
                        log::info!(chunks = self.chunks_relayed(), flowed = self.has_flowed(), "Upstream ended");
                        return Ok(());
                    }
                },
            }
        }
    }
}
