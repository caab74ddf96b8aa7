// Downstream client handle and its bounded delivery queue

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::time::Instant;
use uuid::Uuid;

/// Identity of one attached consumer, unique per process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptive metadata supplied by the front door
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub display_name: Option<String>,
    /// Overrides the configured queue capacity for this client
    pub queue_capacity: Option<usize>,
}

/// Outcome of a single delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Queue at capacity, the chunk was not enqueued
    Full,
    /// Receiver dropped, the client is gone
    Gone,
}

/// One attached consumer.
///
/// The stream owns the `Client`; the consumer holds the matching receiver.
/// Chunks are enqueued in order and never reordered or duplicated.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    meta: ClientMeta,
    connected_at: DateTime<Utc>,
    sink: mpsc::Sender<Bytes>,
    last_active: Mutex<Instant>,
}

impl Client {
    /// Build a client with a queue of `capacity` chunks (minimum 1)
    pub fn new(meta: ClientMeta, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let capacity = meta.queue_capacity.unwrap_or(capacity).max(1);
        let (sink, receiver) = mpsc::channel(capacity);
        let client = Self {
            id: ClientId::new(),
            meta,
            connected_at: Utc::now(),
            sink,
            last_active: Mutex::new(Instant::now()),
        };
        (client, receiver)
    }

    pub const fn id(&self) -> ClientId {
        self.id
    }

    pub const fn meta(&self) -> &ClientMeta {
        &self.meta
    }

    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    #[cfg(test)]
    pub fn set_last_active(&self, at: Instant) {
        *self.last_active.lock() = at;
    }

    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_active()) > threshold
    }

    /// Enqueue without waiting
    pub fn try_deliver(&self, chunk: &Bytes) -> Delivery {
        match self.sink.try_send(chunk.clone()) {
            Ok(()) => {
                self.touch();
                Delivery::Delivered
            }
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }

    /// Enqueue, waiting at most `within` for queue space
    pub async fn deliver_within(&self, chunk: Bytes, within: Duration) -> Delivery {
        match self.sink.send_timeout(chunk, within).await {
            Ok(()) => {
                self.touch();
                Delivery::Delivered
            }
            Err(SendTimeoutError::Timeout(_)) => Delivery::Full,
            Err(SendTimeoutError::Closed(_)) => Delivery::Gone,
        }
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id,
            ip: self.meta.ip.clone(),
            user_agent: self.meta.user_agent.clone(),
            display_name: self.meta.display_name.clone(),
            connected_at: self.connected_at,
            idle_seconds: Instant::now()
                .saturating_duration_since(self.last_active())
                .as_secs_f64(),
            queued_chunks: self.queued(),
        }
    }

    /// Chunks enqueued but not yet taken by the consumer
    pub fn queued(&self) -> usize {
        self.sink.max_capacity() - self.sink.capacity()
    }
}

/// Serializable snapshot of a client for status listings
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub display_name: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub idle_seconds: f64,
    pub queued_chunks: usize,
}

/// One viewer as shown in management listings.
///
/// Players that open several connections at once (one for the app, one for
/// the video) appear as a single viewer with `connection_count > 1`.
#[derive(Debug, Clone, Serialize)]
pub struct ViewerInfo {
    pub display_name: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub connection_count: usize,
    pub user_agents: Vec<Option<String>>,
    pub client_ids: Vec<ClientId>,
}

impl ViewerInfo {
    fn merged(connections: &[ClientInfo]) -> Option<Self> {
        let first = connections.first()?;
        Some(Self {
            display_name: first.display_name.clone(),
            ip: first.ip.clone(),
            user_agent: first.user_agent.clone(),
            connected_at: first.connected_at,
            connection_count: connections.len(),
            user_agents: connections.iter().map(|c| c.user_agent.clone()).collect(),
            client_ids: connections.iter().map(|c| c.id).collect(),
        })
    }
}

/// Merge connections sharing display name and ip when all of them opened
/// within `window` of each other. Groups spread wider are reconnections and
/// stay separate.
pub fn group_viewers(mut clients: Vec<ClientInfo>, window: chrono::Duration) -> Vec<ViewerInfo> {
    clients.sort_by_key(|c| c.connected_at);

    let mut groups: Vec<Vec<ClientInfo>> = Vec::new();
    for client in clients {
        let existing = groups.iter_mut().find(|group| {
            group
                .first()
                .is_some_and(|g| g.display_name == client.display_name && g.ip == client.ip)
        });
        match existing {
            Some(group) => group.push(client),
            None => groups.push(vec![client]),
        }
    }

    let mut viewers = Vec::new();
    for group in groups {
        let span = match (group.first(), group.last()) {
            (Some(first), Some(last)) => last.connected_at - first.connected_at,
            _ => continue,
        };
        if span <= window {
            viewers.extend(ViewerInfo::merged(&group));
        } else {
            viewers.extend(group.chunks(1).filter_map(ViewerInfo::merged));
        }
    }
    viewers
}
