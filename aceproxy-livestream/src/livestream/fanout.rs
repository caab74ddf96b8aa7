// Per-chunk fan-out to every client of a stream

use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use tracing as log;

use super::client::{ClientId, Delivery};
use super::stream::Stream;
use crate::error::StreamError;

/// Counts for a single distribution pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributionReport {
    pub delivered: usize,
    pub evicted: usize,
}

/// Delivers chunks without letting one slow client hold up the others.
///
/// Each pass snapshots the client map, tries a non-blocking enqueue for
/// every client, then gives the clients with full queues one concurrent
/// retry bounded by `retry_bound`. A pass therefore never takes longer than
/// the retry bound, however slow any one client is. Clients that still
/// cannot take the chunk, or whose receiver is gone, are evicted.
#[derive(Debug, Clone, Copy)]
pub struct Distributor {
    retry_bound: Duration,
}

impl Distributor {
    #[must_use]
    pub const fn new(retry_bound: Duration) -> Self {
        Self { retry_bound }
    }

    pub const fn retry_bound(&self) -> Duration {
        self.retry_bound
    }

    pub async fn distribute(&self, stream: &Stream, chunk: &Bytes) -> DistributionReport {
        let clients = stream.client_handles();
        let mut report = DistributionReport::default();
        let mut dead: Vec<(ClientId, &'static str)> = Vec::new();
        let mut backlogged = Vec::new();

        for client in clients {
            match client.try_deliver(chunk) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Full => backlogged.push(client),
                Delivery::Gone => dead.push((client.id(), "receiver dropped")),
            }
        }

        if !backlogged.is_empty() {
            let retries = backlogged
                .iter()
                .map(|client| client.deliver_within(chunk.clone(), self.retry_bound));
            let outcomes = join_all(retries).await;

            for (client, outcome) in backlogged.iter().zip(outcomes) {
                match outcome {
                    Delivery::Delivered => report.delivered += 1,
                    Delivery::Full => dead.push((client.id(), "queue full past retry bound")),
                    Delivery::Gone => dead.push((client.id(), "receiver dropped")),
                }
            }
        }

        if !dead.is_empty() {
            for (id, why) in &dead {
                let err = StreamError::ClientUnresponsive(format!("{id}: {why}"));
                log::info!(stream_key = %stream.key(), client_id = %id, error = %err, "Evicting client");
            }
            let ids: Vec<ClientId> = dead.iter().map(|(id, _)| *id).collect();
            report.evicted = stream.remove_clients(&ids);
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};

    use tokio::time::Instant;

    use super::*;
    use crate::engine::MockEngine;
    use crate::livestream::client::ClientMeta;
    use crate::livestream::stream::StreamSettings;

    fn stream() -> Arc<Stream> {
        Stream::new(
            "fanout".to_string(),
            Vec::new(),
            Arc::new(MockEngine::new()),
            StreamSettings::default(),
            Weak::new(),
        )
    }

    fn tiny() -> ClientMeta {
        ClientMeta {
            queue_capacity: Some(1),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_distribute_to_all() {
        let stream = stream();
        let (_a, mut rx_a) = stream.attach(ClientMeta::default()).unwrap();
        let (_b, mut rx_b) = stream.attach(ClientMeta::default()).unwrap();
        let distributor = Distributor::new(Duration::from_millis(150));

        let report = distributor.distribute(&stream, &Bytes::from_static(b"c1")).await;
        assert_eq!(report, DistributionReport { delivered: 2, evicted: 0 });
        assert_eq!(rx_a.recv().await.unwrap(), Bytes::from_static(b"c1"));
        assert_eq!(rx_b.recv().await.unwrap(), Bytes::from_static(b"c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_client_evicted_within_retry_bound() {
        let stream = stream();
        let (fast, mut rx_fast) = stream.attach(ClientMeta::default()).unwrap();
        let (slow, _rx_slow) = stream.attach(tiny()).unwrap();
        let distributor = Distributor::new(Duration::from_millis(150));

        distributor.distribute(&stream, &Bytes::from_static(b"1")).await;

        let started = Instant::now();
        let report = distributor.distribute(&stream, &Bytes::from_static(b"2")).await;
        let elapsed = started.elapsed();

        assert_eq!(report, DistributionReport { delivered: 1, evicted: 1 });
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(200), "{elapsed:?}");
        assert!(stream.client(slow).is_none());
        assert!(stream.client(fast).is_some());
        assert!(!stream.is_closed());

        // Later chunks are no longer held up
        let started = Instant::now();
        distributor.distribute(&stream, &Bytes::from_static(b"3")).await;
        assert!(started.elapsed() < Duration::from_millis(1));

        for expected in [b"1", b"2", b"3"] {
            assert_eq!(rx_fast.recv().await.unwrap(), Bytes::from_static(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_receiver_evicted_immediately() {
        let stream = stream();
        let (_keep, _rx_keep) = stream.attach(ClientMeta::default()).unwrap();
        let (gone, rx_gone) = stream.attach(ClientMeta::default()).unwrap();
        drop(rx_gone);

        let started = Instant::now();
        let report = Distributor::new(Duration::from_millis(150))
            .distribute(&stream, &Bytes::from_static(b"x"))
            .await;
        assert_eq!(report.evicted, 1);
        assert!(started.elapsed() < Duration::from_millis(1));
        assert!(stream.client(gone).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicting_last_client_closes_stream() {
        let stream = stream();
        let (_only, _rx) = stream.attach(tiny()).unwrap();
        let distributor = Distributor::new(Duration::from_millis(100));

        distributor.distribute(&stream, &Bytes::from_static(b"1")).await;
        let report = distributor.distribute(&stream, &Bytes::from_static(b"2")).await;

        assert_eq!(report.evicted, 1);
        assert!(stream.is_closed());
    }
}
