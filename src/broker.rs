//! Broker core: connection lifecycle, reader/writer tasks, fan-out.
//!
//! Each accepted worker connection is registered with a fresh bounded
//! delivery queue and driven by two concurrent tasks: a reader that decodes
//! published events and pushes the raw frame onto every registered queue,
//! and a writer that drains the connection's own queue back onto the wire.
//! The first task to stop decides the outcome of the connection's run.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::DedupCache;
use crate::config::BrokerConfig;
use crate::envelope::EventEnvelope;
use crate::queue::{delivery_queue, DeliveryQueue, QueueError, QueueReceiver};
use crate::transport::{Connection, ConnectionId, TransportError};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur inside the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("dedup cache capacity must be non-zero")]
    InvalidCacheCapacity,

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("delivery queue: {0}")]
    Queue(#[from] QueueError),

    #[error("task join: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl BrokerError {
    /// True when the underlying cause is only a peer disconnect.
    fn is_peer_close(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Closed))
    }
}

/// Outcome of one connection's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The connection ran to completion: clean close, deregistration, or
    /// process shutdown.
    Completed,
    /// A task ended with an unexpected I/O or queue error.
    Failed,
    /// The connection could not be established at all.
    Rejected,
}

/// Which task of the pair finished first.
enum FirstDone {
    Reader(std::result::Result<Result<()>, tokio::task::JoinError>),
    Writer(std::result::Result<Result<()>, tokio::task::JoinError>),
}

/// Worker-to-worker event fan-out broker.
///
/// One instance per process. Workers connect once each; every event one of
/// them publishes is fanned out to all registered connections, the
/// publisher included. Events carrying a uniqueness key go to exactly one
/// connection and repeats within the suppression window are dropped.
pub struct Broker {
    config: BrokerConfig,
    uniques: DedupCache,
    clients: RwLock<HashMap<ConnectionId, DeliveryQueue>>,
    shutdown: watch::Sender<bool>,
}

impl Broker {
    /// Create a broker from configuration.
    ///
    /// Fails if the dedup cache cannot be allocated.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let uniques = DedupCache::new(config.max_unique_events)
            .ok_or(BrokerError::InvalidCacheCapacity)?;
        let (shutdown, _) = watch::channel(false);

        info!(
            unique_window_ms = config.unique_window_ms,
            max_queue_len = config.max_queue_len,
            "broker initialized"
        );

        Ok(Self {
            config,
            uniques,
            clients: RwLock::new(HashMap::new()),
            shutdown,
        })
    }

    /// Signal every connection's tasks to stop.
    ///
    /// Cancellation is abrupt: queued-but-unsent payloads are dropped.
    pub fn shutdown(&self) {
        info!("broker shutting down");
        // send_replace updates the value even with no live receivers.
        self.shutdown.send_replace(true);
    }

    /// True once [`Broker::shutdown`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Number of currently registered connections.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn is_registered(&self, id: ConnectionId) -> bool {
        self.clients.read().await.contains_key(&id)
    }

    async fn register(&self, id: ConnectionId, queue: DeliveryQueue) {
        self.clients.write().await.insert(id, queue);
        info!(connection = %id, "worker connection registered");
    }

    async fn deregister(&self, id: ConnectionId) {
        self.clients.write().await.remove(&id);
        info!(connection = %id, "worker connection deregistered");
    }

    /// Drive one accept result.
    ///
    /// Connections that could not be established short-circuit to
    /// [`RunStatus::Rejected`]; accepted ones are handed to [`Broker::run`].
    pub async fn serve(
        self: Arc<Self>,
        accepted: std::result::Result<Arc<dyn Connection>, TransportError>,
    ) -> RunStatus {
        match accepted {
            Ok(conn) => self.run(conn).await,
            Err(e) => {
                error!(error = %e, "worker connection rejected");
                RunStatus::Rejected
            }
        }
    }

    /// Run one established connection to completion.
    ///
    /// Registers the connection, drives its reader and writer tasks, and
    /// deregisters on every exit path. A peer disconnect is a normal
    /// completion; any other task error fails the run unless the process is
    /// shutting down, which always takes precedence.
    pub async fn run(self: Arc<Self>, conn: Arc<dyn Connection>) -> RunStatus {
        let id = conn.id();
        let (queue, queue_rx) = delivery_queue(self.config.max_queue_len);
        self.register(id, queue).await;

        let mut reader: JoinHandle<Result<()>> = tokio::spawn({
            let broker = self.clone();
            let conn = conn.clone();
            async move { broker.read_events(conn).await }
        });
        let mut writer: JoinHandle<Result<()>> = tokio::spawn({
            let broker = self.clone();
            let conn = conn.clone();
            async move { broker.write_events(conn, queue_rx).await }
        });

        // First completion decides the outcome; the other task is still a
        // live producer/consumer of the queue and connection here.
        let first = tokio::select! {
            r = &mut reader => FirstDone::Reader(r),
            w = &mut writer => FirstDone::Writer(w),
        };

        // Deregister before looking at the shutdown flag, so no other
        // reader can enqueue work for this connection past this point.
        self.deregister(id).await;

        if self.is_shutting_down() {
            reader.abort();
            writer.abort();
            debug!(connection = %id, "connection run ended by shutdown");
            return RunStatus::Completed;
        }

        let (finished, survivor) = match first {
            FirstDone::Reader(r) => (r, &mut writer),
            FirstDone::Writer(w) => (w, &mut reader),
        };
        let mut failure = task_failure(finished);

        // Wait for the surviving task so nothing keeps referencing a queue
        // that is no longer reachable from the broker.
        let second = survivor.await;
        if failure.is_none() {
            failure = task_failure(second);
        }

        match failure {
            Some(e) => {
                error!(connection = %id, error = %e, "worker connection failed");
                RunStatus::Failed
            }
            None => {
                debug!(connection = %id, "connection run completed");
                RunStatus::Completed
            }
        }
    }

    /// Reader task: receive frames, decode, dedup, broadcast.
    async fn read_events(&self, conn: Arc<dyn Connection>) -> Result<()> {
        let id = conn.id();
        loop {
            if !self.is_registered(id).await || self.is_shutting_down() {
                return Ok(());
            }

            let frame = match conn.recv_frame(self.config.recv_timeout()).await {
                Ok(frame) => frame,
                // Idle is the normal case, re-check the loop condition.
                Err(TransportError::Timeout) => continue,
                Err(e) => return Err(e.into()),
            };

            if frame.is_empty() {
                if !self.is_shutting_down() {
                    warn!(connection = %id, "empty frame received, ignoring");
                }
                continue;
            }

            let envelope = match EventEnvelope::decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // One malformed producer must not take the broker down.
                    if !self.is_shutting_down() {
                        warn!(connection = %id, error = %e, "undecodable frame, ignoring");
                    }
                    continue;
                }
            };

            self.broadcast(envelope, frame).await;
        }
    }

    /// Writer task: drain this connection's queue onto the wire.
    async fn write_events(
        &self,
        conn: Arc<dyn Connection>,
        mut queue: QueueReceiver,
    ) -> Result<()> {
        let id = conn.id();
        loop {
            if !self.is_registered(id).await || self.is_shutting_down() {
                return Ok(());
            }

            let payload = match queue.pop(self.config.pop_timeout()).await {
                Ok(payload) => payload,
                Err(QueueError::Timeout) => continue,
                // Push side dropped: the connection was deregistered.
                Err(QueueError::Closed) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            // No retry: a failed send means the connection is broken.
            conn.send_frame(payload).await?;
        }
    }

    /// Fan one decoded event out to the current set of registered queues.
    ///
    /// The raw frame is forwarded as-is; the envelope only drives policy
    /// and diagnostics. Push failures are tolerated per recipient.
    async fn broadcast(&self, envelope: EventEnvelope, frame: Bytes) {
        if let Some(key) = envelope.unique.as_deref() {
            // One atomic claim per key per window; reader tasks on other
            // worker threads must not both win.
            if !self
                .uniques
                .insert_if_absent(key, self.config.unique_window())
            {
                debug!(unique = %key, event = %envelope.event, "duplicate unique event suppressed");
                return;
            }
        }

        // Snapshot under the read lock, push after releasing it.
        // Connections registering after this point miss this event.
        let targets: Vec<(ConnectionId, DeliveryQueue)> = {
            let clients = self.clients.read().await;
            clients.iter().map(|(id, q)| (*id, q.clone())).collect()
        };

        if envelope.unique.is_some() {
            // First successful push wins; iteration order is arbitrary.
            for (id, queue) in &targets {
                match queue.push(frame.clone()) {
                    Ok(()) => {
                        debug!(connection = %id, event = %envelope.event, "unique event delivered");
                        return;
                    }
                    Err(e) => {
                        warn!(
                            connection = %id,
                            error = %e,
                            envelope = ?envelope,
                            "unique event push failed, trying next connection"
                        );
                    }
                }
            }
            warn!(event = %envelope.event, "unique event delivered to no connection");
        } else {
            let mut delivered = 0usize;
            for (id, queue) in &targets {
                match queue.push(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!(
                            connection = %id,
                            error = %e,
                            envelope = ?envelope,
                            "event push failed"
                        );
                    }
                }
            }
            debug!(
                event = %envelope.event,
                delivered,
                targets = targets.len(),
                "event broadcast"
            );
        }
    }
}

/// Map a joined task result to the error that should fail the run, if any.
fn task_failure(
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Option<BrokerError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) if e.is_peer_close() => None,
        Ok(Err(e)) => Some(e),
        Err(e) if e.is_cancelled() => None,
        Err(e) => Some(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(50);

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            unique_window_ms: 200,
            max_queue_len: 8,
            recv_timeout_ms: 50,
            pop_timeout_ms: 50,
            ..BrokerConfig::default()
        }
    }

    fn frame_for(envelope: &EventEnvelope) -> Bytes {
        envelope.encode().unwrap()
    }

    async fn drain(rx: &mut QueueReceiver) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.pop(WAIT).await {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_zero_cache_capacity_fails_initialization() {
        let config = BrokerConfig {
            max_unique_events: 0,
            ..BrokerConfig::default()
        };
        let result = Broker::new(config);
        assert!(matches!(result, Err(BrokerError::InvalidCacheCapacity)));
    }

    #[tokio::test]
    async fn test_broadcast_pushes_to_every_registered_queue() {
        let broker = Broker::new(test_config()).unwrap();
        let (q1, mut rx1) = delivery_queue(8);
        let (q2, mut rx2) = delivery_queue(8);
        broker.register(ConnectionId::next(), q1).await;
        broker.register(ConnectionId::next(), q2).await;

        let envelope = EventEnvelope::broadcast("a", "x", "payload");
        let frame = frame_for(&envelope);
        broker.broadcast(envelope, frame.clone()).await;

        assert_eq!(drain(&mut rx1).await, vec![frame.clone()]);
        assert_eq!(drain(&mut rx2).await, vec![frame]);
    }

    #[tokio::test]
    async fn test_unique_event_reaches_exactly_one_queue() {
        let broker = Broker::new(test_config()).unwrap();
        let (q1, mut rx1) = delivery_queue(8);
        let (q2, mut rx2) = delivery_queue(8);
        broker.register(ConnectionId::next(), q1).await;
        broker.register(ConnectionId::next(), q2).await;

        let envelope = EventEnvelope::unique("k1", "a", "y", "");
        let frame = frame_for(&envelope);
        broker.broadcast(envelope, frame).await;

        let total = drain(&mut rx1).await.len() + drain(&mut rx2).await.len();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_duplicate_unique_event_suppressed_within_window() {
        let broker = Broker::new(test_config()).unwrap();
        let (q1, mut rx1) = delivery_queue(8);
        broker.register(ConnectionId::next(), q1).await;

        let envelope = EventEnvelope::unique("k1", "a", "y", "");
        let frame = frame_for(&envelope);
        broker.broadcast(envelope.clone(), frame.clone()).await;
        broker.broadcast(envelope, frame).await;

        assert_eq!(drain(&mut rx1).await.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_unique_broadcasts_deliver_once() {
        let broker = Arc::new(Broker::new(test_config()).unwrap());
        let (q1, mut rx1) = delivery_queue(64);
        broker.register(ConnectionId::next(), q1).await;

        // Same key raced from parallel reader tasks: exactly one may win.
        let mut joins = Vec::new();
        for _ in 0..16 {
            let broker = broker.clone();
            let envelope = EventEnvelope::unique("k1", "a", "y", "");
            let frame = frame_for(&envelope);
            joins.push(tokio::spawn(async move {
                broker.broadcast(envelope, frame).await;
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        assert_eq!(drain(&mut rx1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unique_event_delivered_again_after_window() {
        let broker = Broker::new(test_config()).unwrap();
        let (q1, mut rx1) = delivery_queue(8);
        broker.register(ConnectionId::next(), q1).await;

        let envelope = EventEnvelope::unique("k1", "a", "y", "");
        let frame = frame_for(&envelope);
        broker.broadcast(envelope.clone(), frame.clone()).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        broker.broadcast(envelope, frame).await;

        assert_eq!(drain(&mut rx1).await.len(), 2);
    }

    #[tokio::test]
    async fn test_unique_event_skips_full_queue() {
        let broker = Broker::new(test_config()).unwrap();
        let (full, _full_rx) = delivery_queue(1);
        full.push(Bytes::from_static(b"stuck")).unwrap();
        let (open, mut open_rx) = delivery_queue(8);
        broker.register(ConnectionId::next(), full).await;
        broker.register(ConnectionId::next(), open).await;

        let envelope = EventEnvelope::unique("k1", "a", "y", "");
        let frame = frame_for(&envelope);
        broker.broadcast(envelope, frame.clone()).await;

        assert_eq!(drain(&mut open_rx).await, vec![frame]);
    }

    #[tokio::test]
    async fn test_full_queue_does_not_abort_broadcast_to_others() {
        let broker = Broker::new(test_config()).unwrap();
        let (full, _full_rx) = delivery_queue(1);
        full.push(Bytes::from_static(b"stuck")).unwrap();
        let (open, mut open_rx) = delivery_queue(8);
        broker.register(ConnectionId::next(), full).await;
        broker.register(ConnectionId::next(), open).await;

        let envelope = EventEnvelope::broadcast("a", "x", "payload");
        let frame = frame_for(&envelope);
        broker.broadcast(envelope, frame.clone()).await;

        assert_eq!(drain(&mut open_rx).await, vec![frame]);
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_abort_broadcast() {
        let broker = Broker::new(test_config()).unwrap();
        let (dead, dead_rx) = delivery_queue(8);
        drop(dead_rx);
        let (open, mut open_rx) = delivery_queue(8);
        broker.register(ConnectionId::next(), dead).await;
        broker.register(ConnectionId::next(), open).await;

        let envelope = EventEnvelope::broadcast("a", "x", "payload");
        let frame = frame_for(&envelope);
        broker.broadcast(envelope, frame.clone()).await;

        assert_eq!(drain(&mut open_rx).await, vec![frame]);
    }

    #[tokio::test]
    async fn test_shutdown_flag_observable() {
        let broker = Broker::new(test_config()).unwrap();
        assert!(!broker.is_shutting_down());
        broker.shutdown();
        assert!(broker.is_shutting_down());
    }
}
