//! Fanbus - worker-to-worker event fan-out broker.
//!
//! Fans events published by any worker of a multi-process server out to
//! all connected workers (or, for events carrying a uniqueness key, exactly
//! one) over a private full-duplex framed channel per worker. Each worker
//! connects once; the broker reads published events off that connection,
//! applies the dedup policy, and forwards the raw frame bytes onto the
//! recipients' bounded delivery queues.

pub mod broker;
pub mod cache;
pub mod config;
pub mod envelope;
pub mod queue;
pub mod transport;

pub use broker::{Broker, BrokerError, RunStatus};
pub use cache::DedupCache;
pub use config::BrokerConfig;
pub use envelope::{CodecError, EventEnvelope};
pub use queue::{delivery_queue, DeliveryQueue, QueueError, QueueReceiver};
pub use transport::{
    Connection, ConnectionId, FramedConnection, MemoryConnection, TransportError,
};
