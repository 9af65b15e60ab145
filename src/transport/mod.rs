//! Transport adapter seam.
//!
//! Per-broker clients implement these traits; the core supplies the
//! [`TransportEvents`] callbacks that drive partition lifecycle and message
//! delivery. For non-partitioned brokers each subscription/queue is its own
//! partition.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

mod memory;
pub use memory::MemoryTransport;

/// Opaque per-transport position within a partition. Adapters map their
/// native positions onto it; the committer never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(pub u64);

impl std::fmt::Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One inbound message as the transport delivered it.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub payload: Bytes,
    /// Raw transport header bag.
    pub headers: HashMap<String, String>,
    pub offset: Offset,
}

/// Outbound side of a transport adapter.
#[async_trait]
pub trait ProducerTransport: Send + Sync {
    /// Publish a payload and header bag to a path. Returns when the
    /// transport acknowledges.
    async fn send(&self, path: &str, payload: Bytes, headers: HashMap<String, String>)
    -> Result<()>;
}

/// Records consumer progress with the broker so messages are not
/// redelivered.
#[async_trait]
pub trait Committer: Send + Sync {
    async fn commit(&self, offset: Offset) -> Result<()>;
}

/// Callbacks supplied by the core when subscribing. The adapter must call
/// `on_message` serially per partition; ordering across partitions is
/// unconstrained.
#[async_trait]
pub trait TransportEvents: Send + Sync {
    async fn on_assigned(&self, partition: u32, committer: Arc<dyn Committer>);
    async fn on_message(&self, partition: u32, message: TransportMessage);
    /// Catch-up completion marker on log transports.
    async fn on_end_reached(&self, partition: u32, offset: Offset);
    async fn on_revoked(&self, partition: u32);
    async fn on_closed(&self, partition: u32);
    fn on_error(&self, error: anyhow::Error);
}

/// Inbound side of a transport adapter.
#[async_trait]
pub trait ConsumerTransport: Send + Sync {
    async fn subscribe(
        &self,
        path: &str,
        group: Option<&str>,
        events: Arc<dyn TransportEvents>,
    ) -> Result<()>;

    /// Stop all subscriptions; adapters deliver `on_closed` to each.
    async fn stop(&self) -> Result<()>;
}
