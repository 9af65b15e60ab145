//! In-memory loopback transport. Each path is a single partition backed by
//! an unbounded channel; sends are buffered until a subscriber attaches.
//! Commits are recorded per path so tests can assert on them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio_util::sync::CancellationToken;

use super::{Committer, ConsumerTransport, Offset, ProducerTransport, TransportEvents,
    TransportMessage};

#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    topics: parking_lot::Mutex<HashMap<String, Topic>>,
    committed: parking_lot::Mutex<HashMap<String, Offset>>,
    cancel: CancellationToken,
}

struct Topic {
    tx: UnboundedSender<TransportMessage>,
    /// Taken by the first subscriber.
    rx: Option<UnboundedReceiver<TransportMessage>>,
    next_offset: u64,
}

impl Topic {
    fn new() -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            next_offset: 0,
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last committed offset for a path, if any commit happened.
    pub fn committed(&self, path: &str) -> Option<Offset> {
        self.inner.committed.lock().get(path).copied()
    }
}

#[async_trait]
impl ProducerTransport for MemoryTransport {
    async fn send(
        &self,
        path: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        let mut topics = self.inner.topics.lock();
        let topic = topics.entry(path.to_string()).or_insert_with(Topic::new);
        let message = TransportMessage {
            payload,
            headers,
            offset: Offset(topic.next_offset),
        };
        topic.next_offset += 1;
        topic
            .tx
            .send(message)
            .map_err(|_| anyhow::anyhow!("loopback path '{path}' is closed"))
    }
}

struct MemoryCommitter {
    inner: Arc<MemoryInner>,
    path: String,
}

#[async_trait]
impl Committer for MemoryCommitter {
    async fn commit(&self, offset: Offset) -> Result<()> {
        self.inner.committed.lock().insert(self.path.clone(), offset);
        Ok(())
    }
}

#[async_trait]
impl ConsumerTransport for MemoryTransport {
    async fn subscribe(
        &self,
        path: &str,
        _group: Option<&str>,
        events: Arc<dyn TransportEvents>,
    ) -> Result<()> {
        let mut rx = {
            let mut topics = self.inner.topics.lock();
            let topic = topics.entry(path.to_string()).or_insert_with(Topic::new);
            topic
                .rx
                .take()
                .ok_or_else(|| anyhow::anyhow!("loopback path '{path}' already subscribed"))?
        };

        let committer = Arc::new(MemoryCommitter {
            inner: self.inner.clone(),
            path: path.to_string(),
        });
        events.on_assigned(0, committer).await;

        let cancel = self.inner.cancel.child_token();
        let path = path.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        events.on_closed(0).await;
                        break;
                    }
                    message = rx.recv() => match message {
                        Some(message) => events.on_message(0, message).await,
                        None => {
                            tracing::debug!(path, "loopback sender dropped");
                            events.on_closed(0).await;
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.cancel.cancel();
        Ok(())
    }
}
