//! Pending request store: issues awaiters keyed by request id, completes
//! them on response arrival, and reaps expired entries. Process-wide within
//! one bus; all operations are safe under concurrent calls.

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::AnyMessage;
use crate::error::MessageBusError;

/// Deserializes a response payload into the entry's declared response type.
pub type ResponseDecoder = Arc<dyn Fn(&[u8]) -> Result<AnyMessage> + Send + Sync>;

struct PendingEntry {
    decoder: ResponseDecoder,
    tx: oneshot::Sender<Result<AnyMessage, MessageBusError>>,
    expires_at_ms: u64,
}

#[derive(Default)]
pub struct PendingRequestStore {
    entries: DashMap<String, PendingEntry>,
}

impl PendingRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry and return its awaiter. Fails if the id already
    /// exists.
    pub fn register(
        &self,
        request_id: &str,
        decoder: ResponseDecoder,
        expires_at_ms: u64,
    ) -> Result<oneshot::Receiver<Result<AnyMessage, MessageBusError>>, MessageBusError> {
        match self.entries.entry(request_id.to_string()) {
            Entry::Occupied(_) => Err(MessageBusError::configuration(format!(
                "request id '{request_id}' is already pending"
            ))),
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                vacant.insert(PendingEntry {
                    decoder,
                    tx,
                    expires_at_ms,
                });
                Ok(rx)
            }
        }
    }

    /// Complete an awaiter with a response payload or a remote fault. A
    /// late response for an unknown id is a no-op.
    pub fn resolve(&self, request_id: &str, result: Result<&[u8], &str>) {
        let Some((_, entry)) = self.entries.remove(request_id) else {
            tracing::debug!(request_id, "response for unknown request id (late?)");
            return;
        };
        let outcome = match result {
            Ok(payload) => (entry.decoder)(payload).map_err(MessageBusError::Serialization),
            Err(text) => Err(MessageBusError::RemoteFault(text.to_string())),
        };
        let _ = entry.tx.send(outcome);
    }

    /// Complete an awaiter with a cancellation error.
    pub fn cancel(&self, request_id: &str) {
        if let Some((_, entry)) = self.entries.remove(request_id) {
            let _ = entry.tx.send(Err(MessageBusError::Cancelled));
        }
    }

    /// Fault every entry whose deadline has passed. Returns how many were
    /// reaped.
    pub fn reap_expired(&self, now_ms: u64) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().expires_at_ms <= now_ms)
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for request_id in expired {
            if let Some((_, entry)) = self.entries.remove(&request_id) {
                let _ = entry.tx.send(Err(MessageBusError::RequestTimeout { request_id }));
                reaped += 1;
            }
        }
        reaped
    }

    /// Fault every remaining entry; called when the bus stops.
    pub fn cancel_all(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for request_id in ids {
            self.cancel(&request_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
