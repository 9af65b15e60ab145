//! Requester-side plumbing: request id generation and the pending request
//! store that correlates responses back to their awaiters.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

mod store;
pub use store::{PendingRequestStore, ResponseDecoder};

/// Issues request identifiers. Ids only need to be unique within one bus
/// lifetime.
pub trait RequestIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Default generator: 128-bit random ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidRequestIdGenerator;

impl RequestIdGenerator for UuidRequestIdGenerator {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Monotonic counter ids, readable in test assertions.
#[derive(Debug, Default)]
pub struct SequentialRequestIdGenerator {
    counter: AtomicU64,
}

impl RequestIdGenerator for SequentialRequestIdGenerator {
    fn next_id(&self) -> String {
        format!("r-{}", self.counter.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sequential_ids_are_distinct() {
        let generator = SequentialRequestIdGenerator::default();
        assert_eq!(generator.next_id(), "r-0");
        assert_eq!(generator.next_id(), "r-1");
    }

    #[tokio::test]
    async fn test_concurrent_ids_are_distinct() {
        let generator = Arc::new(UuidRequestIdGenerator);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let generator = generator.clone();
            tasks.push(tokio::spawn(async move {
                (0..64).map(|_| generator.next_id()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id), "request id issued twice");
            }
        }
    }
}
