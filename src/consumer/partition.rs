//! Per-partition lifecycle: assign, consume, checkpoint, revoke, close.
//!
//! One partition processes at most one message at a time; higher throughput
//! comes from more partitions, never from parallelizing within one. Each
//! assignment owns a fresh cancellation source covering all in-flight work
//! on the partition.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::headers::Headers;
use crate::time::SharedClock;
use crate::transport::{Committer, Offset, TransportEvents, TransportMessage};

use super::checkpoint::{CheckpointPolicy, CheckpointTrigger};
use super::processor::MessageProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Unassigned,
    Assigned,
    Running,
    Revoked,
    Closed,
}

struct PartitionCore {
    state: PartitionState,
    trigger: Option<CheckpointTrigger>,
    last_seen: Option<Offset>,
    last_committed: Option<Offset>,
    cancel: CancellationToken,
}

pub struct PartitionProcessor {
    path: String,
    partition: u32,
    processor: Arc<MessageProcessor>,
    committer: Arc<dyn Committer>,
    clock: SharedClock,
    policy: Option<CheckpointPolicy>,
    /// Held for the duration of one dispatch; revoke acquires it to await
    /// in-flight completion.
    dispatch: tokio::sync::Mutex<()>,
    core: parking_lot::Mutex<PartitionCore>,
}

impl PartitionProcessor {
    pub fn new(
        partition: u32,
        processor: Arc<MessageProcessor>,
        committer: Arc<dyn Committer>,
        clock: SharedClock,
        policy: Option<CheckpointPolicy>,
    ) -> Self {
        let path = processor.endpoint().path.clone();
        Self {
            path,
            partition,
            processor,
            committer,
            clock,
            policy,
            dispatch: tokio::sync::Mutex::new(()),
            core: parking_lot::Mutex::new(PartitionCore {
                state: PartitionState::Unassigned,
                trigger: None,
                last_seen: None,
                last_committed: None,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> PartitionState {
        self.core.lock().state
    }

    pub fn last_committed(&self) -> Option<Offset> {
        self.core.lock().last_committed
    }

    /// Partition handed to this consumer: reset progress tracking and arm a
    /// fresh cancellation source.
    pub fn on_assigned(&self) {
        let mut core = self.core.lock();
        core.state = PartitionState::Assigned;
        core.trigger = self
            .policy
            .map(|policy| CheckpointTrigger::new(policy, self.clock.clone()));
        core.last_seen = None;
        core.last_committed = None;
        core.cancel = CancellationToken::new();
        tracing::debug!(path = %self.path, partition = self.partition, "partition assigned");
    }

    /// Process one message. Dropped silently when cancellation was already
    /// requested; dispatch errors are logged and the offset still advances.
    pub async fn on_message(&self, message: TransportMessage) {
        let cancel = self.core.lock().cancel.clone();
        if cancel.is_cancelled() {
            tracing::trace!(
                path = %self.path,
                partition = self.partition,
                offset = %message.offset,
                "dropping message after cancellation"
            );
            return;
        }

        let _in_flight = self.dispatch.lock().await;
        let offset = message.offset;
        {
            let mut core = self.core.lock();
            core.state = PartitionState::Running;
            core.last_seen = Some(offset);
        }

        let headers = Headers::decode(&message.headers);
        let message = Arc::new(message);
        let outcome = self
            .processor
            .process_message(message, &headers, cancel)
            .await;
        if let Some(error) = &outcome.error {
            let subscriber = outcome
                .settings
                .as_ref()
                .map(|s| s.message_type_name)
                .unwrap_or("<unmatched>");
            tracing::warn!(
                path = %self.path,
                partition = self.partition,
                offset = %offset,
                subscriber,
                %error,
                "message dispatch faulted; advancing"
            );
        }

        let due = {
            let mut core = self.core.lock();
            core.trigger.as_mut().is_some_and(|t| t.increment())
        };
        if due {
            self.commit(offset).await;
        }
    }

    /// Catch-up completion on log transports.
    pub async fn on_end_reached(&self, offset: Offset) {
        if self.policy.is_some() {
            self.commit(offset).await;
        }
    }

    /// Partition taken away: cancel in-flight work and await its drain; do
    /// not commit, another consumer resumes from the last checkpoint.
    pub async fn on_revoked(&self) {
        self.core.lock().cancel.cancel();
        let _drained = self.dispatch.lock().await;
        self.core.lock().state = PartitionState::Revoked;
        tracing::debug!(path = %self.path, partition = self.partition, "partition revoked");
    }

    /// Orderly close: best-effort commit at the last seen offset, then
    /// cancel.
    pub async fn on_closed(&self) {
        let last_seen = self.core.lock().last_seen;
        if let Some(offset) = last_seen {
            self.commit(offset).await;
        }
        let mut core = self.core.lock();
        core.cancel.cancel();
        core.state = PartitionState::Closed;
        tracing::debug!(path = %self.path, partition = self.partition, "partition closed");
    }

    /// Monotonic commit: a no-op at or below the last committed offset.
    pub async fn commit(&self, offset: Offset) {
        {
            let mut core = self.core.lock();
            if core.last_committed.is_some_and(|committed| offset <= committed) {
                return;
            }
            core.last_committed = Some(offset);
            if let Some(trigger) = core.trigger.as_mut() {
                trigger.reset();
            }
        }
        if let Err(error) = self.committer.commit(offset).await {
            tracing::error!(
                path = %self.path,
                partition = self.partition,
                offset = %offset,
                %error,
                "commit failed"
            );
        }
    }
}

/// Fans the transport's callbacks out to one [`PartitionProcessor`] per
/// assigned partition. The checkpoint policy is taken from the endpoint's
/// subscribers (validated identical at startup).
pub struct PartitionRouter {
    processor: Arc<MessageProcessor>,
    clock: SharedClock,
    policy: Option<CheckpointPolicy>,
    partitions: DashMap<u32, Arc<PartitionProcessor>>,
}

impl PartitionRouter {
    pub fn new(processor: Arc<MessageProcessor>, clock: SharedClock) -> Self {
        let policy = processor
            .endpoint()
            .subscribers
            .iter()
            .find_map(|s| s.checkpoint);
        Self {
            processor,
            clock,
            policy,
            partitions: DashMap::new(),
        }
    }
}

#[async_trait]
impl TransportEvents for PartitionRouter {
    async fn on_assigned(&self, partition: u32, committer: Arc<dyn Committer>) {
        let processor = Arc::new(PartitionProcessor::new(
            partition,
            self.processor.clone(),
            committer,
            self.clock.clone(),
            self.policy,
        ));
        processor.on_assigned();
        self.partitions.insert(partition, processor);
    }

    async fn on_message(&self, partition: u32, message: TransportMessage) {
        let Some(processor) = self.partitions.get(&partition).map(|p| p.clone()) else {
            tracing::warn!(partition, "message for unassigned partition");
            return;
        };
        processor.on_message(message).await;
    }

    async fn on_end_reached(&self, partition: u32, offset: Offset) {
        if let Some(processor) = self.partitions.get(&partition).map(|p| p.clone()) {
            processor.on_end_reached(offset).await;
        }
    }

    async fn on_revoked(&self, partition: u32) {
        if let Some((_, processor)) = self.partitions.remove(&partition) {
            processor.on_revoked().await;
        }
    }

    async fn on_closed(&self, partition: u32) {
        if let Some((_, processor)) = self.partitions.remove(&partition) {
            processor.on_closed().await;
        }
    }

    fn on_error(&self, error: anyhow::Error) {
        tracing::error!(path = %self.processor.endpoint().path, %error, "transport error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerContext, EndpointDescriptor, MessageTarget,
        SubscriberSettings};
    use crate::interceptor::InterceptorRegistry;
    use crate::locator::StaticLocator;
    use crate::registry::TypeRegistry;
    use crate::serializer::PayloadCodec;
    use crate::time::ManualClock;
    use crate::{AnyMessage, Result};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TickEvent {
        sequence: u64,
    }

    struct TickConsumer {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageTarget for TickConsumer {
        async fn on_handle(
            &self,
            _message: AnyMessage,
            _ctx: &ConsumerContext,
        ) -> Result<Option<AnyMessage>> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[derive(Default)]
    struct RecordingCommitter {
        commits: parking_lot::Mutex<Vec<Offset>>,
    }

    #[async_trait]
    impl Committer for RecordingCommitter {
        async fn commit(&self, offset: Offset) -> anyhow::Result<()> {
            self.commits.lock().push(offset);
            Ok(())
        }
    }

    struct Fixture {
        partition: PartitionProcessor,
        committer: Arc<RecordingCommitter>,
        invocations: Arc<AtomicUsize>,
        clock: Arc<ManualClock>,
    }

    fn fixture(policy: Option<CheckpointPolicy>) -> Fixture {
        let registry = Arc::new(TypeRegistry::new());
        registry.register_named::<TickEvent>("TickEvent");

        let invocations = Arc::new(AtomicUsize::new(0));
        let locator = Arc::new(StaticLocator::new());
        locator.register(
            "tick",
            Arc::new(TickConsumer {
                invocations: invocations.clone(),
            }),
        );

        let mut settings = SubscriberSettings::consumer::<TickEvent>("tick");
        if let Some(policy) = policy {
            settings = settings.with_checkpoint(policy);
        }
        let endpoint = EndpointDescriptor::builder()
            .path("ticks")
            .group("g1")
            .subscriber(settings)
            .build()
            .unwrap();

        let clock = Arc::new(ManualClock::new(0));
        let processor = Arc::new(MessageProcessor::new(
            Arc::new(endpoint),
            registry,
            Arc::new(InterceptorRegistry::new()),
            locator,
            clock.clone(),
            PayloadCodec::default(),
        ));

        let committer = Arc::new(RecordingCommitter::default());
        let partition =
            PartitionProcessor::new(0, processor, committer.clone(), clock.clone(), policy);
        Fixture {
            partition,
            committer,
            invocations,
            clock,
        }
    }

    fn message(sequence: u64) -> TransportMessage {
        TransportMessage {
            payload: PayloadCodec::default()
                .encode(&TickEvent { sequence })
                .unwrap(),
            headers: Default::default(),
            offset: Offset(sequence),
        }
    }

    #[tokio::test]
    async fn test_commit_cadence_and_close() {
        let policy = CheckpointPolicy::new(10, Duration::from_secs(60));
        let fixture = fixture(Some(policy));
        fixture.partition.on_assigned();

        for sequence in 0..25 {
            fixture.partition.on_message(message(sequence)).await;
        }
        fixture.partition.on_closed().await;

        assert_eq!(fixture.invocations.load(Ordering::SeqCst), 25);
        let commits = fixture.committer.commits.lock().clone();
        // Messages #10 and #20 carry offsets 9 and 19; close commits #25.
        assert_eq!(commits, vec![Offset(9), Offset(19), Offset(24)]);
        assert!(commits.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(fixture.partition.state(), PartitionState::Closed);
    }

    #[tokio::test]
    async fn test_commit_on_elapsed_window() {
        let policy = CheckpointPolicy::new(1_000, Duration::from_millis(500));
        let fixture = fixture(Some(policy));
        fixture.partition.on_assigned();

        fixture.partition.on_message(message(0)).await;
        assert!(fixture.committer.commits.lock().is_empty());

        fixture.clock.advance(500);
        fixture.partition.on_message(message(1)).await;
        assert_eq!(*fixture.committer.commits.lock(), vec![Offset(1)]);
    }

    #[tokio::test]
    async fn test_commit_is_monotonic() {
        let fixture = fixture(None);
        fixture.partition.on_assigned();

        fixture.partition.commit(Offset(5)).await;
        fixture.partition.commit(Offset(3)).await;
        fixture.partition.commit(Offset(5)).await;
        fixture.partition.commit(Offset(7)).await;

        assert_eq!(*fixture.committer.commits.lock(), vec![Offset(5), Offset(7)]);
        assert_eq!(fixture.partition.last_committed(), Some(Offset(7)));
    }

    #[tokio::test]
    async fn test_revoke_cancels_without_commit() {
        let policy = CheckpointPolicy::new(100, Duration::from_secs(60));
        let fixture = fixture(Some(policy));
        fixture.partition.on_assigned();

        fixture.partition.on_message(message(0)).await;
        fixture.partition.on_revoked().await;

        assert!(fixture.committer.commits.lock().is_empty());
        assert_eq!(fixture.partition.state(), PartitionState::Revoked);

        // Messages after revoke are dropped silently.
        fixture.partition.on_message(message(1)).await;
        assert_eq!(fixture.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_end_reached_commits_when_trigger_configured() {
        let policy = CheckpointPolicy::new(100, Duration::from_secs(60));
        let fixture = fixture(Some(policy));
        fixture.partition.on_assigned();

        fixture.partition.on_end_reached(Offset(12)).await;
        assert_eq!(*fixture.committer.commits.lock(), vec![Offset(12)]);
    }

    #[tokio::test]
    async fn test_end_reached_is_noop_without_trigger() {
        let fixture = fixture(None);
        fixture.partition.on_assigned();

        fixture.partition.on_end_reached(Offset(12)).await;
        assert!(fixture.committer.commits.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reassignment_resets_progress() {
        let fixture = fixture(None);
        fixture.partition.on_assigned();
        fixture.partition.commit(Offset(9)).await;
        fixture.partition.on_revoked().await;

        fixture.partition.on_assigned();
        assert_eq!(fixture.partition.state(), PartitionState::Assigned);
        assert_eq!(fixture.partition.last_committed(), None);

        // After reassignment lower offsets commit again.
        fixture.partition.commit(Offset(2)).await;
        assert_eq!(*fixture.committer.commits.lock(), vec![Offset(9), Offset(2)]);
    }
}
