//! Publish/subscribe over the loopback transport: delivery, per-partition
//! ordering, and interceptor composition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use omnibus::consumer::{Consumer, ConsumerAdapter, ConsumerContext, EndpointDescriptor,
    SubscriberSettings};
use omnibus::headers::Headers;
use omnibus::interceptor::{ConsumerChain, ConsumerInterceptor, ProducerChain,
    ProducerInterceptor};
use omnibus::locator::StaticLocator;
use omnibus::transport::MemoryTransport;
use omnibus::{AnyMessage, MessageBus, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TickEvent {
    sequence: u64,
}

struct OrderRecorder {
    seen: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl Consumer<TickEvent> for OrderRecorder {
    async fn on_handle(&self, message: Arc<TickEvent>, _ctx: &ConsumerContext) -> Result<()> {
        self.seen.lock().push(message.sequence);
        Ok(())
    }
}

struct TraceRecorder {
    label: &'static str,
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ConsumerInterceptor for TraceRecorder {
    async fn on_handle(
        &self,
        ctx: &ConsumerContext,
        message: AnyMessage,
        next: ConsumerChain<'_>,
    ) -> Result<Option<AnyMessage>> {
        self.events.lock().push(format!("{}.pre", self.label));
        let result = next.run(ctx, message).await;
        self.events.lock().push(format!("{}.post", self.label));
        result
    }
}

struct StampingProducer;

#[async_trait]
impl ProducerInterceptor for StampingProducer {
    async fn on_handle(
        &self,
        message: AnyMessage,
        mut headers: Headers,
        next: ProducerChain<'_>,
    ) -> Result<()> {
        headers.insert("stamped", true);
        next.run(message, headers).await
    }
}

struct TracingConsumer {
    events: Arc<Mutex<Vec<String>>>,
    stamped: Arc<Mutex<Vec<bool>>>,
}

#[async_trait]
impl Consumer<TickEvent> for TracingConsumer {
    async fn on_handle(&self, _message: Arc<TickEvent>, ctx: &ConsumerContext) -> Result<()> {
        self.events.lock().push("target".to_string());
        self.stamped
            .lock()
            .push(ctx.headers.get("stamped").is_some());
        Ok(())
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within two seconds");
}

#[tokio::test]
async fn test_publish_preserves_partition_order() {
    let transport = Arc::new(MemoryTransport::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let locator = Arc::new(StaticLocator::new());
    locator.register(
        "recorder",
        ConsumerAdapter::arc(OrderRecorder { seen: seen.clone() }),
    );

    let builder = MessageBus::builder()
        .transport(transport)
        .locator(locator)
        .produce_route::<TickEvent>("ticks")
        .endpoint(
            EndpointDescriptor::builder()
                .path("ticks")
                .subscriber(SubscriberSettings::consumer::<TickEvent>("recorder"))
                .build()
                .unwrap(),
        );
    builder.registry().register_named::<TickEvent>("TickEvent");
    let bus = builder.build().unwrap();
    bus.start().await.unwrap();

    for sequence in 0..20 {
        bus.publish(TickEvent { sequence }).await.unwrap();
    }

    wait_until(|| seen.lock().len() == 20).await;
    let observed = seen.lock().clone();
    assert_eq!(observed, (0..20).collect::<Vec<_>>());

    bus.stop().await;
}

#[tokio::test]
async fn test_interceptors_wrap_target_in_registration_order() {
    let transport = Arc::new(MemoryTransport::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let stamped = Arc::new(Mutex::new(Vec::new()));

    let locator = Arc::new(StaticLocator::new());
    locator.register(
        "tracing",
        ConsumerAdapter::arc(TracingConsumer {
            events: events.clone(),
            stamped: stamped.clone(),
        }),
    );

    let builder = MessageBus::builder()
        .transport(transport)
        .locator(locator)
        .produce_route::<TickEvent>("ticks")
        .producer_interceptor::<TickEvent>(Arc::new(StampingProducer))
        .consumer_interceptor::<TickEvent>(Arc::new(TraceRecorder {
            label: "A",
            events: events.clone(),
        }))
        .consumer_interceptor::<TickEvent>(Arc::new(TraceRecorder {
            label: "B",
            events: events.clone(),
        }))
        .endpoint(
            EndpointDescriptor::builder()
                .path("ticks")
                .subscriber(SubscriberSettings::consumer::<TickEvent>("tracing"))
                .build()
                .unwrap(),
        );
    builder.registry().register_named::<TickEvent>("TickEvent");
    let bus = builder.build().unwrap();
    bus.start().await.unwrap();

    bus.publish(TickEvent { sequence: 1 }).await.unwrap();

    wait_until(|| events.lock().len() == 5).await;
    assert_eq!(
        events.lock().clone(),
        vec!["A.pre", "B.pre", "target", "B.post", "A.post"]
    );
    // The producer interceptor ran before the transport send.
    assert_eq!(stamped.lock().clone(), vec![true]);

    bus.stop().await;
}

#[tokio::test]
async fn test_commits_recorded_through_loopback() {
    let transport = Arc::new(MemoryTransport::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let locator = Arc::new(StaticLocator::new());
    locator.register(
        "recorder",
        ConsumerAdapter::arc(OrderRecorder { seen: seen.clone() }),
    );

    let builder = MessageBus::builder()
        .transport(transport.clone())
        .locator(locator)
        .produce_route::<TickEvent>("ticks")
        .endpoint(
            EndpointDescriptor::builder()
                .path("ticks")
                .group("g1")
                .subscriber(
                    SubscriberSettings::consumer::<TickEvent>("recorder").with_checkpoint(
                        omnibus::consumer::CheckpointPolicy::new(5, Duration::from_secs(60)),
                    ),
                )
                .build()
                .unwrap(),
        );
    builder.registry().register_named::<TickEvent>("TickEvent");
    let bus = builder.build().unwrap();
    bus.start().await.unwrap();

    for sequence in 0..10 {
        bus.publish(TickEvent { sequence }).await.unwrap();
    }

    wait_until(|| seen.lock().len() == 10).await;
    wait_until(|| transport.committed("ticks") == Some(omnibus::transport::Offset(9))).await;

    bus.stop().await;
}
