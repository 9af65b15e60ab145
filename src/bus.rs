//! Bus facade.
//!
//! Hosts the declared endpoints, owns the pending request store and the
//! reaper, and exposes the public operations: `publish`, `send`, `start`,
//! `stop`. Response production for request handlers flows back through the
//! facade onto the caller's reply channel.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::AnyMessage;
use crate::config::BusConfig;
use crate::consumer::processor::ResponseProducer;
use crate::consumer::{EndpointDescriptor, MessageProcessor, PartitionRouter, SubscriberSettings,
    checkpoint};
use crate::error::MessageBusError;
use crate::headers::{Headers, well_known};
use crate::interceptor::{ConsumerInterceptor, InterceptorRegistry, ProducerChain,
    ProducerInterceptor, ProducerTerminal};
use crate::locator::{ServiceLocator, StaticLocator};
use crate::registry::{MessageTypeEntry, TypeRegistry};
use crate::request::{PendingRequestStore, RequestIdGenerator, ResponseDecoder,
    UuidRequestIdGenerator};
use crate::serializer::PayloadCodec;
use crate::time::{SharedClock, SystemClock};
use crate::transport::{Committer, ConsumerTransport, Offset, ProducerTransport, TransportEvents,
    TransportMessage};

/// Options for a fire-and-forget produce.
#[derive(Default)]
pub struct ProduceOptions {
    /// Override the declared produce route.
    pub path: Option<String>,
    /// Extra headers merged into the outbound message.
    pub headers: Headers,
}

/// Options for a request/response send.
#[derive(Default)]
pub struct SendOptions {
    pub path: Option<String>,
    /// Per-call timeout; falls back to the bus default.
    pub timeout: Option<Duration>,
    /// External cancellation; cancels the pending entry when triggered.
    pub cancellation: Option<CancellationToken>,
    pub headers: Headers,
}

pub struct MessageBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: BusConfig,
    registry: Arc<TypeRegistry>,
    interceptors: Arc<InterceptorRegistry>,
    codec: PayloadCodec,
    locator: Arc<dyn ServiceLocator>,
    clock: SharedClock,
    producer: Arc<dyn ProducerTransport>,
    consumer_transport: Option<Arc<dyn ConsumerTransport>>,
    endpoints: Vec<Arc<EndpointDescriptor>>,
    produce_routes: HashMap<TypeId, String>,
    pending: Arc<PendingRequestStore>,
    request_ids: Arc<dyn RequestIdGenerator>,
    reply_path: Option<String>,
    root_token: CancellationToken,
    started: AtomicBool,
}

impl MessageBus {
    pub fn builder() -> MessageBusBuilder {
        MessageBusBuilder::new()
    }

    /// Fire-and-forget produce on the message type's declared route.
    /// Returns when the transport acknowledges.
    pub async fn publish<T: Send + Sync + 'static>(
        &self,
        message: T,
    ) -> Result<(), MessageBusError> {
        self.publish_with(message, ProduceOptions::default()).await
    }

    pub async fn publish_with<T: Send + Sync + 'static>(
        &self,
        message: T,
        options: ProduceOptions,
    ) -> Result<(), MessageBusError> {
        let inner = &self.inner;
        let entry = inner.entry_of::<T>()?;
        let path = inner.route_for(entry.type_id, options.path)?;

        let mut headers = options.headers;
        headers.insert(well_known::MESSAGE_TYPE, entry.wire_name.clone());

        let message: AnyMessage = Arc::new(message);
        inner.produce(&path, message, headers, &entry).await
    }

    /// Send a request and await its correlated response. Faults with the
    /// first of cancellation, timeout, remote error, or transport error.
    pub async fn send<Req, Resp>(&self, request: Req) -> Result<Resp, MessageBusError>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        self.send_with(request, SendOptions::default()).await
    }

    pub async fn send_with<Req, Resp>(
        &self,
        request: Req,
        options: SendOptions,
    ) -> Result<Resp, MessageBusError>
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
    {
        let inner = &self.inner;
        let request_entry = inner.entry_of::<Req>()?;
        let response_entry = inner.entry_of::<Resp>()?;
        let reply_path = inner.reply_path.clone().ok_or_else(|| {
            MessageBusError::configuration("no reply path configured; request/response disabled")
        })?;
        let path = inner.route_for(request_entry.type_id, options.path)?;

        let timeout = options
            .timeout
            .unwrap_or_else(|| inner.config.default_request_timeout());
        let expires_at_ms = inner.clock.now_ms() + timeout.as_millis() as u64;
        let request_id = inner.request_ids.next_id();

        let codec = inner.codec;
        let decode = response_entry.decode.clone();
        let decoder: ResponseDecoder = Arc::new(move |payload: &[u8]| decode(&codec, payload));
        let receiver = inner.pending.register(&request_id, decoder, expires_at_ms)?;

        let mut headers = options.headers;
        headers.insert(well_known::MESSAGE_TYPE, request_entry.wire_name.clone());
        headers.insert(well_known::REQUEST_ID, request_id.clone());
        headers.insert(well_known::REPLY_TO, reply_path);
        headers.insert(well_known::EXPIRES, expires_at_ms);

        let message: AnyMessage = Arc::new(request);
        if let Err(error) = inner.produce(&path, message, headers, &request_entry).await {
            inner.pending.cancel(&request_id);
            return Err(error);
        }

        let external = options.cancellation.unwrap_or_default();
        let outcome = tokio::select! {
            _ = external.cancelled() => {
                inner.pending.cancel(&request_id);
                return Err(MessageBusError::Cancelled);
            }
            _ = inner.root_token.cancelled() => {
                inner.pending.cancel(&request_id);
                return Err(MessageBusError::Cancelled);
            }
            outcome = receiver => outcome,
        };

        let message = match outcome {
            Ok(result) => result?,
            // The store was dropped from under the awaiter.
            Err(_) => return Err(MessageBusError::Cancelled),
        };
        let response = message.downcast::<Resp>().map_err(|_| {
            MessageBusError::Serialization(anyhow::anyhow!(
                "correlated response is not a {}",
                std::any::type_name::<Resp>()
            ))
        })?;
        Arc::try_unwrap(response).map_err(|_| {
            MessageBusError::Serialization(anyhow::anyhow!("response object still shared"))
        })
    }

    /// Number of in-flight requests awaiting responses.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Start consuming: spawns the reaper and subscribes every declared
    /// endpoint plus the reply channel.
    pub async fn start(&self) -> Result<(), MessageBusError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(MessageBusError::configuration("bus already started"));
        }

        inner.spawn_reaper();

        let Some(consumer_transport) = inner.consumer_transport.clone() else {
            return Ok(());
        };

        let responder: Weak<dyn ResponseProducer> = {
            let strong: Arc<dyn ResponseProducer> = self.inner.clone();
            Arc::downgrade(&strong)
        };

        for endpoint in &inner.endpoints {
            let processor = Arc::new(
                MessageProcessor::new(
                    endpoint.clone(),
                    inner.registry.clone(),
                    inner.interceptors.clone(),
                    inner.locator.clone(),
                    inner.clock.clone(),
                    inner.codec,
                )
                .with_responder(responder.clone()),
            );
            let router = Arc::new(PartitionRouter::new(processor, inner.clock.clone()));
            consumer_transport
                .subscribe(&endpoint.path, endpoint.group.as_deref(), router)
                .await
                .map_err(MessageBusError::Transport)?;
            tracing::info!(path = %endpoint.path, group = ?endpoint.group, "endpoint consuming");
        }

        // The reply listener holds only the store, so it cannot keep the
        // bus alive.
        if let Some(reply_path) = &inner.reply_path {
            let listener = Arc::new(ReplyListener {
                pending: inner.pending.clone(),
            });
            consumer_transport
                .subscribe(reply_path, None, listener)
                .await
                .map_err(MessageBusError::Transport)?;
            tracing::info!(path = %reply_path, "reply channel consuming");
        }
        Ok(())
    }

    /// Stop: cancel the root token, stop the transport (draining
    /// partitions), and fault every pending request.
    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.root_token.cancel();
        if let Some(transport) = &inner.consumer_transport
            && let Err(error) = transport.stop().await
        {
            tracing::warn!(%error, "consumer transport stop failed");
        }
        inner.pending.cancel_all();
        inner.started.store(false, Ordering::SeqCst);
        tracing::info!("bus stopped");
    }
}

impl BusInner {
    fn entry_of<T: 'static>(&self) -> Result<Arc<MessageTypeEntry>, MessageBusError> {
        self.registry.entry(TypeId::of::<T>()).ok_or_else(|| {
            MessageBusError::configuration(format!(
                "message type {} is not registered on this bus",
                std::any::type_name::<T>()
            ))
        })
    }

    fn route_for(
        &self,
        type_id: TypeId,
        explicit: Option<String>,
    ) -> Result<String, MessageBusError> {
        explicit
            .or_else(|| self.produce_routes.get(&type_id).cloned())
            .ok_or_else(|| {
                MessageBusError::configuration("no produce route declared for message type")
            })
    }

    /// Producer path: interceptors in order, then serialize and hand to the
    /// transport. Fails fast once the bus is shutting down.
    async fn produce(
        &self,
        path: &str,
        message: AnyMessage,
        headers: Headers,
        entry: &Arc<MessageTypeEntry>,
    ) -> Result<(), MessageBusError> {
        if self.root_token.is_cancelled() {
            return Err(MessageBusError::Cancelled);
        }
        let slots = self
            .interceptors
            .producer_chain_for(&self.registry, entry.type_id);
        let terminal = ProduceTerminal {
            inner: self,
            path,
            entry,
        };
        let chain = ProducerChain::new(&slots, &terminal);
        chain.run(message, headers).await.map_err(|error| {
            match error.downcast::<MessageBusError>() {
                Ok(bus_error) => bus_error,
                Err(error) => MessageBusError::Transport(error),
            }
        })
    }

    fn spawn_reaper(&self) {
        let pending = self.pending.clone();
        let clock = self.clock.clone();
        let token = self.root_token.clone();
        let interval = self.config.reaper_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let reaped = pending.reap_expired(clock.now_ms());
                        if reaped > 0 {
                            tracing::debug!(reaped, "reaped expired requests");
                        }
                    }
                }
            }
        });
    }
}

struct ProduceTerminal<'a> {
    inner: &'a BusInner,
    path: &'a str,
    entry: &'a Arc<MessageTypeEntry>,
}

#[async_trait]
impl ProducerTerminal for ProduceTerminal<'_> {
    async fn produce(&self, message: AnyMessage, headers: Headers) -> Result<()> {
        let payload = (self.entry.encode)(&self.inner.codec, &message)
            .map_err(|e| anyhow::Error::new(MessageBusError::Serialization(e)))?;
        self.inner
            .producer
            .send(self.path, payload, headers.encode())
            .await
            .map_err(|e| anyhow::Error::new(MessageBusError::Transport(e)))
    }
}

#[async_trait]
impl ResponseProducer for BusInner {
    async fn produce_response(
        &self,
        _request: Option<&AnyMessage>,
        request_headers: &Headers,
        response: Option<&AnyMessage>,
        response_headers: Headers,
        settings: &SubscriberSettings,
    ) -> Result<()> {
        let reply_to = request_headers
            .reply_to()
            .ok_or_else(|| anyhow::anyhow!("request carries no reply-to header"))?;

        let payload = match response {
            Some(message) => {
                let response_type = settings
                    .response_type
                    .ok_or_else(|| anyhow::anyhow!("subscriber is not a request handler"))?;
                let entry = self.registry.entry(response_type).ok_or_else(|| {
                    anyhow::anyhow!("response type is not registered on this bus")
                })?;
                (entry.encode)(&self.codec, message)?
            }
            // Fault responses travel with an empty body and the Error
            // header.
            None => Bytes::new(),
        };
        self.producer
            .send(reply_to, payload, response_headers.encode())
            .await
    }
}

/// Synthetic subscriber on the reply channel: correlates inbound responses
/// back to the pending request store.
struct ReplyListener {
    pending: Arc<PendingRequestStore>,
}

#[async_trait]
impl TransportEvents for ReplyListener {
    async fn on_assigned(&self, _partition: u32, _committer: Arc<dyn Committer>) {}

    async fn on_message(&self, _partition: u32, message: TransportMessage) {
        let headers = Headers::decode(&message.headers);
        let Some(request_id) = headers.request_id() else {
            tracing::warn!("response without a request id; dropping");
            return;
        };
        match headers.error() {
            Some(text) => self.pending.resolve(request_id, Err(text)),
            None => self.pending.resolve(request_id, Ok(&message.payload[..])),
        }
    }

    async fn on_end_reached(&self, _partition: u32, _offset: Offset) {}

    async fn on_revoked(&self, _partition: u32) {}

    async fn on_closed(&self, _partition: u32) {}

    fn on_error(&self, error: anyhow::Error) {
        tracing::error!(%error, "reply channel transport error");
    }
}

pub struct MessageBusBuilder {
    config: BusConfig,
    registry: Arc<TypeRegistry>,
    interceptors: InterceptorRegistry,
    codec: PayloadCodec,
    locator: Arc<dyn ServiceLocator>,
    clock: SharedClock,
    producer_transport: Option<Arc<dyn ProducerTransport>>,
    consumer_transport: Option<Arc<dyn ConsumerTransport>>,
    endpoints: Vec<Arc<EndpointDescriptor>>,
    produce_routes: HashMap<TypeId, String>,
    request_ids: Arc<dyn RequestIdGenerator>,
    reply_path: Option<String>,
}

impl Default for MessageBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBusBuilder {
    pub fn new() -> Self {
        Self {
            config: BusConfig::default(),
            registry: Arc::new(TypeRegistry::new()),
            interceptors: InterceptorRegistry::new(),
            codec: PayloadCodec::default(),
            locator: Arc::new(StaticLocator::new()),
            clock: Arc::new(SystemClock),
            producer_transport: None,
            consumer_transport: None,
            endpoints: Vec::new(),
            produce_routes: HashMap::new(),
            request_ids: Arc::new(UuidRequestIdGenerator),
            reply_path: None,
        }
    }

    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// The registry message types are registered against.
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn with_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn codec(mut self, codec: PayloadCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn locator(mut self, locator: Arc<dyn ServiceLocator>) -> Self {
        self.locator = locator;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Use one adapter for both the produce and consume sides.
    pub fn transport<T>(mut self, transport: Arc<T>) -> Self
    where
        T: ProducerTransport + ConsumerTransport + 'static,
    {
        self.producer_transport = Some(transport.clone());
        self.consumer_transport = Some(transport);
        self
    }

    pub fn producer_transport(mut self, transport: Arc<dyn ProducerTransport>) -> Self {
        self.producer_transport = Some(transport);
        self
    }

    pub fn consumer_transport(mut self, transport: Arc<dyn ConsumerTransport>) -> Self {
        self.consumer_transport = Some(transport);
        self
    }

    pub fn endpoint(mut self, endpoint: EndpointDescriptor) -> Self {
        self.endpoints.push(Arc::new(endpoint));
        self
    }

    /// Declare the path messages of type `T` are produced to.
    pub fn produce_route<T: 'static>(mut self, path: impl Into<String>) -> Self {
        self.produce_routes.insert(TypeId::of::<T>(), path.into());
        self
    }

    /// Reply channel this bus awaits responses on.
    pub fn reply_path(mut self, path: impl Into<String>) -> Self {
        self.reply_path = Some(path.into());
        self
    }

    pub fn request_id_generator(mut self, generator: Arc<dyn RequestIdGenerator>) -> Self {
        self.request_ids = generator;
        self
    }

    pub fn producer_interceptor<M: 'static>(
        mut self,
        interceptor: Arc<dyn ProducerInterceptor>,
    ) -> Self {
        self.interceptors.add_producer::<M>(interceptor);
        self
    }

    pub fn consumer_interceptor<M: 'static>(
        mut self,
        interceptor: Arc<dyn ConsumerInterceptor>,
    ) -> Self {
        self.interceptors.add_consumer::<M>(interceptor);
        self
    }

    pub fn handler_interceptor<Req: 'static, Resp: 'static>(
        mut self,
        interceptor: Arc<dyn ConsumerInterceptor>,
    ) -> Self {
        self.interceptors.add_handler::<Req, Resp>(interceptor);
        self
    }

    pub fn build(self) -> Result<MessageBus, MessageBusError> {
        checkpoint::validate_checkpoint_consistency(&self.endpoints)?;

        let producer = self.producer_transport.ok_or_else(|| {
            MessageBusError::configuration("a producer transport is required")
        })?;
        if self.consumer_transport.is_none()
            && (!self.endpoints.is_empty() || self.reply_path.is_some())
        {
            return Err(MessageBusError::configuration(
                "a consumer transport is required to host endpoints or a reply channel",
            ));
        }

        Ok(MessageBus {
            inner: Arc::new(BusInner {
                config: self.config,
                registry: self.registry,
                interceptors: Arc::new(self.interceptors),
                codec: self.codec,
                locator: self.locator,
                clock: self.clock,
                producer,
                consumer_transport: self.consumer_transport,
                endpoints: self.endpoints,
                produce_routes: self.produce_routes,
                pending: Arc::new(PendingRequestStore::new()),
                request_ids: self.request_ids,
                reply_path: self.reply_path,
                root_token: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        })
    }
}
