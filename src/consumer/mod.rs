//! Consumer-side model: endpoint topology, the per-invocation consumer
//! context, and the erased/typed application target traits.
//!
//! An [`EndpointDescriptor`] binds a transport path to an ordered list of
//! subscribers. Descriptors are immutable after startup; the builder
//! rejects topologies the dispatch engine cannot serve (no subscribers,
//! more than one request handler for the same request type).

use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use derive_builder::Builder;
use tokio_util::sync::CancellationToken;
use validator::{Validate, ValidationError};

use crate::AnyMessage;
use crate::error::MessageBusError;
use crate::headers::Headers;
use crate::transport::TransportMessage;

pub mod checkpoint;
pub mod partition;
pub mod processor;

pub use checkpoint::{CheckpointPolicy, CheckpointTrigger};
pub use partition::{PartitionProcessor, PartitionRouter};
pub use processor::{MessageProcessor, ProcessOutcome};

/// What the transport path is on the broker side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Subscription,
    Queue,
    StreamPartition,
    Direct,
}

/// Policy when the resolved message type matches no subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UndeclaredPolicy {
    #[default]
    Ignore,
    Fail,
}

/// One subscriber registered on an endpoint: a declared message type bound
/// to a target factory key, with dispatch options.
#[derive(Debug, Clone)]
pub struct SubscriberSettings {
    pub message_type: TypeId,
    pub message_type_name: &'static str,
    /// Factory key resolved through the service locator.
    pub target_key: String,
    /// `Some` marks a request handler producing this response type.
    pub response_type: Option<TypeId>,
    /// Resolve the target from a fresh scope per inbound message.
    pub per_message_scope: bool,
    /// Pool size when the target is resolved from the ambient locator.
    pub instances: usize,
    pub checkpoint: Option<CheckpointPolicy>,
}

impl SubscriberSettings {
    pub fn consumer<M: 'static>(target_key: impl Into<String>) -> Self {
        Self {
            message_type: TypeId::of::<M>(),
            message_type_name: std::any::type_name::<M>(),
            target_key: target_key.into(),
            response_type: None,
            per_message_scope: false,
            instances: 1,
            checkpoint: None,
        }
    }

    pub fn handler<Req: 'static, Resp: 'static>(target_key: impl Into<String>) -> Self {
        Self {
            response_type: Some(TypeId::of::<Resp>()),
            ..Self::consumer::<Req>(target_key)
        }
    }

    pub fn with_per_message_scope(mut self) -> Self {
        self.per_message_scope = true;
        self
    }

    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances.max(1);
        self
    }

    pub fn with_checkpoint(mut self, policy: CheckpointPolicy) -> Self {
        self.checkpoint = Some(policy);
        self
    }

    pub fn is_handler(&self) -> bool {
        self.response_type.is_some()
    }
}

/// An endpoint: a broker path plus its ordered subscribers. Fixed after
/// startup.
#[derive(Debug, Clone, Builder, Validate)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
pub struct EndpointDescriptor {
    #[builder(setter(into))]
    #[validate(custom(function = validate_path_chars))]
    pub path: String,

    #[builder(default = "EndpointKind::Subscription")]
    pub kind: EndpointKind,

    /// Consumer-group / subscription identifier.
    #[builder(default, setter(into, strip_option))]
    pub group: Option<String>,

    #[builder(default)]
    pub subscribers: Vec<Arc<SubscriberSettings>>,

    #[builder(default)]
    pub undeclared_policy: UndeclaredPolicy,
}

impl EndpointDescriptor {
    pub fn builder() -> EndpointDescriptorBuilder {
        EndpointDescriptorBuilder::default()
    }
}

impl EndpointDescriptorBuilder {
    /// Append a subscriber; dispatch order is registration order.
    pub fn subscriber(mut self, settings: SubscriberSettings) -> Self {
        self.subscribers
            .get_or_insert_with(Vec::new)
            .push(Arc::new(settings));
        self
    }

    pub fn build(self) -> Result<EndpointDescriptor, MessageBusError> {
        let endpoint = self
            .build_internal()
            .map_err(|e| MessageBusError::configuration(e.to_string()))?;
        endpoint
            .validate()
            .map_err(|e| MessageBusError::configuration(format!("endpoint path: {e}")))?;

        if endpoint.subscribers.is_empty() {
            return Err(MessageBusError::configuration(format!(
                "endpoint '{}' declares no subscribers",
                endpoint.path
            )));
        }

        // One request handler per request type; concurrent responses to the
        // same request would be ambiguous.
        let mut handler_types: Vec<TypeId> = Vec::new();
        for subscriber in endpoint.subscribers.iter().filter(|s| s.is_handler()) {
            if handler_types.contains(&subscriber.message_type) {
                return Err(MessageBusError::configuration(format!(
                    "endpoint '{}' declares more than one request handler for message type '{}'",
                    endpoint.path, subscriber.message_type_name
                )));
            }
            handler_types.push(subscriber.message_type);
        }

        Ok(endpoint)
    }
}

fn validate_path_chars(input: &str) -> Result<(), ValidationError> {
    let valid = !input.is_empty()
        && input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_characters"))
    }
}

/// Per-invocation context handed to the target alongside the message.
/// Created when dispatch begins; discarded when the handler returns.
pub struct ConsumerContext {
    /// Endpoint path the message arrived on.
    pub path: String,
    /// Cancelled when the owning partition is revoked or closed.
    pub cancellation: CancellationToken,
    /// Decoded inbound headers, read-only.
    pub headers: Headers,
    /// The instantiated consumer object handling this invocation.
    pub consumer: Option<Arc<dyn MessageTarget>>,
    /// The raw transport message, opaque to the core.
    pub transport_message: Arc<TransportMessage>,
}

/// An application consumer or request handler, erased. Consumers return
/// `None`; request handlers return the response object.
#[async_trait]
pub trait MessageTarget: Send + Sync {
    async fn on_handle(&self, message: AnyMessage, ctx: &ConsumerContext)
    -> Result<Option<AnyMessage>>;
}

/// Typed fire-and-forget consumer.
#[async_trait]
pub trait Consumer<M>: Send + Sync {
    async fn on_handle(&self, message: Arc<M>, ctx: &ConsumerContext) -> Result<()>;
}

/// Typed request handler.
#[async_trait]
pub trait RequestHandler<Req, Resp>: Send + Sync {
    async fn on_handle(&self, request: Arc<Req>, ctx: &ConsumerContext) -> Result<Resp>;
}

/// Adapts a typed [`Consumer`] into an erased [`MessageTarget`].
pub struct ConsumerAdapter<M, C> {
    consumer: C,
    _marker: PhantomData<fn() -> M>,
}

impl<M, C> ConsumerAdapter<M, C>
where
    M: Send + Sync + 'static,
    C: Consumer<M> + 'static,
{
    pub fn new(consumer: C) -> Self {
        Self {
            consumer,
            _marker: PhantomData,
        }
    }

    pub fn arc(consumer: C) -> Arc<dyn MessageTarget> {
        Arc::new(Self::new(consumer))
    }
}

#[async_trait]
impl<M, C> MessageTarget for ConsumerAdapter<M, C>
where
    M: Send + Sync + 'static,
    C: Consumer<M> + 'static,
{
    async fn on_handle(
        &self,
        message: AnyMessage,
        ctx: &ConsumerContext,
    ) -> Result<Option<AnyMessage>> {
        let typed = message.downcast::<M>().map_err(|_| {
            anyhow::anyhow!(
                "consumer expected message of type {}",
                std::any::type_name::<M>()
            )
        })?;
        self.consumer.on_handle(typed, ctx).await?;
        Ok(None)
    }
}

/// Adapts a typed [`RequestHandler`] into an erased [`MessageTarget`].
pub struct HandlerAdapter<Req, Resp, H> {
    handler: H,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, H> HandlerAdapter<Req, Resp, H>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
    H: RequestHandler<Req, Resp> + 'static,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }

    pub fn arc(handler: H) -> Arc<dyn MessageTarget> {
        Arc::new(Self::new(handler))
    }
}

#[async_trait]
impl<Req, Resp, H> MessageTarget for HandlerAdapter<Req, Resp, H>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
    H: RequestHandler<Req, Resp> + 'static,
{
    async fn on_handle(
        &self,
        message: AnyMessage,
        ctx: &ConsumerContext,
    ) -> Result<Option<AnyMessage>> {
        let typed = message.downcast::<Req>().map_err(|_| {
            anyhow::anyhow!(
                "handler expected request of type {}",
                std::any::type_name::<Req>()
            )
        })?;
        let response = self.handler.on_handle(typed, ctx).await?;
        Ok(Some(Arc::new(response) as AnyMessage))
    }
}
