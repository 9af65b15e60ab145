//! Ordered interceptor pipeline.
//!
//! Interceptors compose around the produce path and the consume path in a
//! pull model: each interceptor receives the chain and decides whether to
//! advance it. A chain is one small state object over a slice iterator,
//! advanced exactly once per `run` call; the terminal action performs the
//! transport produce or invokes the application target.

use std::any::TypeId;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::AnyMessage;
use crate::consumer::{ConsumerContext, MessageTarget};
use crate::headers::Headers;
use crate::registry::TypeRegistry;

/// Wraps the produce path. `on_handle` runs before the message reaches the
/// transport; code after `next.run(..).await` runs after the transport
/// acknowledged, in LIFO order of entry.
#[async_trait]
pub trait ProducerInterceptor: Send + Sync {
    async fn on_handle(
        &self,
        message: AnyMessage,
        headers: Headers,
        next: ProducerChain<'_>,
    ) -> Result<()>;
}

/// Wraps the consume path around the application target. Returning without
/// calling `next.run` short-circuits the dispatch; the returned value takes
/// the place of the handler response.
#[async_trait]
pub trait ConsumerInterceptor: Send + Sync {
    async fn on_handle(
        &self,
        ctx: &ConsumerContext,
        message: AnyMessage,
        next: ConsumerChain<'_>,
    ) -> Result<Option<AnyMessage>>;
}

/// Terminal action of the producer chain; implemented by the bus facade.
#[async_trait]
pub(crate) trait ProducerTerminal: Send + Sync {
    async fn produce(&self, message: AnyMessage, headers: Headers) -> Result<()>;
}

pub struct ProducerChain<'a> {
    interceptors: std::slice::Iter<'a, Arc<dyn ProducerInterceptor>>,
    terminal: &'a dyn ProducerTerminal,
}

impl<'a> ProducerChain<'a> {
    pub(crate) fn new(
        interceptors: &'a [Arc<dyn ProducerInterceptor>],
        terminal: &'a dyn ProducerTerminal,
    ) -> Self {
        Self {
            interceptors: interceptors.iter(),
            terminal,
        }
    }

    /// Advance to the next interceptor, or produce when exhausted.
    pub fn run(mut self, message: AnyMessage, headers: Headers) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self.interceptors.next() {
                Some(interceptor) => interceptor.on_handle(message, headers, self).await,
                None => self.terminal.produce(message, headers).await,
            }
        })
    }
}

pub struct ConsumerChain<'a> {
    interceptors: std::slice::Iter<'a, Arc<dyn ConsumerInterceptor>>,
    target: &'a dyn MessageTarget,
}

impl<'a> ConsumerChain<'a> {
    pub(crate) fn new(
        interceptors: &'a [Arc<dyn ConsumerInterceptor>],
        target: &'a dyn MessageTarget,
    ) -> Self {
        Self {
            interceptors: interceptors.iter(),
            target,
        }
    }

    /// Advance to the next interceptor, or invoke the target when exhausted.
    pub fn run(
        mut self,
        ctx: &'a ConsumerContext,
        message: AnyMessage,
    ) -> BoxFuture<'a, Result<Option<AnyMessage>>> {
        Box::pin(async move {
            match self.interceptors.next() {
                Some(interceptor) => interceptor.on_handle(ctx, message, self).await,
                None => self.target.on_handle(message, ctx).await,
            }
        })
    }
}

type ConsumerSlot = (TypeId, Option<TypeId>, Arc<dyn ConsumerInterceptor>);

/// Registered interceptor slots, ordered by registration. The chain for a
/// resolved message type is computed against the type graph and cached;
/// registration happens before the bus starts, so the caches never go
/// stale.
pub struct InterceptorRegistry {
    producers: Vec<(TypeId, Arc<dyn ProducerInterceptor>)>,
    consumers: Vec<ConsumerSlot>,
    producer_cache: DashMap<TypeId, Arc<Vec<Arc<dyn ProducerInterceptor>>>>,
    consumer_cache: DashMap<(TypeId, Option<TypeId>), Arc<Vec<Arc<dyn ConsumerInterceptor>>>>,
}

impl Default for InterceptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self {
            producers: Vec::new(),
            consumers: Vec::new(),
            producer_cache: DashMap::new(),
            consumer_cache: DashMap::new(),
        }
    }

    /// Register a producer interceptor for messages assignable to `M`.
    pub fn add_producer<M: 'static>(&mut self, interceptor: Arc<dyn ProducerInterceptor>) {
        self.producers.push((TypeId::of::<M>(), interceptor));
    }

    /// Register a consumer interceptor for messages assignable to `M`.
    pub fn add_consumer<M: 'static>(&mut self, interceptor: Arc<dyn ConsumerInterceptor>) {
        self.consumers
            .push((TypeId::of::<M>(), None, interceptor));
    }

    /// Register a handler-side interceptor for the `(request, response)`
    /// pair; it only joins chains dispatching to a handler with that
    /// response type.
    pub fn add_handler<Req: 'static, Resp: 'static>(
        &mut self,
        interceptor: Arc<dyn ConsumerInterceptor>,
    ) {
        self.consumers.push((
            TypeId::of::<Req>(),
            Some(TypeId::of::<Resp>()),
            interceptor,
        ));
    }

    pub(crate) fn producer_chain_for(
        &self,
        registry: &TypeRegistry,
        message_type: TypeId,
    ) -> Arc<Vec<Arc<dyn ProducerInterceptor>>> {
        if let Some(cached) = self.producer_cache.get(&message_type) {
            return cached.clone();
        }
        let chain: Arc<Vec<_>> = Arc::new(
            self.producers
                .iter()
                .filter(|(declared, _)| registry.is_assignable(message_type, *declared))
                .map(|(_, interceptor)| interceptor.clone())
                .collect(),
        );
        self.producer_cache.insert(message_type, chain.clone());
        chain
    }

    pub(crate) fn consumer_chain_for(
        &self,
        registry: &TypeRegistry,
        message_type: TypeId,
        response_type: Option<TypeId>,
    ) -> Arc<Vec<Arc<dyn ConsumerInterceptor>>> {
        let key = (message_type, response_type);
        if let Some(cached) = self.consumer_cache.get(&key) {
            return cached.clone();
        }
        let chain: Arc<Vec<_>> = Arc::new(
            self.consumers
                .iter()
                .filter(|(declared, declared_resp, _)| {
                    registry.is_assignable(message_type, *declared)
                        && (declared_resp.is_none() || *declared_resp == response_type)
                })
                .map(|(_, _, interceptor)| interceptor.clone())
                .collect(),
        );
        self.consumer_cache.insert(key, chain.clone());
        chain
    }
}
