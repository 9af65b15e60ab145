//! Per-message dispatch engine.
//!
//! For one inbound transport message: resolve the concrete message type,
//! select the matching subscribers, materialize the payload, run the
//! interceptor chain around each target, and produce responses for request
//! handlers. Dispatch errors are captured in the outcome and never
//! propagate to the transport layer; the partition processor decides what
//! to do with them. This engine never retries.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::AnyMessage;
use crate::error::MessageBusError;
use crate::headers::{Headers, well_known};
use crate::interceptor::{ConsumerChain, InterceptorRegistry};
use crate::locator::{ServiceLocator, ServiceScope};
use crate::registry::TypeRegistry;
use crate::serializer::PayloadCodec;
use crate::time::SharedClock;
use crate::transport::TransportMessage;

use super::{ConsumerContext, EndpointDescriptor, MessageTarget, SubscriberSettings,
    UndeclaredPolicy};

/// Emits a response message on the caller's reply channel; implemented by
/// the bus facade.
#[async_trait]
pub trait ResponseProducer: Send + Sync {
    async fn produce_response(
        &self,
        request: Option<&AnyMessage>,
        request_headers: &Headers,
        response: Option<&AnyMessage>,
        response_headers: Headers,
        settings: &SubscriberSettings,
    ) -> Result<()>;
}

/// Result tuple of one `process_message` call.
#[derive(Default)]
pub struct ProcessOutcome {
    /// Last dispatch error, if any subscriber faulted and the fault did not
    /// travel back as an error response.
    pub error: Option<MessageBusError>,
    /// Subscriber settings for error reporting.
    pub settings: Option<Arc<SubscriberSettings>>,
    /// First handler response, surfaced only when responses are not sent.
    pub response: Option<AnyMessage>,
    /// The materialized message object, returned regardless of outcome.
    pub payload: Option<AnyMessage>,
}

struct TargetPool {
    targets: Vec<Arc<dyn MessageTarget>>,
    cursor: AtomicUsize,
}

impl TargetPool {
    fn next(&self) -> Arc<dyn MessageTarget> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.targets.len();
        self.targets[index].clone()
    }
}

pub struct MessageProcessor {
    endpoint: Arc<EndpointDescriptor>,
    registry: Arc<TypeRegistry>,
    interceptors: Arc<InterceptorRegistry>,
    locator: Arc<dyn ServiceLocator>,
    clock: SharedClock,
    codec: PayloadCodec,
    responder: Option<Weak<dyn ResponseProducer>>,
    /// When false, handler responses are surfaced in the outcome instead of
    /// emitted (in-process dispatch and tests).
    send_responses: bool,
    pools: DashMap<String, TargetPool>,
}

impl MessageProcessor {
    pub fn new(
        endpoint: Arc<EndpointDescriptor>,
        registry: Arc<TypeRegistry>,
        interceptors: Arc<InterceptorRegistry>,
        locator: Arc<dyn ServiceLocator>,
        clock: SharedClock,
        codec: PayloadCodec,
    ) -> Self {
        Self {
            endpoint,
            registry,
            interceptors,
            locator,
            clock,
            codec,
            responder: None,
            send_responses: true,
            pools: DashMap::new(),
        }
    }

    pub fn with_responder(mut self, responder: Weak<dyn ResponseProducer>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn with_send_responses(mut self, send_responses: bool) -> Self {
        self.send_responses = send_responses;
        self
    }

    pub fn endpoint(&self) -> &Arc<EndpointDescriptor> {
        &self.endpoint
    }

    /// Dispatch one inbound message to every matching subscriber, in
    /// registration order.
    pub async fn process_message(
        &self,
        message: Arc<TransportMessage>,
        headers: &Headers,
        cancellation: CancellationToken,
    ) -> ProcessOutcome {
        // Resolve the concrete message type: the MessageType header if
        // present, else the first subscriber's declared type.
        let resolved = match headers.message_type() {
            Some(wire_name) => self.registry.resolve_wire_name(wire_name),
            None => self
                .endpoint
                .subscribers
                .first()
                .map(|subscriber| subscriber.message_type),
        };

        let matching: Vec<Arc<SubscriberSettings>> = resolved
            .map(|resolved| {
                self.endpoint
                    .subscribers
                    .iter()
                    .filter(|s| self.registry.is_assignable(resolved, s.message_type))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if matching.is_empty() {
            let wire_name = headers.message_type().unwrap_or("<none>");
            return match self.endpoint.undeclared_policy {
                UndeclaredPolicy::Fail => ProcessOutcome {
                    error: Some(MessageBusError::UndeclaredMessageType {
                        message_type: wire_name.to_string(),
                        path: self.endpoint.path.clone(),
                    }),
                    ..Default::default()
                },
                UndeclaredPolicy::Ignore => {
                    tracing::debug!(
                        path = %self.endpoint.path,
                        message_type = wire_name,
                        "ignoring message of undeclared type"
                    );
                    ProcessOutcome::default()
                }
            };
        }
        let resolved = resolved.expect("matching subscribers imply a resolved type");

        // Materialize the payload; the object is returned in the outcome
        // regardless of what happens next.
        let Some(entry) = self.registry.entry(resolved) else {
            return ProcessOutcome {
                error: Some(MessageBusError::Serialization(anyhow::anyhow!(
                    "resolved message type is not registered on this bus"
                ))),
                settings: matching.first().cloned(),
                ..Default::default()
            };
        };
        let payload = match (entry.decode)(&self.codec, &message.payload) {
            Ok(payload) => payload,
            Err(source) => {
                return ProcessOutcome {
                    error: Some(MessageBusError::Serialization(source)),
                    settings: matching.first().cloned(),
                    ..Default::default()
                };
            }
        };

        let now_ms = self.clock.now_ms();
        let reply_headers_present =
            headers.reply_to().is_some() && headers.request_id().is_some();

        // One resolution scope is shared by all scoped subscribers of this
        // message; dropping it at the end of dispatch releases it on every
        // exit path.
        let mut scope: Option<Box<dyn ServiceScope>> = None;
        let mut last_error: Option<MessageBusError> = None;
        let mut error_settings: Option<Arc<SubscriberSettings>> = None;
        let mut first_response: Option<AnyMessage> = None;

        for settings in &matching {
            if cancellation.is_cancelled() {
                tracing::debug!(
                    path = %self.endpoint.path,
                    "cancellation requested; stopping dispatch"
                );
                break;
            }

            // An expired request counts as delivered, but the handler must
            // not run and no response is emitted.
            if settings.is_handler()
                && let Some(expires) = headers.expires()
                && expires <= now_ms
            {
                tracing::debug!(
                    path = %self.endpoint.path,
                    request_id = headers.request_id().unwrap_or("<none>"),
                    "request expired before dispatch; skipping handler"
                );
                continue;
            }

            let target = if settings.per_message_scope {
                let scope = scope.get_or_insert_with(|| self.locator.create_scope());
                scope.resolve(&settings.target_key)
            } else {
                self.pooled_target(settings)
            };
            let target = match target {
                Ok(target) => target,
                Err(source) => {
                    last_error = Some(MessageBusError::configuration(source.to_string()));
                    error_settings = Some(settings.clone());
                    continue;
                }
            };

            let ctx = ConsumerContext {
                path: self.endpoint.path.clone(),
                cancellation: cancellation.clone(),
                headers: headers.clone(),
                consumer: Some(target.clone()),
                transport_message: message.clone(),
            };

            let delivered = self
                .registry
                .coerce(&payload, resolved, settings.message_type)
                .unwrap_or_else(|| payload.clone());

            let slots =
                self.interceptors
                    .consumer_chain_for(&self.registry, resolved, settings.response_type);
            let chain = ConsumerChain::new(&slots, target.as_ref());
            let result = chain.run(&ctx, delivered).await;

            match result {
                Ok(response) => {
                    if settings.is_handler() {
                        if self.send_responses && reply_headers_present {
                            let mut out = Headers::new();
                            if let Some(request_id) = headers.request_id() {
                                out.insert(well_known::REQUEST_ID, request_id);
                            }
                            if let Err(source) = self
                                .respond(Some(&payload), headers, response.as_ref(), out, settings)
                                .await
                            {
                                last_error = Some(MessageBusError::Transport(source));
                                error_settings = Some(settings.clone());
                            }
                        } else if first_response.is_none() {
                            first_response = response;
                        }
                    }
                }
                Err(source) => {
                    if settings.is_handler() && self.send_responses && reply_headers_present {
                        // The fault travels back in the Error header; it is
                        // not surfaced in the outcome.
                        let mut out = Headers::new();
                        if let Some(request_id) = headers.request_id() {
                            out.insert(well_known::REQUEST_ID, request_id);
                        }
                        out.insert(well_known::ERROR, source.to_string());
                        if let Err(source) =
                            self.respond(Some(&payload), headers, None, out, settings).await
                        {
                            last_error = Some(MessageBusError::Transport(source));
                            error_settings = Some(settings.clone());
                        }
                    } else {
                        last_error = Some(MessageBusError::Handler(source));
                        error_settings = Some(settings.clone());
                    }
                }
            }
        }

        ProcessOutcome {
            error: last_error,
            settings: error_settings.or_else(|| matching.first().cloned()),
            response: first_response,
            payload: Some(payload),
        }
    }

    async fn respond(
        &self,
        request: Option<&AnyMessage>,
        request_headers: &Headers,
        response: Option<&AnyMessage>,
        response_headers: Headers,
        settings: &SubscriberSettings,
    ) -> Result<()> {
        let responder = self
            .responder
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| anyhow::anyhow!("bus facade is gone; cannot produce response"))?;
        responder
            .produce_response(request, request_headers, response, response_headers, settings)
            .await
    }

    /// Targets resolved from the ambient locator are pooled per endpoint
    /// (pool of size `instances`), round-robin.
    fn pooled_target(&self, settings: &SubscriberSettings) -> Result<Arc<dyn MessageTarget>> {
        if let Some(pool) = self.pools.get(&settings.target_key) {
            return Ok(pool.next());
        }
        let mut targets = Vec::with_capacity(settings.instances);
        for _ in 0..settings.instances {
            targets.push(self.locator.resolve(&settings.target_key)?);
        }
        let pool = TargetPool {
            targets,
            cursor: AtomicUsize::new(0),
        };
        let target = pool.next();
        self.pools.insert(settings.target_key.clone(), pool);
        Ok(target)
    }
}
